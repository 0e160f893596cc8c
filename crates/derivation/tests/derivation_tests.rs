use derivation::{
    derive, evaluate, DerivationError, DerivationRule, DerivedOutput, Lookup, MeasurementIndex,
    Sign,
};
use types::{MeasureKind, Measurement};

fn reading(identity: &str, kind: MeasureKind, value: f64) -> Measurement {
    Measurement {
        device_identity: identity.to_string(),
        category_label: "battery-shunt".to_string(),
        display_name: "RBM500".to_string(),
        sku: "RSHST-B02P300".to_string(),
        measure_kind: kind,
        sub_channel: Some("primary".to_string()),
        value,
    }
}

fn load_rule(sign: Sign) -> DerivationRule {
    DerivationRule::net_load(
        "derived-system-load",
        "RNG-SYST",
        "RNG-SYST",
        &["shnt-258", "mppt-914"],
        &["shnt-071"],
        "shnt-071",
        sign,
    )
}

fn cycle() -> Vec<Measurement> {
    vec![
        reading("shnt-258", MeasureKind::Current, 10.0),
        reading("mppt-914", MeasureKind::Current, 5.0),
        reading("shnt-071", MeasureKind::Current, 3.0),
        reading("shnt-258", MeasureKind::Power, 130.0),
        reading("mppt-914", MeasureKind::Power, 66.5),
        reading("shnt-071", MeasureKind::Power, 39.25),
        reading("shnt-071", MeasureKind::Voltage, 13.08),
    ]
}

fn value_of(out: &[Measurement], kind: MeasureKind) -> Option<f64> {
    out.iter().find(|m| m.measure_kind == kind).map(|m| m.value)
}

#[test]
fn net_load_is_sources_minus_sinks() {
    let out = derive(&cycle(), &[load_rule(Sign::Positive)]);
    assert_eq!(out.len(), 3);
    assert_eq!(value_of(&out, MeasureKind::Current), Some(12.0));
    assert_eq!(value_of(&out, MeasureKind::Power), Some(157.25));
    assert_eq!(value_of(&out, MeasureKind::Voltage), Some(13.08));

    for measurement in &out {
        assert_eq!(measurement.device_identity, "derived-system-load");
        assert_eq!(measurement.category_label, "derived");
        assert_eq!(measurement.sub_channel.as_deref(), Some("primary"));
    }
}

#[test]
fn negative_sign_convention_flips_combined_outputs_only() {
    let out = derive(&cycle(), &[load_rule(Sign::Negative)]);
    assert_eq!(value_of(&out, MeasureKind::Current), Some(-12.0));
    assert_eq!(value_of(&out, MeasureKind::Power), Some(-157.25));
    assert_eq!(value_of(&out, MeasureKind::Voltage), Some(13.08));
}

#[test]
fn missing_sink_current_skips_only_that_output() {
    let measurements: Vec<Measurement> = cycle()
        .into_iter()
        .filter(|m| !(m.device_identity == "shnt-071" && m.measure_kind == MeasureKind::Current))
        .collect();

    let out = derive(&measurements, &[load_rule(Sign::Positive)]);
    assert_eq!(value_of(&out, MeasureKind::Current), None);
    assert_eq!(value_of(&out, MeasureKind::Power), Some(157.25));
    assert_eq!(value_of(&out, MeasureKind::Voltage), Some(13.08));
}

#[test]
fn lookup_miss_names_the_missing_input() {
    let measurements = vec![reading("shnt-258", MeasureKind::Current, 10.0)];
    let index = MeasurementIndex::new(&measurements);
    let output = DerivedOutput::Combine {
        kind: MeasureKind::Current,
        sources: vec![Lookup::new("shnt-258", Some("primary"), MeasureKind::Current)],
        sinks: vec![Lookup::new("shnt-071", Some("primary"), MeasureKind::Current)],
        sign: Sign::Positive,
    };

    let err = evaluate(&index, &output).expect_err("sink missing");
    assert_eq!(
        err,
        DerivationError::LookupMiss(Lookup::new("shnt-071", Some("primary"), MeasureKind::Current))
    );
    assert_eq!(
        err.to_string(),
        "required input shnt-071/primary/current not present this cycle"
    );
}

#[test]
fn lookups_match_sub_channel_exactly() {
    let mut solar = reading("mppt-914", MeasureKind::Current, 8.0);
    solar.sub_channel = Some("solar".to_string());
    let measurements = vec![solar];
    let index = MeasurementIndex::new(&measurements);

    assert_eq!(
        index.resolve(&Lookup::new("mppt-914", Some("primary"), MeasureKind::Current)),
        None
    );
    assert_eq!(
        index.resolve(&Lookup::new("mppt-914", Some("solar"), MeasureKind::Current)),
        Some(8.0)
    );
}

#[test]
fn derived_values_are_rounded() {
    let measurements = vec![
        reading("a", MeasureKind::Current, 0.1),
        reading("b", MeasureKind::Current, 0.2),
    ];
    let rule = DerivationRule {
        identity: "derived-sum".to_string(),
        display_name: "SUM".to_string(),
        sku: "SUM".to_string(),
        sub_channel: None,
        outputs: vec![DerivedOutput::Combine {
            kind: MeasureKind::Current,
            sources: vec![
                Lookup::new("a", Some("primary"), MeasureKind::Current),
                Lookup::new("b", Some("primary"), MeasureKind::Current),
            ],
            sinks: Vec::new(),
            sign: Sign::Positive,
        }],
    };

    let out = derive(&measurements, &[rule]);
    assert_eq!(out[0].value, 0.3);
    assert_eq!(out[0].sub_channel, None);
}

#[test]
fn empty_cycle_derives_nothing() {
    assert!(derive(&[], &[load_rule(Sign::Positive)]).is_empty());
}

#[test]
fn validate_rejects_malformed_rules() {
    assert!(load_rule(Sign::Positive).validate().is_ok());

    let mut duplicate = load_rule(Sign::Positive);
    duplicate.outputs.push(duplicate.outputs[0].clone());
    assert!(matches!(
        duplicate.validate(),
        Err(DerivationError::InvalidRule { .. })
    ));

    let mut sourceless = load_rule(Sign::Positive);
    sourceless.outputs = vec![DerivedOutput::Combine {
        kind: MeasureKind::Current,
        sources: Vec::new(),
        sinks: Vec::new(),
        sign: Sign::Positive,
    }];
    assert!(sourceless.validate().is_err());
}

#[test]
fn output_that_overflows_when_rounded_is_skipped() {
    let mut measurements = cycle();
    measurements.retain(|m| m.measure_kind != MeasureKind::Voltage);
    measurements.push(reading("shnt-071", MeasureKind::Voltage, 1e305));

    let out = derive(&measurements, &[load_rule(Sign::Positive)]);
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|m| m.value.is_finite()));
    assert_eq!(value_of(&out, MeasureKind::Voltage), None);
    assert_eq!(value_of(&out, MeasureKind::Current), Some(12.0));
}
