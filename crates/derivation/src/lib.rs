use std::collections::{HashMap, HashSet};
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use types::{
    round_to, MeasureKind, Measurement, MeasurementKey, DERIVED_CATEGORY, SUB_CHANNEL_NONE,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DerivationError {
    #[error("required input {0} not present this cycle")]
    LookupMiss(Lookup),
    #[error("derived {0} value is not finite")]
    NonFinite(MeasureKind),
    #[error("invalid derivation rule {identity}: {reason}")]
    InvalidRule { identity: String, reason: String },
}

/// Exact-match reference to one measurement of the current cycle.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub device_identity: String,
    pub sub_channel: Option<String>,
    pub kind: MeasureKind,
}

impl Lookup {
    pub fn new(
        device_identity: impl Into<String>,
        sub_channel: Option<&str>,
        kind: MeasureKind,
    ) -> Self {
        Self {
            device_identity: device_identity.into(),
            sub_channel: sub_channel.map(str::to_string),
            kind,
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.device_identity,
            self.sub_channel.as_deref().unwrap_or(SUB_CHANNEL_NONE),
            self.kind
        )
    }
}

/// Overall sign applied to `sum(sources) - sum(sinks)`.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sign {
    #[default]
    Positive,
    Negative,
}

impl Sign {
    fn apply(self, value: f64) -> f64 {
        match self {
            Sign::Positive => value,
            Sign::Negative => -value,
        }
    }
}

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(tag = "mode", rename_all = "snake_case"))]
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedOutput {
    Combine {
        kind: MeasureKind,
        sources: Vec<Lookup>,
        #[cfg_attr(feature = "config", serde(default))]
        sinks: Vec<Lookup>,
        #[cfg_attr(feature = "config", serde(default))]
        sign: Sign,
    },
    /// Copies one reference measurement unchanged, e.g. bus voltage.
    PassThrough { kind: MeasureKind, from: Lookup },
}

impl DerivedOutput {
    pub fn kind(&self) -> &MeasureKind {
        match self {
            DerivedOutput::Combine { kind, .. } => kind,
            DerivedOutput::PassThrough { kind, .. } => kind,
        }
    }
}

/// A synthetic device whose measurements are computed from other devices.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct DerivationRule {
    pub identity: String,
    pub display_name: String,
    pub sku: String,
    pub sub_channel: Option<String>,
    pub outputs: Vec<DerivedOutput>,
}

impl DerivationRule {
    /// Net system load: current and power are `sign * (sources - sinks)`
    /// on the primary channel, voltage is taken from `reference`.
    pub fn net_load(
        identity: impl Into<String>,
        display_name: impl Into<String>,
        sku: impl Into<String>,
        sources: &[&str],
        sinks: &[&str],
        reference: &str,
        sign: Sign,
    ) -> Self {
        let primary = |device: &str, kind: MeasureKind| Lookup::new(device, Some("primary"), kind);
        let combine = |kind: MeasureKind| DerivedOutput::Combine {
            kind: kind.clone(),
            sources: sources.iter().map(|d| primary(*d, kind.clone())).collect(),
            sinks: sinks.iter().map(|d| primary(*d, kind.clone())).collect(),
            sign,
        };

        Self {
            identity: identity.into(),
            display_name: display_name.into(),
            sku: sku.into(),
            sub_channel: Some("primary".to_string()),
            outputs: vec![
                combine(MeasureKind::Current),
                combine(MeasureKind::Power),
                DerivedOutput::PassThrough {
                    kind: MeasureKind::Voltage,
                    from: primary(reference, MeasureKind::Voltage),
                },
            ],
        }
    }

    pub fn validate(&self) -> Result<(), DerivationError> {
        let invalid = |reason: String| DerivationError::InvalidRule {
            identity: self.identity.clone(),
            reason,
        };

        if self.identity.trim().is_empty() {
            return Err(invalid("identity must be non-empty".to_string()));
        }
        if self.outputs.is_empty() {
            return Err(invalid("at least one output is required".to_string()));
        }

        let mut kinds = HashSet::new();
        for output in &self.outputs {
            if !kinds.insert(output.kind().clone()) {
                return Err(invalid(format!("output {} declared twice", output.kind())));
            }
            if let DerivedOutput::Combine { kind, sources, .. } = output {
                if sources.is_empty() {
                    return Err(invalid(format!("output {kind} has no sources")));
                }
            }
        }
        Ok(())
    }

    fn measurement(&self, kind: &MeasureKind, value: f64) -> Result<Measurement, DerivationError> {
        let value = round_to(value, kind.default_precision())
            .ok_or_else(|| DerivationError::NonFinite(kind.clone()))?;
        Ok(Measurement {
            device_identity: self.identity.clone(),
            category_label: DERIVED_CATEGORY.to_string(),
            display_name: self.display_name.clone(),
            sku: self.sku.clone(),
            measure_kind: kind.clone(),
            sub_channel: self.sub_channel.clone(),
            value,
        })
    }
}

/// Keyed view over one cycle's measurements. The first occurrence of a key
/// wins.
pub struct MeasurementIndex<'a> {
    values: HashMap<MeasurementKey<'a>, f64>,
}

impl<'a> MeasurementIndex<'a> {
    pub fn new(measurements: &'a [Measurement]) -> Self {
        let mut values = HashMap::with_capacity(measurements.len());
        for measurement in measurements {
            values.entry(measurement.key()).or_insert(measurement.value);
        }
        Self { values }
    }

    pub fn resolve(&self, lookup: &Lookup) -> Option<f64> {
        let key = MeasurementKey {
            device_identity: &lookup.device_identity,
            sub_channel: lookup.sub_channel.as_deref(),
            measure_kind: &lookup.kind,
        };
        self.values.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn evaluate(
    index: &MeasurementIndex<'_>,
    output: &DerivedOutput,
) -> Result<f64, DerivationError> {
    let resolve = |lookup: &Lookup| {
        index
            .resolve(lookup)
            .ok_or_else(|| DerivationError::LookupMiss(lookup.clone()))
    };

    let value = match output {
        DerivedOutput::Combine {
            sources,
            sinks,
            sign,
            ..
        } => {
            let mut total = 0.0;
            for lookup in sources {
                total += resolve(lookup)?;
            }
            for lookup in sinks {
                total -= resolve(lookup)?;
            }
            sign.apply(total)
        }
        DerivedOutput::PassThrough { from, .. } => resolve(from)?,
    };

    if !value.is_finite() {
        return Err(DerivationError::NonFinite(output.kind().clone()));
    }
    Ok(value)
}

/// Computes every derived output whose inputs are all present in
/// `measurements`. Missing inputs skip only the affected output.
pub fn derive(measurements: &[Measurement], rules: &[DerivationRule]) -> Vec<Measurement> {
    let index = MeasurementIndex::new(measurements);
    let mut out = Vec::new();

    for rule in rules {
        for output in &rule.outputs {
            let derived = evaluate(&index, output)
                .and_then(|value| rule.measurement(output.kind(), value));
            match derived {
                Ok(measurement) => out.push(measurement),
                Err(err) => {
                    warn!(
                        derived = %rule.identity,
                        kind = %output.kind(),
                        error = %err,
                        "skipping derived output"
                    );
                }
            }
        }
    }

    debug!(inputs = index.len(), derived = out.len(), "derivation complete");
    out
}
