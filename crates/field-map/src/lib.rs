use std::collections::HashSet;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use types::MeasureKind;

#[derive(Debug, Error)]
pub enum FieldMapError {
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid transform {0}")]
    InvalidTransform(String),
    #[error("invalid rule in category {category}: {reason}")]
    InvalidRule { category: String, reason: String },
    #[error("duplicate channel {channel} in category {category}")]
    DuplicateChannel { category: String, channel: String },
    #[error("duplicate category {0}")]
    DuplicateCategory(String),
}

/// Pure numeric unit transform, applied in declaration order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Scale(f64),
    Divide(f64),
    Offset(f64),
    CelsiusToFahrenheit,
}

impl Transform {
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Transform::Scale(factor) => value * factor,
            Transform::Divide(divisor) => value / divisor,
            Transform::Offset(offset) => value + offset,
            Transform::CelsiusToFahrenheit => value * 1.8 + 32.0,
        }
    }
}

pub fn apply_chain(transforms: &[Transform], value: f64) -> f64 {
    transforms
        .iter()
        .fold(value, |acc, transform| transform.apply(acc))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleField {
    pub field: String,
    pub kind: MeasureKind,
    pub sub_channel: Option<String>,
    pub transforms: Vec<Transform>,
    /// Overrides the kind's default precision.
    pub precision: Option<u32>,
}

impl SimpleField {
    pub fn new(field: impl Into<String>, kind: MeasureKind, sub_channel: Option<&str>) -> Self {
        Self {
            field: field.into(),
            kind,
            sub_channel: sub_channel.map(str::to_string),
            transforms: Vec::new(),
            precision: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInput {
    pub field: String,
    pub transforms: Vec<Transform>,
}

impl FieldInput {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            transforms: Vec::new(),
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    Product,
    Sum,
}

impl Combinator {
    pub fn combine(self, values: &[f64]) -> f64 {
        match self {
            Combinator::Product => values.iter().product(),
            Combinator::Sum => values.iter().sum(),
        }
    }
}

/// Several raw fields of one device combined into one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeField {
    pub inputs: Vec<FieldInput>,
    pub combinator: Combinator,
    pub kind: MeasureKind,
    pub sub_channel: Option<String>,
    pub precision: Option<u32>,
}

impl CompositeField {
    pub fn new(
        inputs: Vec<FieldInput>,
        combinator: Combinator,
        kind: MeasureKind,
        sub_channel: Option<&str>,
    ) -> Self {
        Self {
            inputs,
            combinator,
            kind,
            sub_channel: sub_channel.map(str::to_string),
            precision: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    Simple(SimpleField),
    Composite(CompositeField),
}

impl FieldRule {
    pub fn kind(&self) -> &MeasureKind {
        match self {
            FieldRule::Simple(rule) => &rule.kind,
            FieldRule::Composite(rule) => &rule.kind,
        }
    }

    pub fn sub_channel(&self) -> Option<&str> {
        match self {
            FieldRule::Simple(rule) => rule.sub_channel.as_deref(),
            FieldRule::Composite(rule) => rule.sub_channel.as_deref(),
        }
    }

    pub fn precision(&self) -> u32 {
        let precision = match self {
            FieldRule::Simple(rule) => rule.precision,
            FieldRule::Composite(rule) => rule.precision,
        };
        precision.unwrap_or_else(|| self.kind().default_precision())
    }
}

impl From<SimpleField> for FieldRule {
    fn from(rule: SimpleField) -> Self {
        FieldRule::Simple(rule)
    }
}

impl From<CompositeField> for FieldRule {
    fn from(rule: CompositeField) -> Self {
        FieldRule::Composite(rule)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRules {
    /// Category string as reported by the vendor inventory.
    pub vendor_category: String,
    /// Label written to measurements.
    pub label: String,
    /// Prefix of the short device identity, e.g. "mppt".
    pub identity_prefix: String,
    pub rules: Vec<FieldRule>,
}

/// Declarative allow-list from vendor fields to canonical measurements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable {
    categories: Vec<CategoryRules>,
}

impl FieldTable {
    pub fn new(categories: Vec<CategoryRules>) -> Result<Self, FieldMapError> {
        let mut seen_categories = HashSet::new();
        for category in &categories {
            if !seen_categories.insert(category.vendor_category.to_ascii_lowercase()) {
                return Err(FieldMapError::DuplicateCategory(
                    category.vendor_category.clone(),
                ));
            }
            validate_category(category)?;
        }
        Ok(Self { categories })
    }

    /// Vendor categories match case-insensitively.
    pub fn category(&self, vendor_category: &str) -> Option<&CategoryRules> {
        self.categories
            .iter()
            .find(|rules| rules.vendor_category.eq_ignore_ascii_case(vendor_category))
    }

    pub fn categories(&self) -> &[CategoryRules] {
        &self.categories
    }

    /// Built-in rules for Renogy charge controllers and battery shunts.
    ///
    /// Shunt firmware revisions report primary current under either `power`
    /// or `current`; the caller picks which one.
    pub fn renogy(shunt_current_field: &str) -> Self {
        let controller = CategoryRules {
            vendor_category: "Controller".to_string(),
            label: "controller".to_string(),
            identity_prefix: "mppt".to_string(),
            rules: vec![
                SimpleField::new("gridChargeAmps", MeasureKind::Current, Some("primary"))
                    .with_transform(Transform::Divide(1000.0))
                    .into(),
                SimpleField::new(
                    "auxiliaryBatteryChargingVolts",
                    MeasureKind::Voltage,
                    Some("primary"),
                )
                .into(),
                CompositeField::new(
                    vec![
                        FieldInput::new("gridChargeAmps").with_transform(Transform::Divide(1000.0)),
                        FieldInput::new("auxiliaryBatteryChargingVolts"),
                    ],
                    Combinator::Product,
                    MeasureKind::Power,
                    Some("primary"),
                )
                .into(),
                SimpleField::new("solarWatts", MeasureKind::Power, Some("solar")).into(),
                SimpleField::new("solarChargingVolts", MeasureKind::Voltage, Some("solar")).into(),
                SimpleField::new("solarChargingAmps", MeasureKind::Current, Some("solar")).into(),
                SimpleField::new("loadVolts", MeasureKind::Voltage, Some("load")).into(),
                SimpleField::new("loadAmps", MeasureKind::Current, Some("load")).into(),
                CompositeField::new(
                    vec![FieldInput::new("loadVolts"), FieldInput::new("loadAmps")],
                    Combinator::Product,
                    MeasureKind::Power,
                    Some("load"),
                )
                .into(),
                SimpleField::new("auxiliaryBatteryTemperature", MeasureKind::Temperature, None)
                    .with_transform(Transform::CelsiusToFahrenheit)
                    .into(),
            ],
        };

        let shunt = CategoryRules {
            vendor_category: "Battery Shunt".to_string(),
            label: "battery-shunt".to_string(),
            identity_prefix: "shnt".to_string(),
            rules: vec![
                SimpleField::new("batteryVolts", MeasureKind::Voltage, Some("primary")).into(),
                SimpleField::new(shunt_current_field, MeasureKind::Current, Some("primary"))
                    .into(),
                CompositeField::new(
                    vec![
                        FieldInput::new("batteryVolts"),
                        FieldInput::new(shunt_current_field),
                    ],
                    Combinator::Product,
                    MeasureKind::Power,
                    Some("primary"),
                )
                .into(),
            ],
        };

        Self {
            categories: vec![controller, shunt],
        }
    }
}

fn validate_category(category: &CategoryRules) -> Result<(), FieldMapError> {
    let invalid = |reason: &str| FieldMapError::InvalidRule {
        category: category.vendor_category.clone(),
        reason: reason.to_string(),
    };

    if category.identity_prefix.trim().is_empty() {
        return Err(invalid("identity prefix must be non-empty"));
    }

    let mut channels = HashSet::new();
    for rule in &category.rules {
        let transforms: Vec<&Transform> = match rule {
            FieldRule::Simple(simple) => {
                if simple.field.trim().is_empty() {
                    return Err(invalid("field name must be non-empty"));
                }
                simple.transforms.iter().collect()
            }
            FieldRule::Composite(composite) => {
                if composite.inputs.is_empty() {
                    return Err(invalid("composite rule needs at least one input"));
                }
                composite
                    .inputs
                    .iter()
                    .flat_map(|input| input.transforms.iter())
                    .collect()
            }
        };
        if transforms
            .iter()
            .any(|transform| matches!(transform, Transform::Divide(d) if *d == 0.0))
        {
            return Err(invalid("divide transform must not divide by zero"));
        }
        if rule.precision() > types::MAX_PRECISION {
            return Err(invalid(&format!(
                "precision {} exceeds {}",
                rule.precision(),
                types::MAX_PRECISION
            )));
        }

        let channel = (rule.sub_channel().map(str::to_string), rule.kind().clone());
        if !channels.insert(channel) {
            return Err(FieldMapError::DuplicateChannel {
                category: category.vendor_category.clone(),
                channel: format!(
                    "{}/{}",
                    rule.sub_channel().unwrap_or(types::SUB_CHANNEL_NONE),
                    rule.kind()
                ),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct JsonTransform {
    op: String,
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct JsonInput {
    field: String,
    #[serde(default)]
    transforms: Vec<JsonTransform>,
}

#[derive(Debug, Deserialize)]
struct JsonRule {
    field: Option<String>,
    inputs: Option<Vec<JsonInput>>,
    #[serde(alias = "combinator")]
    combine: Option<String>,
    kind: String,
    #[serde(alias = "sub_channel")]
    sub: Option<String>,
    #[serde(default)]
    transforms: Vec<JsonTransform>,
    precision: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct JsonCategory {
    #[serde(alias = "vendor_category")]
    category: String,
    label: Option<String>,
    #[serde(alias = "identity_prefix")]
    prefix: String,
    fields: Vec<JsonRule>,
}

#[derive(Debug, Deserialize)]
struct JsonRoot {
    categories: Vec<JsonCategory>,
}

/// Parses a field table from either a bare array of categories or
/// `{ "categories": [...] }`.
pub fn parse_table_from_json(data: &str) -> Result<FieldTable, FieldMapError> {
    let document: serde_json::Value = serde_json::from_str(data)?;
    let categories = if document.is_array() {
        serde_json::from_value::<Vec<JsonCategory>>(document)?
    } else {
        serde_json::from_value::<JsonRoot>(document)?.categories
    };

    let categories = categories
        .into_iter()
        .map(convert_category)
        .collect::<Result<Vec<_>, _>>()?;
    FieldTable::new(categories)
}

fn convert_category(category: JsonCategory) -> Result<CategoryRules, FieldMapError> {
    let mut rules = Vec::with_capacity(category.fields.len());
    for rule in category.fields {
        match convert_rule(&category.category, rule)? {
            Some(rule) => rules.push(rule),
            None => continue,
        }
    }

    let label = category
        .label
        .unwrap_or_else(|| category.category.to_ascii_lowercase().replace(' ', "-"));
    Ok(CategoryRules {
        vendor_category: category.category,
        label,
        identity_prefix: category.prefix,
        rules,
    })
}

fn convert_rule(category: &str, rule: JsonRule) -> Result<Option<FieldRule>, FieldMapError> {
    let kind = MeasureKind::from(rule.kind);
    match (rule.field, rule.inputs) {
        (Some(field), None) => Ok(Some(FieldRule::Simple(SimpleField {
            field,
            kind,
            sub_channel: rule.sub,
            transforms: convert_transforms(&rule.transforms)?,
            precision: rule.precision,
        }))),
        (None, Some(inputs)) => {
            let combinator = match rule.combine.as_deref() {
                Some("product") | None => Combinator::Product,
                Some("sum") => Combinator::Sum,
                Some(other) => {
                    return Err(FieldMapError::InvalidRule {
                        category: category.to_string(),
                        reason: format!("unknown combinator {other}"),
                    })
                }
            };
            let inputs = inputs
                .into_iter()
                .map(|input| {
                    Ok(FieldInput {
                        field: input.field,
                        transforms: convert_transforms(&input.transforms)?,
                    })
                })
                .collect::<Result<Vec<_>, FieldMapError>>()?;
            Ok(Some(FieldRule::Composite(CompositeField {
                inputs,
                combinator,
                kind,
                sub_channel: rule.sub,
                precision: rule.precision,
            })))
        }
        (Some(field), Some(_)) => Err(FieldMapError::InvalidRule {
            category: category.to_string(),
            reason: format!("rule for {field} declares both field and inputs"),
        }),
        (None, None) => {
            warn!(category, kind = %kind, "skipping rule with neither field nor inputs");
            Ok(None)
        }
    }
}

fn convert_transforms(transforms: &[JsonTransform]) -> Result<Vec<Transform>, FieldMapError> {
    transforms
        .iter()
        .map(|transform| {
            let value = || {
                transform.value.ok_or_else(|| {
                    FieldMapError::InvalidTransform(format!("{} needs a value", transform.op))
                })
            };
            match transform.op.as_str() {
                "scale" | "multiply" => Ok(Transform::Scale(value()?)),
                "divide" => Ok(Transform::Divide(value()?)),
                "offset" => Ok(Transform::Offset(value()?)),
                "celsius_to_fahrenheit" | "c_to_f" => Ok(Transform::CelsiusToFahrenheit),
                other => Err(FieldMapError::InvalidTransform(other.to_string())),
            }
        })
        .collect()
}
