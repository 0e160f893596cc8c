use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use field_map::{
    apply_chain, CategoryRules, CompositeField, FieldRule, FieldTable, SimpleField, Transform,
};
use types::{round_to, DeviceDescriptor, Measurement, RawTelemetry};

/// One raw field could not be turned into a number.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldConversionError {
    #[error("field {field} is not numeric: {value}")]
    NotNumeric { field: String, value: String },
    #[error("field {field} is not finite after transforms or rounding")]
    NonFinite { field: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("no transformation rules for category {0}")]
pub struct CategoryUnsupported(pub String);

/// Maps one device's raw telemetry onto canonical measurements.
///
/// Never fails: unusable fields are logged and dropped, and an unknown
/// category yields an empty set. Output follows rule declaration order.
pub fn normalize_device(
    table: &FieldTable,
    device: &DeviceDescriptor,
    raw: &RawTelemetry,
) -> Vec<Measurement> {
    let Some(category) = table.category(&device.category) else {
        let err = CategoryUnsupported(device.category.clone());
        warn!(device = %device.device_id, error = %err, "skipping device");
        return Vec::new();
    };

    let identity = device.identity(&category.identity_prefix);
    let mut out = Vec::with_capacity(category.rules.len());

    for rule in &category.rules {
        let value = match rule {
            FieldRule::Simple(simple) => simple_value(&identity, simple, raw),
            FieldRule::Composite(composite) => composite_value(&identity, composite, raw),
        };
        let Some(value) = value else {
            continue;
        };
        match round_to(value, rule.precision()) {
            Some(rounded) => out.push(measurement(category, device, &identity, rule, rounded)),
            None => {
                let err = FieldConversionError::NonFinite {
                    field: rule_fields(rule),
                };
                warn!(
                    device = %identity,
                    kind = %rule.kind(),
                    precision = rule.precision(),
                    error = %err,
                    "dropping field"
                );
            }
        }
    }

    debug!(
        device = %identity,
        category = %category.label,
        produced = out.len(),
        "device normalized"
    );
    out
}

/// Reads and transforms one raw field. `Ok(None)` means absent or null.
pub fn read_field(
    raw: &RawTelemetry,
    field: &str,
    transforms: &[Transform],
) -> Result<Option<f64>, FieldConversionError> {
    let value = match raw.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| FieldConversionError::NotNumeric {
        field: field.to_string(),
        value: value.to_string(),
    })?;

    let transformed = apply_chain(transforms, number);
    if !transformed.is_finite() {
        return Err(FieldConversionError::NonFinite {
            field: field.to_string(),
        });
    }
    Ok(Some(transformed))
}

fn simple_value(identity: &str, rule: &SimpleField, raw: &RawTelemetry) -> Option<f64> {
    match read_field(raw, &rule.field, &rule.transforms) {
        Ok(Some(value)) => Some(value),
        Ok(None) => {
            debug!(device = %identity, field = %rule.field, "field absent");
            None
        }
        Err(err) => {
            warn!(device = %identity, field = %rule.field, error = %err, "dropping field");
            None
        }
    }
}

/// Missing or unusable inputs count as 0.0; a rule with no usable input at
/// all produces nothing.
fn composite_value(identity: &str, rule: &CompositeField, raw: &RawTelemetry) -> Option<f64> {
    let mut values = Vec::with_capacity(rule.inputs.len());
    let mut present = 0usize;

    for input in &rule.inputs {
        match read_field(raw, &input.field, &input.transforms) {
            Ok(Some(value)) => {
                present += 1;
                values.push(value);
            }
            Ok(None) => values.push(0.0),
            Err(err) => {
                warn!(
                    device = %identity,
                    field = %input.field,
                    kind = %rule.kind,
                    error = %err,
                    "composite input unusable, substituting 0.0"
                );
                values.push(0.0);
            }
        }
    }

    if present == 0 {
        debug!(device = %identity, kind = %rule.kind, "no composite inputs present");
        return None;
    }

    let combined = rule.combinator.combine(&values);
    if !combined.is_finite() {
        warn!(device = %identity, kind = %rule.kind, "composite result is not finite");
        return None;
    }
    Some(combined)
}

fn measurement(
    category: &CategoryRules,
    device: &DeviceDescriptor,
    identity: &str,
    rule: &FieldRule,
    value: f64,
) -> Measurement {
    Measurement {
        device_identity: identity.to_string(),
        category_label: category.label.clone(),
        display_name: device.display_name.clone(),
        sku: device.sku.clone(),
        measure_kind: rule.kind().clone(),
        sub_channel: rule.sub_channel().map(str::to_string),
        value,
    }
}

fn rule_fields(rule: &FieldRule) -> String {
    match rule {
        FieldRule::Simple(simple) => simple.field.clone(),
        FieldRule::Composite(composite) => composite
            .inputs
            .iter()
            .map(|input| input.field.as_str())
            .collect::<Vec<_>>()
            .join(","),
    }
}
