//! Storage encoding of properties the model does not interpret.
//!
//! Each property is one JSON array: `[name, value]` or `[name, value, {parameters}]`.

use crate::error::CoreError;
use crate::models::UnknownProperty;
use log::warn;
use serde_json::Value;
use std::collections::BTreeMap;

/// Name of the extended-property rows holding opaque properties.
pub const UNKNOWN_PROPERTY_NAME: &str = "unknown-property.v2";

pub fn encode(property: &UnknownProperty) -> Result<String, CoreError> {
    let encoded = if property.parameters.is_empty() {
        serde_json::to_string(&(&property.name, &property.value))?
    } else {
        serde_json::to_string(&(&property.name, &property.value, &property.parameters))?
    };
    Ok(encoded)
}

pub fn decode(text: &str) -> Result<UnknownProperty, CoreError> {
    let invalid = || CoreError::InvalidInput(format!("Invalid opaque property encoding: {}", text));

    let parts: Vec<Value> = serde_json::from_str(text)?;
    let name = parts.first().and_then(Value::as_str).ok_or_else(invalid)?;
    let value = parts.get(1).and_then(Value::as_str).ok_or_else(invalid)?;
    let parameters = match parts.get(2) {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(params) => serde_json::from_value(params.clone())?,
    };

    Ok(UnknownProperty {
        name: name.to_string(),
        value: value.to_string(),
        parameters,
    })
}

/// Encodes properties, dropping each one whose encoding exceeds `limit` bytes.
///
/// # Returns
///
/// The encodings that fit, plus one `OversizeOpaqueProperty` warning per dropped property.
pub fn encode_all(
    properties: &[UnknownProperty],
    limit: usize,
) -> Result<(Vec<String>, Vec<CoreError>), CoreError> {
    let mut encoded = Vec::with_capacity(properties.len());
    let mut warnings = Vec::new();
    for property in properties {
        let text = encode(property)?;
        if text.len() > limit {
            warn!(
                "Ignoring unknown property {} with {} octets (limit {})",
                property.name,
                text.len(),
                limit
            );
            warnings.push(CoreError::OversizeOpaqueProperty {
                name: property.name.clone(),
                size: text.len(),
                limit,
            });
            continue;
        }
        encoded.push(text);
    }
    Ok((encoded, warnings))
}

/// Decodes stored properties; undecodable ones are logged and skipped.
pub fn decode_all<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<UnknownProperty> {
    texts
        .into_iter()
        .filter_map(|text| match decode(text) {
            Ok(property) => Some(property),
            Err(err) => {
                warn!("Skipping stored opaque property: {}", err);
                None
            }
        })
        .collect()
}
