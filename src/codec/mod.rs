//! Codec (C2): round-trips between semantic records and compressed
//! index-keyed tuples, per template.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::types::{FieldType, FieldValue, Template, TemplateData};
use crate::{Error, Result};

const TEMPLATE_KEY: &str = "t";
const UNKNOWN_FIELD_PREFIX: &str = "_unknownField_";

/// Compresses `data` (semantic field name → value) into a tuple keyed by
/// field index plus a `"t"` template-id marker, per the rules of spec
/// §4.2: enums become their position in the template's value list,
/// `repeated` becomes an ordered JSON array, `dref` becomes the target
/// DID string. An unrecognized field name is a hard `UnknownField` error —
/// compression only ever happens against the template the caller declared.
pub fn compress(template: &Template, data: &TemplateData) -> Result<Value> {
    let mut tuple = Map::new();
    for (name, value) in data {
        let field = template
            .field_by_name(name)
            .ok_or_else(|| Error::UnknownField(format!("{} has no field {name}", template.name)))?;
        let encoded = encode_value(value, &field.field_type)?;
        tuple.insert(field.index.to_string(), encoded);
    }
    tuple.insert(TEMPLATE_KEY.to_string(), Value::String(template.template_id.clone()));
    Ok(Value::Object(tuple))
}

fn encode_value(value: &FieldValue, field_type: &FieldType) -> Result<Value> {
    match (value, field_type) {
        (FieldValue::String(s), FieldType::String) => Ok(Value::String(s.clone())),
        (FieldValue::Long(n), FieldType::Long) => Ok(Value::from(*n)),
        (FieldValue::Uint64(n), FieldType::Uint64) => Ok(Value::from(*n)),
        (FieldValue::Float(f), FieldType::Float) => Ok(Value::from(*f)),
        (FieldValue::Bool(b), FieldType::Bool) => Ok(Value::Bool(*b)),
        (FieldValue::Dref(did), FieldType::Dref) => Ok(Value::String(did.as_str().to_string())),
        (FieldValue::String(label), FieldType::Enum { values }) => {
            let position = values
                .iter()
                .position(|v| v == label)
                .ok_or_else(|| Error::UnknownEnumValue(label.clone()))?;
            Ok(Value::from(position as u64))
        }
        (FieldValue::Repeated(items), FieldType::Repeated { element }) => {
            let encoded: Result<Vec<Value>> =
                items.iter().map(|item| encode_value(item, element)).collect();
            Ok(Value::Array(encoded?))
        }
        (value, field_type) => Err(Error::decode(format!(
            "value {value:?} does not match field type {field_type:?}"
        ))),
    }
}

/// Decompresses a wire tuple back into semantic field-name → value,
/// tolerant of fields the local template doesn't recognize: those survive
/// as `_unknownField_<index>` with the raw JSON value, so an older node
/// can still index records published against a newer template revision
/// (the decompression contract).
pub fn decompress(template: &Template, tuple: &Value) -> Result<TemplateData> {
    let object = tuple
        .as_object()
        .ok_or_else(|| Error::decode("compressed tuple must be a JSON object"))?;

    let mut data = HashMap::new();
    for (key, raw) in object {
        if key == TEMPLATE_KEY {
            continue;
        }
        let index: u32 = key
            .parse()
            .map_err(|_| Error::decode(format!("non-numeric field key: {key}")))?;

        match template.field_by_index(index) {
            Some(field) => {
                let value = decode_value(raw, &field.field_type)?;
                data.insert(field.name.clone(), value);
            }
            None => {
                data.insert(
                    format!("{UNKNOWN_FIELD_PREFIX}{index}"),
                    FieldValue::String(raw.to_string()),
                );
            }
        }
    }
    Ok(data)
}

fn decode_value(raw: &Value, field_type: &FieldType) -> Result<FieldValue> {
    match field_type {
        FieldType::String => Ok(FieldValue::String(
            raw.as_str()
                .ok_or_else(|| Error::decode("expected string"))?
                .to_string(),
        )),
        FieldType::Long => Ok(FieldValue::Long(
            raw.as_i64().ok_or_else(|| Error::decode("expected long"))?,
        )),
        FieldType::Uint64 => Ok(FieldValue::Uint64(
            raw.as_u64().ok_or_else(|| Error::decode("expected uint64"))?,
        )),
        FieldType::Float => Ok(FieldValue::Float(
            raw.as_f64().ok_or_else(|| Error::decode("expected float"))?,
        )),
        FieldType::Bool => Ok(FieldValue::Bool(decode_bool(raw)?)),
        FieldType::Dref => Ok(FieldValue::Dref(
            raw.as_str()
                .ok_or_else(|| Error::decode("expected dref string"))?
                .into(),
        )),
        FieldType::Enum { values } => {
            let position = raw
                .as_u64()
                .ok_or_else(|| Error::decode("expected enum position"))? as usize;
            let label = values
                .get(position)
                .ok_or_else(|| Error::UnknownEnumValue(format!("position {position}")))?;
            Ok(FieldValue::String(label.clone()))
        }
        FieldType::Repeated { element } => {
            let items = raw
                .as_array()
                .ok_or_else(|| Error::decode("expected array for repeated field"))?;
            let decoded: Result<Vec<FieldValue>> =
                items.iter().map(|item| decode_value(item, element)).collect();
            Ok(FieldValue::Repeated(decoded?))
        }
    }
}

/// Accepts `true`/`false` or `0`/`1` on decode.
fn decode_bool(raw: &Value) -> Result<bool> {
    if let Some(b) = raw.as_bool() {
        return Ok(b);
    }
    match raw.as_u64() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(Error::decode("expected bool, 0, or 1")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TemplateField;

    fn greeting_template() -> Template {
        Template {
            template_id: "tx-greeting".to_string(),
            name: "greeting".to_string(),
            fields: vec![
                TemplateField {
                    name: "title".into(),
                    field_type: FieldType::String,
                    index: 0,
                },
                TemplateField {
                    name: "priority".into(),
                    field_type: FieldType::Enum {
                        values: vec!["low".into(), "high".into()],
                    },
                    index: 1,
                },
                TemplateField {
                    name: "loud".into(),
                    field_type: FieldType::Bool,
                    index: 2,
                },
                TemplateField {
                    name: "tags".into(),
                    field_type: FieldType::Repeated {
                        element: Box::new(FieldType::String),
                    },
                    index: 3,
                },
            ],
        }
    }

    #[test]
    fn round_trip_all_known_fields() {
        let template = greeting_template();
        let mut data = HashMap::new();
        data.insert("title".to_string(), FieldValue::String("hi".into()));
        data.insert("priority".to_string(), FieldValue::String("high".into()));
        data.insert("loud".to_string(), FieldValue::Bool(true));
        data.insert(
            "tags".to_string(),
            FieldValue::Repeated(vec![
                FieldValue::String("a".into()),
                FieldValue::String("b".into()),
            ]),
        );

        let compressed = compress(&template, &data).unwrap();
        assert_eq!(compressed["t"], "tx-greeting");
        assert_eq!(compressed["1"], 1); // "high" is position 1

        let decompressed = decompress(&template, &compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn decode_accepts_zero_one_for_bool() {
        let template = greeting_template();
        let tuple = serde_json::json!({ "2": 1, "t": "tx-greeting" });
        let data = decompress(&template, &tuple).unwrap();
        assert_eq!(data.get("loud"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn unknown_field_is_rejected_on_compress() {
        let template = greeting_template();
        let mut data = HashMap::new();
        data.insert("nonexistent".to_string(), FieldValue::String("x".into()));
        assert!(matches!(
            compress(&template, &data),
            Err(Error::UnknownField(_))
        ));
    }

    #[test]
    fn unknown_enum_value_rejected_on_compress() {
        let template = greeting_template();
        let mut data = HashMap::new();
        data.insert("priority".to_string(), FieldValue::String("medium".into()));
        assert!(matches!(
            compress(&template, &data),
            Err(Error::UnknownEnumValue(_))
        ));
    }

    #[test]
    fn decompress_tolerates_field_not_in_local_template() {
        let template = greeting_template();
        let tuple = serde_json::json!({ "0": "hi", "99": "mystery", "t": "tx-greeting" });
        let data = decompress(&template, &tuple).unwrap();
        assert_eq!(
            data.get("_unknownField_99"),
            Some(&FieldValue::String("\"mystery\"".to_string()))
        );
    }
}
