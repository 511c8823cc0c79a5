//! Field inference from sampled documents and BSON to JSON conversion

use bson::{Bson, Document};
use dbasset_query::{Datatype, FieldDescriptor};
use serde_json::{Map, Number, Value};

/// Query-language alias of a BSON type
fn type_alias(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        _ => "unknown",
    }
}

fn classify(value: &Bson) -> Datatype {
    match value {
        Bson::String(_) | Bson::ObjectId(_) | Bson::Symbol(_) => Datatype::String,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => {
            Datatype::Number
        }
        Bson::Boolean(_) => Datatype::Boolean,
        Bson::DateTime(_) | Bson::Timestamp(_) => Datatype::Date,
        Bson::Array(_) => Datatype::Array,
        _ => Datatype::Unknown,
    }
}

struct Observed {
    name: String,
    datatype: Option<Datatype>,
    native: Option<&'static str>,
    mixed: bool,
}

/// Merge the fields seen across `documents`, in order of first appearance
///
/// A field holding values of different categories is `unknown`; nulls do
/// not count as a category.
pub fn infer_fields<'a>(documents: impl IntoIterator<Item = &'a Document>) -> Vec<FieldDescriptor> {
    let mut observed: Vec<Observed> = Vec::new();
    for document in documents {
        for (key, value) in document {
            let index = match observed.iter().position(|field| &field.name == key) {
                Some(index) => index,
                None => {
                    observed.push(Observed {
                        name: key.clone(),
                        datatype: None,
                        native: None,
                        mixed: false,
                    });
                    observed.len() - 1
                }
            };
            if matches!(value, Bson::Null) {
                continue;
            }
            let field = &mut observed[index];
            let datatype = classify(value);
            match field.datatype {
                None => {
                    field.datatype = Some(datatype);
                    field.native = Some(type_alias(value));
                }
                Some(seen) if seen != datatype => field.mixed = true,
                Some(_) => {
                    if field.native != Some(type_alias(value)) {
                        field.native = None;
                    }
                }
            }
        }
    }

    observed
        .into_iter()
        .map(|field| {
            let datatype = match (field.mixed, field.datatype) {
                (false, Some(datatype)) => datatype,
                _ => Datatype::Unknown,
            };
            let descriptor = FieldDescriptor::new(field.name, datatype);
            match field.native {
                Some(native) if !field.mixed => descriptor.with_native_type(native),
                _ => descriptor,
            }
        })
        .collect()
}

/// JSON form of a BSON value; identifiers, dates and decimals become strings
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s.clone()),
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| Value::from(dt.timestamp_millis())),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(document) => Value::Object(document_to_json(document)),
        other => other.clone().into_relaxed_extjson(),
    }
}

pub fn document_to_json(document: &Document) -> Map<String, Value> {
    document
        .iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};
    use serde_json::json;

    #[test]
    fn test_infer_fields() {
        let documents = vec![
            doc! { "town": "BOSTON", "pop2010": 617594, "county": Bson::Null },
            doc! { "town": "CAMBRIDGE", "pop2010": 105162_i64, "tags": ["college"] },
            doc! { "town": 7, "county": "MIDDLESEX" },
        ];
        let fields = infer_fields(&documents);
        let summary: Vec<(&str, Datatype, Option<&str>)> = fields
            .iter()
            .map(|f| (f.name.as_str(), f.datatype, f.native_type.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("town", Datatype::Unknown, None),
                ("pop2010", Datatype::Number, None),
                ("county", Datatype::String, Some("string")),
                ("tags", Datatype::Array, Some("array")),
            ]
        );
    }

    #[test]
    fn test_only_nulls_is_unknown() {
        let documents = vec![doc! { "note": Bson::Null }];
        assert_eq!(infer_fields(&documents)[0].datatype, Datatype::Unknown);
    }

    #[test]
    fn test_bson_to_json() {
        let id = ObjectId::parse_str("5f8d0d55b54764421b7156c9").unwrap();
        let document = doc! {
            "_id": id,
            "town": "BOSTON",
            "pop": 617594,
            "ratio": f64::NAN,
            "nested": { "tags": [1, "a"] },
        };
        assert_eq!(
            Value::Object(document_to_json(&document)),
            json!({
                "_id": "5f8d0d55b54764421b7156c9",
                "town": "BOSTON",
                "pop": 617594,
                "ratio": null,
                "nested": { "tags": [1, "a"] },
            })
        );
    }
}
