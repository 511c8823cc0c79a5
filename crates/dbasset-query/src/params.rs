//! Request parameters and the scalar options parsed out of them.

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Parameter names with a fixed meaning; they never act as bare filters
pub const RESERVED_PARAMS: [&str; 13] = [
    "limit", "offset", "sort", "sortdir", "fields", "group", "wait", "poll", "initwait",
    "clientid", "filters", "format", "pretty",
];

pub const DEFAULT_POLL: Duration = Duration::from_secs(10);

/// Flat name/value request parameters
///
/// Values are JSON: query strings arrive as strings, programmatic callers
/// may pass structured values directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(Map<String, Value>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// A present, non-empty parameter
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.0.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(value) => Some(value),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Parameter rendered as text; numbers and booleans are stringified
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn get_bool(&self, name: &str) -> bool {
        match self.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            Some(Value::String(s)) => !matches!(
                s.trim().to_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            ),
            _ => false,
        }
    }

    /// Layer these parameters over `defaults`; request values win
    pub fn merged_over(&self, defaults: &QueryParams) -> QueryParams {
        let mut merged = defaults.0.clone();
        for (name, value) in &self.0 {
            merged.insert(name.clone(), value.clone());
        }
        QueryParams(merged)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for QueryParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn parse_number(name: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| DataError::invalid_query(format!("The {name} parameter must be a number")))
}

fn parse_integer(name: &str, value: &Value) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DataError::invalid_query(format!("The {name} parameter must be an integer"))
    })
}

/// `limit`: absent means `default`, `none` or a negative value means no limit
pub fn parse_limit(params: &QueryParams, default: u64) -> Result<Option<u64>> {
    let Some(value) = params.get("limit") else {
        return Ok(Some(default));
    };
    if let Value::String(s) = value {
        if s.trim().eq_ignore_ascii_case("none") {
            return Ok(None);
        }
    }
    let limit = parse_integer("limit", value)?;
    Ok(u64::try_from(limit).ok())
}

pub fn parse_offset(params: &QueryParams) -> Result<u64> {
    match params.get("offset") {
        None => Ok(0),
        Some(value) => Ok(u64::try_from(parse_integer("offset", value)?).unwrap_or(0)),
    }
}

/// A duration in (possibly fractional) seconds; negative values clamp to zero
pub fn parse_seconds(params: &QueryParams, name: &str, default: Duration) -> Result<Duration> {
    match params.get(name) {
        None => Ok(default),
        Some(value) => {
            let secs = parse_number(name, value)?;
            if !secs.is_finite() {
                return Err(DataError::invalid_query(format!(
                    "The {name} parameter must be a finite number"
                )));
            }
            Ok(Duration::from_secs_f64(secs.max(0.0)))
        }
    }
}

/// Accept a list-valued parameter given either as JSON text or as a JSON value
pub fn json_param(params: &QueryParams, name: &str) -> Result<Option<Value>> {
    match params.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => serde_json::from_str(s).map(Some).map_err(|_| {
            DataError::invalid_query(format!("The {name} parameter must be a JSON list."))
        }),
        Some(value) => Ok(Some(value.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_limit_parsing() {
        let params = QueryParams::new();
        assert_eq!(parse_limit(&params, 50).unwrap(), Some(50));
        let params = QueryParams::new().with("limit", "5");
        assert_eq!(parse_limit(&params, 50).unwrap(), Some(5));
        let params = QueryParams::new().with("limit", "None");
        assert_eq!(parse_limit(&params, 50).unwrap(), None);
        let params = QueryParams::new().with("limit", -1);
        assert_eq!(parse_limit(&params, 50).unwrap(), None);
        let params = QueryParams::new().with("limit", 0);
        assert_eq!(parse_limit(&params, 50).unwrap(), Some(0));
        for bad in ["lots", "2.9", "NaN", "inf", "1e30"] {
            let params = QueryParams::new().with("limit", bad);
            assert!(
                matches!(parse_limit(&params, 50), Err(DataError::InvalidQuery(_))),
                "{bad}"
            );
        }
        let params = QueryParams::new().with("limit", 2.5);
        assert!(parse_limit(&params, 50).is_err());
    }

    #[test]
    fn test_offset_parsing() {
        assert_eq!(parse_offset(&QueryParams::new()).unwrap(), 0);
        let params = QueryParams::new().with("offset", " 20 ");
        assert_eq!(parse_offset(&params).unwrap(), 20);
        let params = QueryParams::new().with("offset", -4);
        assert_eq!(parse_offset(&params).unwrap(), 0);
        for bad in ["3.5", "NaN", "inf"] {
            let params = QueryParams::new().with("offset", bad);
            assert!(parse_offset(&params).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_seconds_parsing() {
        let params = QueryParams::new().with("wait", "1.5").with("poll", -3);
        assert_eq!(
            parse_seconds(&params, "wait", Duration::ZERO).unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            parse_seconds(&params, "poll", DEFAULT_POLL).unwrap(),
            Duration::ZERO
        );
        assert_eq!(
            parse_seconds(&params, "initwait", Duration::ZERO).unwrap(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_merge_prefers_request() {
        let defaults = QueryParams::new().with("limit", 10).with("format", "csv");
        let request = QueryParams::new().with("limit", 3);
        let merged = request.merged_over(&defaults);
        assert_eq!(merged.get("limit"), Some(&json!(3)));
        assert_eq!(merged.get_str("format").as_deref(), Some("csv"));
    }

    #[test]
    fn test_empty_values_are_absent() {
        let params = QueryParams::new().with("sort", "").with("pretty", "true");
        assert!(params.get("sort").is_none());
        assert!(params.contains("sort"));
        assert!(params.get_bool("pretty"));
        assert!(!params.get_bool("missing"));
    }

    #[test]
    fn test_json_param() {
        let params = QueryParams::new()
            .with("filters", r#"[{"field": "town", "value": "BOSTON"}]"#)
            .with("bad", "[oops");
        assert!(json_param(&params, "filters").unwrap().unwrap().is_array());
        assert!(json_param(&params, "bad").is_err());
        assert!(json_param(&params, "absent").unwrap().is_none());
    }
}
