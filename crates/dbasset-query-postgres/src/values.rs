//! Decoding of PostgreSQL result cells into JSON values

use serde_json::{Number, Value};
use std::error::Error;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::Row;

type DecodeError = Box<dyn Error + Sync + Send>;

/// `numeric` in its binary wire format
#[derive(Debug, Clone, PartialEq)]
pub struct PgNumeric(pub String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        let word = |i: usize| -> Result<u16, DecodeError> {
            raw.get(i * 2..i * 2 + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| "truncated numeric".into())
        };
        let ndigits = word(0)? as i32;
        let weight = word(1)? as i16 as i32;
        let sign = word(2)?;
        let dscale = word(3)? as usize;
        match sign {
            0xC000 => return Ok(PgNumeric("NaN".into())),
            0xD000 => return Ok(PgNumeric("Infinity".into())),
            0xF000 => return Ok(PgNumeric("-Infinity".into())),
            _ => {}
        }
        let digits = (0..ndigits as usize)
            .map(|i| word(4 + i))
            .collect::<Result<Vec<_>, _>>()?;
        // base-10000 digit with the given exponent
        let digit_at = |exp: i32| -> u16 {
            let pos = weight - exp;
            if pos >= 0 && pos < ndigits {
                digits[pos as usize]
            } else {
                0
            }
        };

        let mut text = String::new();
        if sign == 0x4000 {
            text.push('-');
        }
        if weight < 0 {
            text.push('0');
        } else {
            text.push_str(&digit_at(weight).to_string());
            for exp in (0..weight).rev() {
                text.push_str(&format!("{:04}", digit_at(exp)));
            }
        }
        if dscale > 0 {
            let mut fraction = String::new();
            let mut exp = -1;
            while fraction.len() < dscale {
                fraction.push_str(&format!("{:04}", digit_at(exp)));
                exp -= 1;
            }
            fraction.truncate(dscale);
            text.push('.');
            text.push_str(&fraction);
        }
        Ok(PgNumeric(text))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

impl PgNumeric {
    pub fn to_json(&self) -> Value {
        if let Ok(i) = self.0.parse::<i64>() {
            return Value::from(i);
        }
        self.0
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(self.0.clone()))
    }
}

/// Any type whose binary format is its UTF-8 text: text types and enums
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, DecodeError> {
        Ok(PgText(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_))
            || matches!(
                *ty,
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
            )
            || ty.name() == "citext"
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn array<'a, T>(row: &'a Row, idx: usize) -> Option<Value>
where
    T: FromSql<'a> + Into<Value>,
{
    get::<Vec<Option<T>>>(row, idx).map(|items| {
        Value::Array(
            items
                .into_iter()
                .map(|item| item.map(Into::into).unwrap_or(Value::Null))
                .collect(),
        )
    })
}

/// Value of column `idx`, `null` for types without a decoder
pub fn extract_value(row: &Row, idx: usize) -> Value {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::OID => get::<u32>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx)
            .and_then(|v| Number::from_f64(v as f64))
            .map(Value::Number),
        Type::FLOAT8 => get::<f64>(row, idx)
            .and_then(Number::from_f64)
            .map(Value::Number),
        Type::NUMERIC => get::<PgNumeric>(row, idx).map(|n| n.to_json()),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(|v| Value::String(v.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx).map(|v| Value::String(v.to_string())),
        Type::TIMESTAMP => {
            get::<chrono::NaiveDateTime>(row, idx).map(|v| Value::String(v.to_string()))
        }
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| Value::String(v.to_rfc3339())),
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|v| Value::String(v.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => array::<String>(row, idx),
        Type::INT4_ARRAY => array::<i32>(row, idx),
        Type::INT8_ARRAY => array::<i64>(row, idx),
        Type::FLOAT8_ARRAY => array::<f64>(row, idx),
        Type::BOOL_ARRAY => array::<bool>(row, idx),
        _ => get::<PgText>(row, idx).map(|v| Value::String(v.0)),
    };
    value.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(words: &[u16]) -> String {
        let raw: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        PgNumeric::from_sql(&Type::NUMERIC, &raw).unwrap().0
    }

    #[test]
    fn test_numeric_decoding() {
        // ndigits, weight, sign, dscale, digits...
        assert_eq!(numeric(&[2, 0, 0, 2, 123, 4500]), "123.45");
        assert_eq!(numeric(&[1, 0xFFFF, 0, 1, 5000]), "0.5");
        assert_eq!(numeric(&[1, 1, 0, 0, 1]), "10000");
        assert_eq!(numeric(&[1, 0, 0x4000, 0, 42]), "-42");
        assert_eq!(numeric(&[0, 0, 0, 0]), "0");
        assert_eq!(numeric(&[0, 0, 0xC000, 0]), "NaN");
    }

    #[test]
    fn test_numeric_json() {
        assert_eq!(PgNumeric("42".into()).to_json(), Value::from(42));
        assert_eq!(PgNumeric("0.5".into()).to_json(), Value::from(0.5));
        assert_eq!(PgNumeric("NaN".into()).to_json(), Value::String("NaN".into()));
    }

    #[test]
    fn test_truncated_numeric_is_an_error() {
        assert!(PgNumeric::from_sql(&Type::NUMERIC, &[0, 1]).is_err());
    }
}
