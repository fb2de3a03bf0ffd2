//! Value casting into target field types.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Number, Value};

use crate::core::SqlValue;
use crate::typemap::FieldType;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d-%b-%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d-%b-%Y", "%d-%b-%y", "%Y%m%d"];

/// Cast a typed source value. NULL stays NULL; callers omit it.
pub fn cast_sql(value: &SqlValue, target: FieldType) -> Result<Value, String> {
    match (value, target) {
        (SqlValue::Null, _) => Ok(Value::Null),
        (SqlValue::Decimal(d), t) if t.is_integer() => {
            if !d.fract().is_zero() {
                return Err(format!("cannot cast {} to {}: not a whole number", d, t));
            }
            let n = d
                .to_i64()
                .ok_or_else(|| format!("cannot cast {} to {}: out of range", d, t))?;
            check_range(n, t)
        }
        (SqlValue::Decimal(d), t) if t.is_floating() => d
            .to_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("cannot cast {} to {}", d, t)),
        (SqlValue::Decimal(d), t) if t.is_string() => Ok(Value::String(d.normalize().to_string())),
        (SqlValue::Bytes(b), FieldType::Binary) => Ok(Value::String(BASE64_STANDARD.encode(b))),
        (SqlValue::Date(d), FieldType::Date) => Ok(Value::String(d.format("%Y-%m-%d").to_string())),
        (SqlValue::DateTime(_) | SqlValue::DateTimeOffset(_), FieldType::Date) => value
            .key_string()
            .map(Value::String)
            .ok_or_else(|| "empty timestamp".to_string()),
        (SqlValue::Text(s), t) if t.is_string() => Ok(Value::String(s.clone())),
        _ => cast_json(&value.to_json(), target),
    }
}

/// Cast an untyped JSON value (rule arguments, document values).
pub fn cast_json(value: &Value, target: FieldType) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let fail = |reason: &str| Err(format!("cannot cast {} to {}: {}", value, target, reason));

    match target {
        FieldType::Keyword | FieldType::Text => Ok(Value::String(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        t if t.is_integer() => {
            let n = match value {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => i,
                    None => match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => f as i64,
                        _ => return fail("not a whole number"),
                    },
                },
                Value::String(s) => match s.trim().parse::<i64>() {
                    Ok(i) => i,
                    Err(_) => match s.trim().parse::<f64>() {
                        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.2e18 => f as i64,
                        _ => return fail("not an integer"),
                    },
                },
                _ => return fail("not numeric"),
            };
            check_range(n, t)
        }
        t if t.is_floating() => {
            let f = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match f.filter(|f| f.is_finite()).and_then(Number::from_f64) {
                Some(n) => Ok(Value::Number(n)),
                None => fail("not numeric"),
            }
        }
        FieldType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => fail("not 0 or 1"),
            },
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => fail("not a boolean"),
            },
            _ => fail("not a boolean"),
        },
        FieldType::Date => match value {
            Value::String(s) => normalize_date(s, None).map(Value::String),
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|d| Value::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .map_or_else(|| fail("invalid epoch milliseconds"), Ok),
            _ => fail("not a date"),
        },
        FieldType::Binary => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            _ => fail("not binary"),
        },
        FieldType::Object | FieldType::Nested => match value {
            Value::Object(_) | Value::Array(_) => Ok(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(v @ (Value::Object(_) | Value::Array(_))) => Ok(v),
                _ => fail("not a JSON object"),
            },
            _ => fail("not an object"),
        },
        _ => fail("unsupported target type"),
    }
}

fn check_range(n: i64, target: FieldType) -> Result<Value, String> {
    let (min, max) = match target {
        FieldType::Integer => (i64::from(i32::MIN), i64::from(i32::MAX)),
        FieldType::Short => (i64::from(i16::MIN), i64::from(i16::MAX)),
        FieldType::Byte => (i64::from(i8::MIN), i64::from(i8::MAX)),
        _ => (i64::MIN, i64::MAX),
    };
    if n < min || n > max {
        return Err(format!("cannot cast {} to {}: out of range", n, target));
    }
    Ok(Value::from(n))
}

/// Normalize a date or timestamp string to RFC 3339 in UTC.
///
/// Date-only inputs stay `YYYY-MM-DD`. Timestamps without an offset are read as UTC.
pub fn normalize_date(input: &str, format: Option<&str>) -> Result<String, String> {
    let s = input.trim();
    let render = |dt: DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true);

    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(render(dt.and_utc()));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d.format("%Y-%m-%d").to_string());
        }
        return Err(format!("'{}' does not match date format '{}'", s, fmt));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(render(dt.with_timezone(&Utc)));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(render(dt.with_timezone(&Utc)));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(render(dt.and_utc()));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d.format("%Y-%m-%d").to_string());
        }
    }
    Err(format!("cannot parse '{}' as a date", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_cast_numbers() {
        assert_eq!(cast_sql(&SqlValue::from("42"), FieldType::Long).unwrap(), json!(42));
        assert_eq!(cast_sql(&SqlValue::from(" 7.0 "), FieldType::Long).unwrap(), json!(7));
        assert!(cast_sql(&SqlValue::from("abc"), FieldType::Double).is_err());
        assert!(cast_sql(&SqlValue::from("12.5"), FieldType::Integer).is_err());
        assert!(cast_sql(&SqlValue::I64(70_000), FieldType::Short).is_err());
        let d = SqlValue::Decimal(Decimal::from_str("19.99").unwrap());
        assert_eq!(cast_sql(&d, FieldType::ScaledFloat).unwrap(), json!(19.99));
        assert_eq!(cast_sql(&d, FieldType::Keyword).unwrap(), json!("19.99"));
    }

    #[test]
    fn test_cast_dates() {
        let dt = NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(7, 8, 9)
            .unwrap();
        assert_eq!(
            cast_sql(&SqlValue::DateTime(dt), FieldType::Date).unwrap(),
            json!("2024-05-06T07:08:09Z")
        );
        assert_eq!(
            cast_json(&json!("2024-05-06T09:08:09+02:00"), FieldType::Date).unwrap(),
            json!("2024-05-06T07:08:09Z")
        );
        assert_eq!(
            cast_json(&json!(0), FieldType::Date).unwrap(),
            json!("1970-01-01T00:00:00Z")
        );
        assert_eq!(normalize_date("06-MAY-2024", None).unwrap(), "2024-05-06");
        assert_eq!(
            normalize_date("06/05/2024", Some("%d/%m/%Y")).unwrap(),
            "2024-05-06"
        );
        assert!(normalize_date("yesterday", None).is_err());
    }

    #[test]
    fn test_cast_booleans_and_strings() {
        assert_eq!(cast_sql(&SqlValue::from("Y"), FieldType::Boolean).unwrap(), json!(true));
        assert_eq!(cast_sql(&SqlValue::I64(0), FieldType::Boolean).unwrap(), json!(false));
        assert_eq!(cast_sql(&SqlValue::I64(5), FieldType::Keyword).unwrap(), json!("5"));
        assert_eq!(cast_sql(&SqlValue::Null, FieldType::Keyword).unwrap(), Value::Null);
    }

    #[test]
    fn test_cast_objects_and_binary() {
        assert_eq!(
            cast_json(&json!("{\"a\":1}"), FieldType::Object).unwrap(),
            json!({"a": 1})
        );
        assert!(cast_json(&json!("plain"), FieldType::Object).is_err());
        assert_eq!(
            cast_sql(&SqlValue::Bytes(vec![0xff]), FieldType::Binary).unwrap(),
            json!("/w==")
        );
    }
}
