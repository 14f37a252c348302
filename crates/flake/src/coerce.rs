//! Datatype inference and coercion for inbound JSON values.
//!
//! Inference maps untyped JSON onto the xsd vocabulary: strings become
//! xsd:string (rdf:langString when a language tag rides along), integers
//! become xsd:long, other numbers xsd:decimal, booleans xsd:boolean.
//! Coercion parses a JSON value into a *required* datatype, honoring the
//! signed integer families and ISO-8601 temporal forms.

use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::{codes, dt, Error, Sid, Value};

/// Infer the datatype of a JSON value that arrived without one.
pub fn infer(value: &serde_json::Value, lang: Option<&str>) -> Sid {
    match value {
        serde_json::Value::String(_) if lang.is_some() => dt::lang_string(),
        serde_json::Value::String(_) => dt::string(),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => dt::long(),
        serde_json::Value::Number(_) => dt::decimal(),
        serde_json::Value::Bool(_) => dt::boolean(),
        _ => dt::string(),
    }
}

/// Coerce a JSON value into `required`, or infer when no datatype is
/// required. Returns the stored value together with its final datatype.
pub fn from_json(
    value: &serde_json::Value,
    required: Option<&Sid>,
    lang: Option<&str>,
) -> Result<(Value, Sid), Error> {
    match required {
        Some(datatype) => Ok((coerce(value, datatype)?, datatype.clone())),
        None => {
            let datatype = infer(value, lang);
            let coerced = coerce(value, &datatype)?;
            Ok((coerced, datatype))
        }
    }
}

/// Coerce a JSON value to the given datatype.
pub fn coerce(value: &serde_json::Value, datatype: &Sid) -> Result<Value, Error> {
    let fail = || Error::ValueCoercion {
        value: print_json(value),
        datatype: datatype.name.clone(),
    };

    if datatype.namespace == codes::RDF && datatype.name == "langString" {
        return match value {
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            _ => Err(fail()),
        };
    }
    if datatype.namespace != codes::XSD {
        // Custom datatypes carry their lexical form.
        return match value {
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            _ => Err(fail()),
        };
    }

    match datatype.name.as_str() {
        "string" | "normalizedString" | "token" | "language" => match value {
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            _ => Err(fail()),
        },
        "boolean" => match value {
            serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
            serde_json::Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        "integer" | "long" => integer_in(value, i64::MIN, i64::MAX).ok_or_else(fail),
        "int" => integer_in(value, i32::MIN as i64, i32::MAX as i64).ok_or_else(fail),
        "short" => integer_in(value, i16::MIN as i64, i16::MAX as i64).ok_or_else(fail),
        "byte" => integer_in(value, i8::MIN as i64, i8::MAX as i64).ok_or_else(fail),
        "nonNegativeInteger" => integer_in(value, 0, i64::MAX).ok_or_else(fail),
        "positiveInteger" => integer_in(value, 1, i64::MAX).ok_or_else(fail),
        "nonPositiveInteger" => integer_in(value, i64::MIN, 0).ok_or_else(fail),
        "negativeInteger" => integer_in(value, i64::MIN, -1).ok_or_else(fail),
        "unsignedLong" | "unsignedInt" | "unsignedShort" | "unsignedByte" => {
            integer_in(value, 0, i64::MAX).ok_or_else(fail)
        }
        "decimal" | "double" | "float" => double_of(value).ok_or_else(fail),
        "dateTime" => match value {
            serde_json::Value::String(s) => {
                parse_date_time(s).map(Value::DateTime).ok_or_else(fail)
            }
            _ => Err(fail()),
        },
        "date" => match value {
            serde_json::Value::String(s) => parse_date(s).map(Value::Date).ok_or_else(fail),
            _ => Err(fail()),
        },
        "time" => match value {
            serde_json::Value::String(s) => parse_time(s).map(Value::Time).ok_or_else(fail),
            _ => Err(fail()),
        },
        // anyURI objects are resolved to Sids by the commit assembler, never
        // through literal coercion.
        _ => Err(fail()),
    }
}

fn print_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn integer_in(value: &serde_json::Value, min: i64, max: i64) -> Option<Value> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (min..=max).contains(&n).then_some(Value::Long(n))
}

fn double_of(value: &serde_json::Value) -> Option<Value> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(Value::Double),
        serde_json::Value::String(s) => match s.trim() {
            "INF" => Some(Value::Double(f64::INFINITY)),
            "-INF" => Some(Value::Double(f64::NEG_INFINITY)),
            trimmed => trimmed.parse::<f64>().ok().map(Value::Double),
        },
        _ => None,
    }
}

const DATE: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIME_HMS: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");
const TIME_FRAC: &[FormatItem<'static>] =
    format_description!("[hour]:[minute]:[second].[subsecond]");
const DATE_TIME: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DATE_TIME_FRAC: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");

pub fn parse_date_time(s: &str) -> Option<time::OffsetDateTime> {
    if let Ok(parsed) = time::OffsetDateTime::parse(s, &Rfc3339) {
        return Some(parsed);
    }
    // Zoneless forms are taken as UTC.
    for fmt in [DATE_TIME_FRAC, DATE_TIME] {
        if let Ok(parsed) = time::PrimitiveDateTime::parse(s, fmt) {
            return Some(parsed.assume_utc());
        }
    }
    None
}

pub fn parse_date(s: &str) -> Option<time::Date> {
    time::Date::parse(s, DATE).ok()
}

pub fn parse_time(s: &str) -> Option<time::Time> {
    // An optional trailing zone designator is accepted and dropped. The
    // lexical time form itself never contains '+' or '-'.
    let bare = s
        .strip_suffix('Z')
        .or_else(|| s.split_once('+').map(|(head, _)| head))
        .or_else(|| s.split_once('-').map(|(head, _)| head))
        .unwrap_or(s);
    for fmt in [TIME_FRAC, TIME_HMS] {
        if let Ok(parsed) = time::Time::parse(bare, fmt) {
            return Some(parsed);
        }
    }
    None
}

pub fn format_date_time(v: time::OffsetDateTime) -> String {
    v.format(&Rfc3339)
        .unwrap_or_else(|_| format!("{:?}", v))
}

pub fn format_date(v: time::Date) -> String {
    v.format(DATE).unwrap_or_else(|_| format!("{:?}", v))
}

pub fn format_time(v: time::Time) -> String {
    v.format(TIME_FRAC).unwrap_or_else(|_| format!("{:?}", v))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inference() {
        assert_eq!(infer(&json!("hi"), None), dt::string());
        assert_eq!(infer(&json!("salut"), Some("fr")), dt::lang_string());
        assert_eq!(infer(&json!(42), None), dt::long());
        assert_eq!(infer(&json!(4.2), None), dt::decimal());
        assert_eq!(infer(&json!(true), None), dt::boolean());
    }

    #[test]
    fn test_integer_families() {
        assert!(coerce(&json!(8), &dt::xsd("integer")).is_ok());
        assert!(coerce(&json!("8"), &dt::xsd("integer")).is_ok());
        assert!(coerce(&json!(-1), &dt::xsd("nonNegativeInteger")).is_err());
        assert!(coerce(&json!(0), &dt::xsd("positiveInteger")).is_err());
        assert!(coerce(&json!(0), &dt::xsd("nonPositiveInteger")).is_ok());
        assert!(coerce(&json!(1), &dt::xsd("negativeInteger")).is_err());
        assert!(coerce(&json!(40_000), &dt::xsd("short")).is_err());
        assert!(coerce(&json!(129), &dt::xsd("byte")).is_err());
    }

    #[test]
    fn test_uncoercible_string() {
        let err = coerce(&json!("alot"), &dt::xsd("integer")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "value alot cannot be coerced to provided datatype: integer"
        );
    }

    #[test]
    fn test_inf_is_recognized_for_floats() {
        match coerce(&json!("INF"), &dt::xsd("double")).unwrap() {
            Value::Double(d) => assert!(d.is_infinite() && d.is_sign_positive()),
            other => panic!("unexpected {other:?}"),
        }
        match coerce(&json!("-INF"), &dt::xsd("float")).unwrap() {
            Value::Double(d) => assert!(d.is_infinite() && d.is_sign_negative()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_temporal_parsing() {
        assert!(parse_date_time("2024-02-29T14:30:00Z").is_some());
        assert!(parse_date_time("2024-02-29T14:30:00.250Z").is_some());
        assert!(parse_date_time("2024-02-29T14:30:00").is_some());
        assert!(parse_date_time("2024-02-30T14:30:00").is_none());
        assert!(parse_date("2024-02-29").is_some());
        assert!(parse_date("2023-02-29").is_none());
        assert!(parse_time("14:30:00").is_some());
        assert!(parse_time("14:30:00Z").is_some());
        assert!(parse_time("25:00:00").is_none());
    }

    #[test]
    fn test_booleans_parse_from_strings() {
        assert_eq!(
            coerce(&json!("true"), &dt::boolean()).unwrap(),
            Value::Boolean(true)
        );
        assert!(coerce(&json!("yes"), &dt::boolean()).is_err());
    }
}
