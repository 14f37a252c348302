use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::{coerce, dt, Sid};

/// Value is the object position of a flake: a reference to another subject
/// when the datatype is anyURI, or a typed literal otherwise. Temporal
/// values are kept parsed so that range constraints compare chronologically.
#[derive(Debug, Clone)]
pub enum Value {
    Sid(Sid),
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    DateTime(time::OffsetDateTime),
    Date(time::Date),
    Time(time::Time),
}

/// Wire form of a Value. Temporal values travel as their ISO-8601 strings,
/// everything else as native JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Repr {
    #[serde(rename = "ref")]
    Ref(Sid),
    #[serde(rename = "str")]
    Str(String),
    #[serde(rename = "long")]
    Long(i64),
    #[serde(rename = "double")]
    Double(f64),
    #[serde(rename = "bool")]
    Bool(bool),
    #[serde(rename = "dateTime")]
    DateTime(String),
    #[serde(rename = "date")]
    Date(String),
    #[serde(rename = "time")]
    Time(String),
}

impl From<Value> for Repr {
    fn from(v: Value) -> Repr {
        match v {
            Value::Sid(sid) => Repr::Ref(sid),
            Value::String(s) => Repr::Str(s),
            Value::Long(n) => Repr::Long(n),
            Value::Double(n) => Repr::Double(n),
            Value::Boolean(b) => Repr::Bool(b),
            Value::DateTime(v) => Repr::DateTime(coerce::format_date_time(v)),
            Value::Date(v) => Repr::Date(coerce::format_date(v)),
            Value::Time(v) => Repr::Time(coerce::format_time(v)),
        }
    }
}

impl TryFrom<Repr> for Value {
    type Error = crate::Error;

    fn try_from(r: Repr) -> Result<Value, Self::Error> {
        Ok(match r {
            Repr::Ref(sid) => Value::Sid(sid),
            Repr::Str(s) => Value::String(s),
            Repr::Long(n) => Value::Long(n),
            Repr::Double(n) => Value::Double(n),
            Repr::Bool(b) => Value::Boolean(b),
            Repr::DateTime(s) => Value::DateTime(coerce::parse_date_time(&s).ok_or_else(
                || crate::Error::ValueCoercion {
                    value: s,
                    datatype: "xsd:dateTime".to_string(),
                },
            )?),
            Repr::Date(s) => {
                Value::Date(coerce::parse_date(&s).ok_or_else(|| crate::Error::ValueCoercion {
                    value: s.clone(),
                    datatype: "xsd:date".to_string(),
                })?)
            }
            Repr::Time(s) => {
                Value::Time(coerce::parse_time(&s).ok_or_else(|| crate::Error::ValueCoercion {
                    value: s.clone(),
                    datatype: "xsd:time".to_string(),
                })?)
            }
        })
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Repr::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = Repr::deserialize(deserializer)?;
        Value::try_from(repr).map_err(serde::de::Error::custom)
    }
}

impl Value {
    pub fn as_sid(&self) -> Option<&Sid> {
        match self {
            Value::Sid(sid) => Some(sid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Long(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Sid(sid) => write!(f, "{sid}"),
            Value::String(s) => f.write_str(s),
            Value::Long(n) => write!(f, "{n}"),
            Value::Double(n) => write!(f, "{n}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::DateTime(v) => f.write_str(&coerce::format_date_time(*v)),
            Value::Date(v) => f.write_str(&coerce::format_date(*v)),
            Value::Time(v) => f.write_str(&coerce::format_time(*v)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Sid(l), Sid(r)) => l == r,
            (String(l), String(r)) => l == r,
            (Long(l), Long(r)) => l == r,
            (Double(l), Double(r)) => l.total_cmp(r) == Ordering::Equal,
            (Long(l), Double(r)) | (Double(r), Long(l)) => {
                (*l as f64).total_cmp(r) == Ordering::Equal
            }
            (Boolean(l), Boolean(r)) => l == r,
            (DateTime(l), DateTime(r)) => l == r,
            (Date(l), Date(r)) => l == r,
            (Time(l), Time(r)) => l == r,
            _ => false,
        }
    }
}
impl Eq for Value {}

/// Compare two object positions with their datatypes, per the type-aware
/// ordering: same dt compares naturally; strings of differing dt compare as
/// strings with dt as tiebreak; numbers compare numerically with dt as
/// tiebreak; anything else orders by dt.
pub fn compare_obj(lo: &Value, ldt: &Sid, ro: &Value, rdt: &Sid) -> Ordering {
    use Value::*;
    match (lo, ro) {
        (Sid(l), Sid(r)) => l.cmp(r).then_with(|| ldt.cmp(rdt)),
        (String(l), String(r)) => l.cmp(r).then_with(|| ldt.cmp(rdt)),
        (Long(l), Long(r)) => l.cmp(r).then_with(|| ldt.cmp(rdt)),
        (Double(l), Double(r)) => l.total_cmp(r).then_with(|| ldt.cmp(rdt)),
        (Long(l), Double(r)) => (*l as f64).total_cmp(r).then_with(|| ldt.cmp(rdt)),
        (Double(l), Long(r)) => l.total_cmp(&(*r as f64)).then_with(|| ldt.cmp(rdt)),
        (Boolean(l), Boolean(r)) => l.cmp(r).then_with(|| ldt.cmp(rdt)),
        (DateTime(l), DateTime(r)) => l.cmp(r).then_with(|| ldt.cmp(rdt)),
        (Date(l), Date(r)) => l.cmp(r).then_with(|| ldt.cmp(rdt)),
        (Time(l), Time(r)) => l.cmp(r).then_with(|| ldt.cmp(rdt)),
        _ if ldt != rdt => ldt.cmp(rdt),
        // Same declared dt but mixed representations: order by printed form.
        _ => lo.to_string().cmp(&ro.to_string()),
    }
}

/// On-disk size of an object position, determined by its datatype.
pub fn size_obj(o: &Value, datatype: &Sid) -> u64 {
    if dt::is_any_uri(datatype) {
        return match o {
            Value::Sid(sid) => sid.size(),
            other => 2 * other.to_string().len() as u64,
        };
    }
    if dt::is_string_family(datatype) {
        return match o {
            Value::String(s) => 2 * s.len() as u64,
            other => 2 * other.to_string().len() as u64,
        };
    }
    match (datatype.namespace, datatype.name.as_str()) {
        (crate::codes::XSD, "long" | "double") => 8,
        (crate::codes::XSD, "int" | "float") => 4,
        (crate::codes::XSD, "short") => 2,
        (crate::codes::XSD, "byte" | "boolean") => 1,
        _ => 2 * o.to_string().len() as u64,
    }
}
