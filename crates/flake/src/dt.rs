//! Well-known datatype identifiers and their comparison families.

use crate::{codes, Sid};

pub fn xsd(name: &str) -> Sid {
    Sid::new(codes::XSD, name)
}

pub fn any_uri() -> Sid {
    xsd("anyURI")
}
pub fn string() -> Sid {
    xsd("string")
}
pub fn boolean() -> Sid {
    xsd("boolean")
}
pub fn long() -> Sid {
    xsd("long")
}
pub fn integer() -> Sid {
    xsd("integer")
}
pub fn int() -> Sid {
    xsd("int")
}
pub fn decimal() -> Sid {
    xsd("decimal")
}
pub fn double() -> Sid {
    xsd("double")
}
pub fn date_time() -> Sid {
    xsd("dateTime")
}
pub fn date() -> Sid {
    xsd("date")
}
pub fn time() -> Sid {
    xsd("time")
}

pub fn rdf_type() -> Sid {
    Sid::new(codes::RDF, "type")
}
pub fn lang_string() -> Sid {
    Sid::new(codes::RDF, "langString")
}
pub fn rdfs_sub_class_of() -> Sid {
    Sid::new(codes::RDFS, "subClassOf")
}
pub fn rdfs_class() -> Sid {
    Sid::new(codes::RDFS, "Class")
}

pub fn is_any_uri(dt: &Sid) -> bool {
    dt.namespace == codes::XSD && dt.name == "anyURI"
}

/// The string family: compared as strings, sized at two bytes per character.
pub fn is_string_family(dt: &Sid) -> bool {
    match (dt.namespace, dt.name.as_str()) {
        (codes::XSD, "string" | "normalizedString" | "token" | "language") => true,
        (codes::RDF, "langString") => true,
        _ => false,
    }
}

pub fn is_numeric(dt: &Sid) -> bool {
    if dt.namespace != codes::XSD {
        return false;
    }
    matches!(
        dt.name.as_str(),
        "integer"
            | "long"
            | "int"
            | "short"
            | "byte"
            | "decimal"
            | "double"
            | "float"
            | "nonNegativeInteger"
            | "nonPositiveInteger"
            | "positiveInteger"
            | "negativeInteger"
            | "unsignedLong"
            | "unsignedInt"
            | "unsignedShort"
            | "unsignedByte"
    )
}

pub fn is_temporal(dt: &Sid) -> bool {
    dt.namespace == codes::XSD && matches!(dt.name.as_str(), "dateTime" | "date" | "time")
}
