//! The flake data model: compact subject identifiers, typed object values,
//! the seven-tuple statement record, its comparator families, and the sorted
//! containers the index engine is built from.

use serde::Serialize;

mod cmp;
mod flake;
mod set;
mod sid;
mod value;

pub mod coerce;
pub mod dt;

pub use cmp::IndexKind;
pub use flake::{Flake, Meta};
pub use set::{FlakeSet, Test};
pub use sid::{codes, split_iri, Namespaces, Sid, LEDGER_NS, RDFS_NS, RDF_NS, SHACL_NS, XSD_NS};
pub use value::{compare_obj, Value};

#[derive(thiserror::Error, Debug, Serialize)]
pub enum Error {
    #[error("IRI '{0}' references a namespace not known to this ledger")]
    UnknownNamespace(String),
    #[error("namespace code {0} is not known to this ledger")]
    UnknownNamespaceCode(u32),
    #[error("value {value} cannot be coerced to provided datatype: {datatype}")]
    ValueCoercion { value: String, datatype: String },
}

impl Error {
    /// HTTP-shaped status for surfacing through outer layers.
    pub fn status(&self) -> u16 {
        400
    }
}
