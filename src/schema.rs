//! # Entity schemas
//!
//! Static descriptions of stored entities: field constraints, indexes, the
//! physical collection name and the placeholder record bootstrap uses to force
//! the collection into existence.

use std::sync::LazyLock;

use mongodb::bson::{Bson, Document};

use crate::errors::DbError;
use crate::models::Doctor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Boolean,
    Number,
    Timestamp,
    /// Embedded document with a required `line1` and optional `line2`.
    Address,
    /// Mapping of key to a non-empty array of strings.
    SlotMap,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Text must not be blank; numbers must be strictly positive.
    pub strict: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            strict: true,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
    /// Compare string keys ignoring letter case.
    pub case_insensitive: bool,
}

impl IndexSpec {
    pub fn unique_case_insensitive(field: &str) -> Self {
        Self {
            name: format!("{field}_1"),
            keys: vec![field.to_string()],
            unique: true,
            case_insensitive: true,
        }
    }
}

/// The `(field, value)` pair identifying placeholder records.
#[derive(Debug, Clone, Copy)]
pub struct Sentinel {
    pub field: &'static str,
    pub value: &'static str,
}

#[derive(Debug)]
pub struct EntitySchema {
    pub name: &'static str,
    pub collection: &'static str,
    pub fields: Vec<FieldSpec>,
    pub indexes: Vec<IndexSpec>,
    /// Maintain `createdAt` / `updatedAt` on writes.
    pub timestamps: bool,
    pub placeholder: fn() -> Document,
    pub sentinel: Sentinel,
}

impl EntitySchema {
    /// Checks `doc` against every declared field constraint.
    pub fn validate(&self, doc: &Document) -> Result<(), DbError> {
        for spec in &self.fields {
            match doc.get(spec.name) {
                None | Some(Bson::Null) if spec.required => {
                    return Err(DbError::validation(spec.name, "is required"));
                }
                None | Some(Bson::Null) => {}
                Some(value) => check_value(spec, value)?,
            }
        }
        Ok(())
    }
}

fn check_value(spec: &FieldSpec, value: &Bson) -> Result<(), DbError> {
    let field = spec.name;
    match (spec.kind, value) {
        (FieldKind::Text, Bson::String(s)) => {
            if spec.strict && s.trim().is_empty() {
                return Err(DbError::validation(field, "must not be empty"));
            }
        }
        (FieldKind::Boolean, Bson::Boolean(_)) => {}
        (FieldKind::Number, Bson::Double(n)) => check_number(spec, *n)?,
        (FieldKind::Number, Bson::Int32(n)) => check_number(spec, f64::from(*n))?,
        (FieldKind::Number, Bson::Int64(n)) => check_number(spec, *n as f64)?,
        (FieldKind::Timestamp, Bson::DateTime(_) | Bson::Int64(_) | Bson::Double(_)) => {}
        (FieldKind::Address, Bson::Document(address)) => match address.get("line1") {
            Some(Bson::String(line1)) if !line1.trim().is_empty() => {}
            _ => return Err(DbError::validation(field, "line1 is required")),
        },
        (FieldKind::SlotMap, Bson::Document(slots)) => {
            for (date, booked) in slots {
                match booked {
                    Bson::Array(items) if items.is_empty() => {
                        return Err(DbError::validation(
                            field,
                            format!("date `{date}` maps to an empty slot list"),
                        ));
                    }
                    Bson::Array(items) if items.iter().all(|i| matches!(i, Bson::String(_))) => {}
                    _ => {
                        return Err(DbError::validation(
                            field,
                            format!("date `{date}` must map to a list of slot labels"),
                        ));
                    }
                }
            }
        }
        (kind, other) => {
            return Err(DbError::validation(
                field,
                format!("expected {kind:?}, found {:?}", other.element_type()),
            ));
        }
    }
    Ok(())
}

fn check_number(spec: &FieldSpec, n: f64) -> Result<(), DbError> {
    if !n.is_finite() || (spec.strict && n <= 0.0) {
        return Err(DbError::validation(spec.name, "must be greater than zero"));
    }
    Ok(())
}

pub const DOCTOR: &str = "Doctor";
pub const DOCTORS_COLLECTION: &str = "doctors";
pub const DOCTOR_SENTINEL_EMAIL: &str = "bootstrap-placeholder@sentinel.invalid";

static DOCTOR_SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| EntitySchema {
    name: DOCTOR,
    collection: DOCTORS_COLLECTION,
    fields: vec![
        FieldSpec::required("name", FieldKind::Text),
        FieldSpec::required("email", FieldKind::Text),
        FieldSpec::required("password", FieldKind::Text),
        FieldSpec::required("speciality", FieldKind::Text),
        FieldSpec::required("degree", FieldKind::Text),
        FieldSpec::required("experience", FieldKind::Text),
        FieldSpec::required("about", FieldKind::Text),
        FieldSpec::optional("available", FieldKind::Boolean),
        FieldSpec::required("fees", FieldKind::Number),
        FieldSpec::required("address", FieldKind::Address),
        FieldSpec::optional("date", FieldKind::Timestamp),
        FieldSpec::optional("slots_booked", FieldKind::SlotMap),
        FieldSpec::optional("slots_version", FieldKind::Number),
    ],
    indexes: vec![IndexSpec::unique_case_insensitive("email")],
    timestamps: true,
    placeholder: Doctor::placeholder_document,
    sentinel: Sentinel {
        field: "email",
        value: DOCTOR_SENTINEL_EMAIL,
    },
});

pub fn doctor_schema() -> &'static EntitySchema {
    &DOCTOR_SCHEMA
}
