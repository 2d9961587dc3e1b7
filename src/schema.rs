//! The schema-validation library is an external collaborator (spec §1): the
//! core only needs "a schema object supporting parse/optional/describe".
//! This module defines that minimal seam plus a handful of concrete field
//! kinds sufficient for the compiler's own tests and for embedders who don't
//! want to bring their own validator.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::FieldViolation;

/// A structural type descriptor, compared for equality when the compiler
/// detects cross-action schema conflicts (spec §4.1 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    String,
    Integer,
    Number,
    Boolean,
    Enum(Vec<String>),
    Object(Vec<(String, Box<TypeDescriptor>)>),
    Array(Box<TypeDescriptor>),
}

/// A rendered field description, used when the compiler annotates a common
/// field with "(always required)" or "Required for: {...}".
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub type_descriptor: TypeDescriptor,
    pub description: Option<String>,
}

/// The minimal contract a schema field object must support: parse/validate a
/// JSON value, report whether it is optional, and describe its structural
/// type for conflict detection and documentation.
pub trait FieldSchema: fmt::Debug + Send + Sync {
    fn validate(&self, path: &str, value: Option<&Value>) -> Result<(), FieldViolation>;
    fn is_optional(&self) -> bool;
    fn describe(&self) -> FieldDescription;
}

pub type SchemaField = Arc<dyn FieldSchema>;

#[derive(Debug, Clone)]
pub struct StringField {
    pub optional: bool,
    pub description: Option<String>,
}

impl FieldSchema for StringField {
    fn validate(&self, path: &str, value: Option<&Value>) -> Result<(), FieldViolation> {
        match value {
            None if self.optional => Ok(()),
            None => Err(FieldViolation {
                path: path.to_string(),
                message: "required field missing".into(),
            }),
            Some(Value::String(_)) => Ok(()),
            Some(_) => Err(FieldViolation {
                path: path.to_string(),
                message: "expected string".into(),
            }),
        }
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    fn describe(&self) -> FieldDescription {
        FieldDescription {
            type_descriptor: TypeDescriptor::String,
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntField {
    pub optional: bool,
    pub description: Option<String>,
}

impl FieldSchema for IntField {
    fn validate(&self, path: &str, value: Option<&Value>) -> Result<(), FieldViolation> {
        match value {
            None if self.optional => Ok(()),
            None => Err(FieldViolation {
                path: path.to_string(),
                message: "required field missing".into(),
            }),
            Some(v) if v.is_i64() || v.is_u64() => Ok(()),
            Some(_) => Err(FieldViolation {
                path: path.to_string(),
                message: "expected integer".into(),
            }),
        }
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    fn describe(&self) -> FieldDescription {
        FieldDescription {
            type_descriptor: TypeDescriptor::Integer,
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoolField {
    pub optional: bool,
    pub description: Option<String>,
}

impl FieldSchema for BoolField {
    fn validate(&self, path: &str, value: Option<&Value>) -> Result<(), FieldViolation> {
        match value {
            None if self.optional => Ok(()),
            None => Err(FieldViolation {
                path: path.to_string(),
                message: "required field missing".into(),
            }),
            Some(Value::Bool(_)) => Ok(()),
            Some(_) => Err(FieldViolation {
                path: path.to_string(),
                message: "expected boolean".into(),
            }),
        }
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    fn describe(&self) -> FieldDescription {
        FieldDescription {
            type_descriptor: TypeDescriptor::Boolean,
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnumField {
    pub values: Vec<String>,
    pub optional: bool,
    pub description: Option<String>,
}

impl FieldSchema for EnumField {
    fn validate(&self, path: &str, value: Option<&Value>) -> Result<(), FieldViolation> {
        match value {
            None if self.optional => Ok(()),
            None => Err(FieldViolation {
                path: path.to_string(),
                message: "required field missing".into(),
            }),
            Some(Value::String(s)) if self.values.contains(s) => Ok(()),
            Some(_) => Err(FieldViolation {
                path: path.to_string(),
                message: format!("expected one of {:?}", self.values),
            }),
        }
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    fn describe(&self) -> FieldDescription {
        FieldDescription {
            type_descriptor: TypeDescriptor::Enum(self.values.clone()),
            description: self.description.clone(),
        }
    }
}
