//! Time-series records accepted by the ingestion pipeline.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};
use crate::limits::{MAX_FIELDS, MAX_MEASUREMENT_LEN, MAX_TAGS};

static IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("identifier pattern compiles")
});

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Numeric view used for the float column.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Str(_) => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

fn validate_measurement(name: &str) -> std::result::Result<(), ValidationError> {
    if IDENT.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_measurement"))
    }
}

fn validate_tags(tags: &BTreeMap<String, String>) -> std::result::Result<(), ValidationError> {
    if tags.len() > MAX_TAGS {
        return Err(ValidationError::new("too_many_tags"));
    }
    if tags.keys().any(|k| k.is_empty()) {
        return Err(ValidationError::new("empty_tag_key"));
    }
    Ok(())
}

fn validate_fields(
    fields: &BTreeMap<String, FieldValue>,
) -> std::result::Result<(), ValidationError> {
    if fields.is_empty() {
        return Err(ValidationError::new("no_fields"));
    }
    if fields.len() > MAX_FIELDS {
        return Err(ValidationError::new("too_many_fields"));
    }
    for (key, value) in fields {
        if key.is_empty() {
            return Err(ValidationError::new("empty_field_key"));
        }
        if let FieldValue::Float(v) = value {
            if !v.is_finite() {
                let mut err = ValidationError::new("non_finite_field");
                err.message = Some(format!("field '{}' is not finite", key).into());
                return Err(err);
            }
        }
    }
    Ok(())
}

/// One observation: a measurement at a timestamp with tags and fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    #[validate(
        length(min = 1, max = MAX_MEASUREMENT_LEN),
        custom(function = "validate_measurement")
    )]
    pub measurement: String,
    #[serde(default)]
    #[validate(custom(function = "validate_tags"))]
    pub tags: BTreeMap<String, String>,
    #[validate(custom(function = "validate_fields"))]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(timestamp: DateTime<Utc>, measurement: impl Into<String>) -> Self {
        Self {
            timestamp,
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Validate, mapping failures into the engine error type.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::validation(format!("record '{}': {}", self.measurement, e)))
    }
}
