//! Annotation message description.
//!
//! A compact stand-in for a compiled message descriptor: the list of enum
//! fields of the annotation message and the named values of each enum.
//! Loaded from YAML (or JSON, which YAML accepts).
//!
//! ```yaml
//! fields:
//!   - name: level
//!     number: 1
//!     values:
//!       - { name: LEVEL_1, number: 1 }
//!       - { name: LEVEL_2, number: 2 }
//! ```

use super::raw_decode_annotation_serialization;
use crate::core::{Result, TuningForkError};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

/// Enum fields making up the annotation message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDescriptor {
    /// Fields in declaration order
    #[serde(default)]
    pub fields: Vec<AnnotationField>,
}

/// A single enum-typed field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationField {
    /// Field name
    pub name: String,
    /// 1-based field number
    pub number: u32,
    /// Named enum values; 0 is reserved for "absent" and need not be listed
    #[serde(default)]
    pub values: Vec<EnumValue>,
}

/// A named enum value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumValue {
    /// Value name
    pub name: String,
    /// Wire value
    pub number: u32,
}

impl AnnotationDescriptor {
    /// Parse a descriptor from YAML or JSON text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let descriptor: Self = serde_yaml::from_str(text).map_err(|e| {
            TuningForkError::config(format!("Failed to parse annotation descriptor: {}", e))
        })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Load a descriptor file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TuningForkError::config(format!("Failed to read annotation descriptor {:?}: {}", path, e))
        })?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<()> {
        for (i, field) in self.fields.iter().enumerate() {
            if field.number == 0 || field.number > 31 {
                return Err(TuningForkError::config(format!(
                    "Annotation field {} has number {}, expected 1..=31",
                    field.name, field.number
                )));
            }
            if self.fields[..i].iter().any(|f| f.number == field.number) {
                return Err(TuningForkError::config(format!(
                    "Annotation field number {} used twice",
                    field.number
                )));
            }
        }
        Ok(())
    }

    /// Cardinality of each field, ordered by field number.
    ///
    /// The cardinality is the largest value number declared for the field.
    pub fn enum_sizes(&self) -> Vec<u32> {
        let mut fields: Vec<&AnnotationField> = self.fields.iter().collect();
        fields.sort_by_key(|f| f.number);
        fields
            .iter()
            .map(|f| f.values.iter().map(|v| v.number).max().unwrap_or(0))
            .collect()
    }

    /// Field with the given number
    pub fn field(&self, number: u32) -> Option<&AnnotationField> {
        self.fields.iter().find(|f| f.number == number)
    }
}

impl AnnotationField {
    /// Name of the value, if declared
    pub fn value_name(&self, number: u64) -> Option<&str> {
        self.values
            .iter()
            .find(|v| u64::from(v.number) == number)
            .map(|v| v.name.as_str())
    }
}

/// Render serialized annotation bytes as `{field:VALUE,...}`.
///
/// Unknown fields are skipped and undeclared values are printed as numbers.
pub fn human_readable_annotation(ser: &[u8], descriptor: &AnnotationDescriptor) -> String {
    let Ok(fields) = raw_decode_annotation_serialization(ser) else {
        return "Error decoding annotation".to_string();
    };
    let mut out = String::from("{");
    let mut first = true;
    for (number, value) in fields {
        let Some(field) = descriptor.field(number) else {
            continue;
        };
        if !first {
            out.push(',');
        }
        first = false;
        match field.value_name(value) {
            Some(name) => {
                let _ = write!(out, "{}:{}", field.name, name);
            },
            None => {
                let _ = write!(out, "{}:{}", field.name, value);
            },
        }
    }
    out.push('}');
    out
}
