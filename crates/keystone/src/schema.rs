//! Collection schemas and row values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Partition every collection is created with.
pub const DEFAULT_PARTITION: &str = "_default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int64,
    Float,
    String,
    FloatVector { dim: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// Checks the schema is well formed: a non-empty name, unique non-empty
    /// field names, positive vector dimensions, at most one `Int64` primary
    /// key.
    pub fn validate(&self) -> Result<()> {
        validate_name("collection", &self.name)?;
        if self.fields.is_empty() {
            return Err(Error::invalid(format!(
                "collection {} has no fields",
                self.name
            )));
        }

        let mut seen = HashSet::with_capacity(self.fields.len());
        let mut primaries = 0;
        for field in &self.fields {
            validate_name("field", &field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(Error::invalid(format!("duplicate field {}", field.name)));
            }
            if let DataType::FloatVector { dim: 0 } = field.data_type {
                return Err(Error::invalid(format!(
                    "vector field {} must have dim > 0",
                    field.name
                )));
            }
            if field.is_primary {
                primaries += 1;
                if field.data_type != DataType::Int64 {
                    return Err(Error::invalid(format!(
                        "primary key {} must be int64",
                        field.name
                    )));
                }
            }
        }
        if primaries > 1 {
            return Err(Error::invalid("at most one primary key is allowed"));
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks that `row` carries exactly this schema's fields with matching
    /// types.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.fields.len() {
            return Err(Error::invalid(format!(
                "row has {} fields, collection {} expects {}",
                row.len(),
                self.name,
                self.fields.len()
            )));
        }
        for field in &self.fields {
            let value = row.get(&field.name).ok_or_else(|| {
                Error::invalid(format!("row is missing field {}", field.name))
            })?;
            if !value.matches(&field.data_type) {
                return Err(Error::invalid(format!(
                    "field {} expects {:?}",
                    field.name, field.data_type
                )));
            }
        }
        Ok(())
    }
}

/// One cell of a row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int64(i64),
    Float(f64),
    String(String),
    FloatVector(Vec<f32>),
}

impl FieldValue {
    pub fn matches(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Self::Bool(_), DataType::Bool)
            | (Self::Int64(_), DataType::Int64)
            | (Self::String(_), DataType::String) => true,
            // JSON integers are accepted for float fields.
            (Self::Float(_) | Self::Int64(_), DataType::Float) => true,
            (Self::FloatVector(v), DataType::FloatVector { dim }) => v.len() == *dim as usize,
            _ => false,
        }
    }
}

pub type Row = BTreeMap<String, FieldValue>;

pub(crate) fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid(format!("{what} name must not be empty")));
    }
    if name.len() > 255 {
        return Err(Error::invalid(format!("{what} name {name} is too long")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::invalid(format!(
            "{what} name {name} may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> CollectionSchema {
        CollectionSchema {
            name: "docs".into(),
            description: String::new(),
            fields: vec![
                FieldSchema {
                    name: "pk".into(),
                    data_type: DataType::Int64,
                    is_primary: true,
                },
                FieldSchema {
                    name: "embedding".into(),
                    data_type: DataType::FloatVector { dim: 2 },
                    is_primary: false,
                },
            ],
        }
    }

    #[test]
    fn well_formed_schema_validates() {
        schema().validate().unwrap();
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let mut s = schema();
        s.fields.push(s.fields[0].clone());
        assert!(matches!(s.validate(), Err(Error::ValidationFailed { .. })));
    }

    #[test]
    fn row_with_wrong_vector_dim_is_rejected() {
        let s = schema();
        let mut row = Row::new();
        row.insert("pk".into(), FieldValue::Int64(1));
        row.insert("embedding".into(), FieldValue::FloatVector(vec![0.1, 0.2, 0.3]));
        assert!(s.validate_row(&row).is_err());

        row.insert("embedding".into(), FieldValue::FloatVector(vec![0.1, 0.2]));
        s.validate_row(&row).unwrap();
    }

    #[test]
    fn json_rows_decode_untagged() {
        let row: Row = serde_json::from_str(r#"{"pk": 7, "embedding": [0.5, 1.5]}"#).unwrap();
        assert_eq!(row["pk"], FieldValue::Int64(7));
        schema().validate_row(&row).unwrap();
    }
}
