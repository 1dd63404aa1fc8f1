//! Model - entity descriptions supplied by the embedding application
//!
//! A model is loaded from TOML:
//!
//! ```toml
//! name = "Library"
//! version = 1
//!
//! [[entities]]
//! name = "Book"
//! fields = [
//!     { name = "title", type = "text" },
//!     { name = "pages", type = "integer", optional = true },
//! ]
//! ```

use crate::entity::Entity;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Storage type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float", alias = "double")]
    Real,
    #[serde(alias = "string")]
    Text,
    #[serde(alias = "boolean")]
    Bool,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Text => "text",
            FieldType::Bool => "bool",
        }
    }

    /// Column type used in the SQLite table
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Integer | FieldType::Bool => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text => "TEXT",
        }
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "integer" | "int" | "i64" => Ok(FieldType::Integer),
            "real" | "float" | "double" | "f64" => Ok(FieldType::Real),
            "text" | "string" | "str" => Ok(FieldType::Text),
            "bool" | "boolean" => Ok(FieldType::Bool),
            _ => Err(Error::Model(format!("Unknown field type: {}", s))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Optional fields may hold null
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescription>,
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a required field
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldDescription { name: name.into(), ty, optional: false });
        self
    }

    /// Add a field that may be null
    pub fn optional_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldDescription { name: name.into(), ty, optional: true });
        self
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldDescription> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field, failing with `UnknownField`
    pub fn require_field(&self, name: &str) -> Result<&FieldDescription> {
        self.field_named(name).ok_or_else(|| Error::UnknownField {
            entity: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Check a record against this description.
    ///
    /// Every set field must be declared and hold a value of its type;
    /// required fields must be present and non-null.
    pub fn validate(&self, entity: &Entity) -> Result<()> {
        for (name, value) in &entity.fields {
            let field = self.require_field(name)?;
            if !value.fits(field.ty) {
                return Err(Error::Validation(format!(
                    "{}.{} expects {}, got {:?} (object {})",
                    self.name, name, field.ty, value, entity.id
                )));
            }
        }
        for field in self.fields.iter().filter(|f| !f.optional) {
            if entity.get(&field.name).is_null() {
                return Err(Error::Validation(format!(
                    "{}.{} is required (object {})",
                    self.name, field.name, entity.id
                )));
            }
        }
        Ok(())
    }
}

/// Complete schema: the set of entity descriptions a store is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entities: Vec<EntityDescription>,
}

fn default_version() -> u32 {
    1
}

impl Model {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            entities: Vec::new(),
        }
    }

    /// Builder-style entity registration
    pub fn entity(mut self, entity: EntityDescription) -> Self {
        self.entities.push(entity);
        self
    }

    /// Load and validate a model from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|e| Error::Model(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let model: Model = toml::from_str(contents).map_err(|e| Error::Model(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Model(e.to_string()))
    }

    pub fn entity_named(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Look up an entity, failing with `UnknownEntity`
    pub fn require_entity(&self, name: &str) -> Result<&EntityDescription> {
        self.entity_named(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Check identifiers and uniqueness
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entity in &self.entities {
            check_identifier(&entity.name)?;
            if !seen.insert(entity.name.as_str()) {
                return Err(Error::Model(format!("Duplicate entity: {}", entity.name)));
            }
            let mut fields = std::collections::HashSet::new();
            for field in &entity.fields {
                check_identifier(&field.name)?;
                if !fields.insert(field.name.as_str()) {
                    return Err(Error::Model(format!(
                        "Duplicate field {}.{}",
                        entity.name, field.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fingerprint of the model contents, stored alongside the data
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)
            .map_err(|e| Error::Model(e.to_string()))?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }
}

/// Identifiers become table and column names; a leading underscore is
/// reserved for internal columns.
fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Model(format!("Invalid identifier: {:?}", name)))
    }
}
