//! Lightweight migration - in-place schema changes inferred from two models
//!
//! Only additive changes are inferred: new entities and new optional fields.
//! Anything else makes the store incompatible with the model, and the store
//! is recreated.

use crate::model::{FieldDescription, Model};
use super::schema;

/// One in-place schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    AddEntity(String),
    AddField { entity: String, field: FieldDescription },
}

impl MigrationStep {
    pub fn sql(&self, target: &Model) -> Option<String> {
        match self {
            MigrationStep::AddEntity(name) => target
                .entity_named(name)
                .map(schema::create_entity_table),
            MigrationStep::AddField { entity, field } => Some(schema::add_column(entity, field)),
        }
    }
}

/// Infer the steps that turn a store built from `stored` into one for `target`.
///
/// Returns `Err` with the first incompatible difference.
pub fn plan(stored: &Model, target: &Model) -> std::result::Result<Vec<MigrationStep>, String> {
    let mut steps = Vec::new();

    for old in &stored.entities {
        let Some(new) = target.entity_named(&old.name) else {
            return Err(format!("entity {} was removed", old.name));
        };
        for old_field in &old.fields {
            match new.field_named(&old_field.name) {
                None => return Err(format!("field {}.{} was removed", old.name, old_field.name)),
                Some(f) if f.ty != old_field.ty => {
                    return Err(format!(
                        "field {}.{} changed type from {} to {}",
                        old.name, f.name, old_field.ty, f.ty
                    ));
                }
                Some(f) if !f.optional && old_field.optional => {
                    return Err(format!("field {}.{} became required", old.name, f.name));
                }
                Some(_) => {}
            }
        }
        for new_field in &new.fields {
            if old.field_named(&new_field.name).is_none() {
                if !new_field.optional {
                    return Err(format!(
                        "required field {}.{} was added",
                        new.name, new_field.name
                    ));
                }
                steps.push(MigrationStep::AddField {
                    entity: new.name.clone(),
                    field: new_field.clone(),
                });
            }
        }
    }

    for new in &target.entities {
        if stored.entity_named(&new.name).is_none() {
            steps.push(MigrationStep::AddEntity(new.name.clone()));
        }
    }

    Ok(steps)
}
