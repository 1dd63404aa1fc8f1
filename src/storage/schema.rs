//! Database schema definitions derived from the model

use crate::model::{EntityDescription, FieldDescription, Model};

/// Primary key column present in every entity table
pub const OBJECT_ID_COLUMN: &str = "_object_id";

/// Name of the table holding the model the store was built from
pub const METADATA_TABLE: &str = "_datastack_metadata";

/// SQL to create the metadata table
pub const CREATE_METADATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _datastack_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Metadata key for the model JSON
pub const MODEL_KEY: &str = "model";

/// Metadata key for the model fingerprint
pub const MODEL_HASH_KEY: &str = "model_hash";

/// Quote an identifier for use in SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_definition(field: &FieldDescription) -> String {
    format!("{} {}", quote_ident(&field.name), field.ty.sql_type())
}

/// SQL to create the table for one entity
pub fn create_entity_table(entity: &EntityDescription) -> String {
    let mut columns = vec![format!("{} TEXT PRIMARY KEY", quote_ident(OBJECT_ID_COLUMN))];
    columns.extend(entity.fields.iter().map(column_definition));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&entity.name),
        columns.join(", ")
    )
}

/// SQL to add a column to an existing entity table
pub fn add_column(entity: &str, field: &FieldDescription) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(entity),
        column_definition(field)
    )
}

/// All schema creation statements for a fresh store
pub fn all_schema_statements(model: &Model) -> Vec<String> {
    let mut stmts = vec![CREATE_METADATA_TABLE.to_string()];
    stmts.extend(model.entities.iter().map(create_entity_table));
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    #[test]
    fn test_entity_table_sql() {
        let entity = EntityDescription::new("Book")
            .field("title", FieldType::Text)
            .optional_field("available", FieldType::Bool);
        assert_eq!(
            create_entity_table(&entity),
            r#"CREATE TABLE IF NOT EXISTS "Book" ("_object_id" TEXT PRIMARY KEY, "title" TEXT, "available" INTEGER)"#
        );
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
