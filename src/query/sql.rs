//! SQL compilation of bound fetch requests

use crate::entity::Value;
use crate::model::{EntityDescription, FieldDescription};
use crate::predicate::{CompareOp, Predicate};
use crate::query::FetchRequest;
use crate::storage::schema::{quote_ident, OBJECT_ID_COLUMN};

/// Executable form of a fetch request
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    /// Selected field columns, in order, after the object id column
    pub columns: Vec<FieldDescription>,
}

/// Compile a request that has already been bound to the model.
///
/// The limit is not part of the SQL: pending changes in contexts are merged
/// on top of the store result before the limit applies.
pub fn compile(request: &FetchRequest, entity: &EntityDescription) -> CompiledQuery {
    let mut sql = format!("SELECT {}", quote_ident(OBJECT_ID_COLUMN));
    for field in &entity.fields {
        sql.push_str(", ");
        sql.push_str(&quote_ident(&field.name));
    }
    sql.push_str(" FROM ");
    sql.push_str(&quote_ident(&entity.name));

    let mut params = Vec::new();
    if let Some(predicate) = &request.predicate {
        sql.push_str(" WHERE ");
        write_predicate(predicate, &mut sql, &mut params);
    }

    if !request.sort.is_empty() {
        let order: Vec<String> = request
            .sort
            .iter()
            .map(|key| format!("{} {}", quote_ident(&key.field), if key.ascending { "ASC" } else { "DESC" }))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    CompiledQuery {
        sql,
        params,
        columns: entity.fields.clone(),
    }
}

fn write_predicate(predicate: &Predicate, sql: &mut String, params: &mut Vec<Value>) {
    match predicate {
        Predicate::True => sql.push('1'),
        Predicate::Compare { field, op, value } => {
            let column = quote_ident(field);
            match op {
                CompareOp::Eq => sql.push_str(&format!("{} IS ?", column)),
                CompareOp::Ne => sql.push_str(&format!("{} IS NOT ?", column)),
                // Ordering against null is never true, same as in memory.
                _ if value.is_null() => {
                    sql.push('0');
                    return;
                }
                CompareOp::Like => sql.push_str(&format!("({c} IS NOT NULL AND {c} LIKE ? ESCAPE '\\')", c = column)),
                CompareOp::Lt => sql.push_str(&format!("({c} IS NOT NULL AND {c} < ?)", c = column)),
                CompareOp::Le => sql.push_str(&format!("({c} IS NOT NULL AND {c} <= ?)", c = column)),
                CompareOp::Gt => sql.push_str(&format!("({c} IS NOT NULL AND {c} > ?)", c = column)),
                CompareOp::Ge => sql.push_str(&format!("({c} IS NOT NULL AND {c} >= ?)", c = column)),
            }
            params.push(value.clone());
        }
        Predicate::IsNull(field) => sql.push_str(&format!("{} IS NULL", quote_ident(field))),
        Predicate::IsNotNull(field) => sql.push_str(&format!("{} IS NOT NULL", quote_ident(field))),
        Predicate::And(parts) => write_joined(parts, " AND ", '1', sql, params),
        Predicate::Or(parts) => write_joined(parts, " OR ", '0', sql, params),
        Predicate::Not(inner) => {
            sql.push_str("NOT (");
            write_predicate(inner, sql, params);
            sql.push(')');
        }
    }
}

fn write_joined(parts: &[Predicate], sep: &str, empty: char, sql: &mut String, params: &mut Vec<Value>) {
    if parts.is_empty() {
        sql.push(empty);
        return;
    }
    sql.push('(');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            sql.push_str(sep);
        }
        write_predicate(part, sql, params);
    }
    sql.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;
    use crate::query::SortKey;

    fn book() -> EntityDescription {
        EntityDescription::new("Book")
            .field("title", FieldType::Text)
            .optional_field("pages", FieldType::Integer)
    }

    #[test]
    fn test_compile_select_with_filter_and_sort() {
        let request = FetchRequest::new("Book")
            .filter(Predicate::eq("title", "Dune").and(Predicate::gt("pages", 100)))
            .sort_by(SortKey::desc("pages"))
            .sort_by(SortKey::asc("title"));
        let compiled = compile(&request, &book());

        assert_eq!(
            compiled.sql,
            r#"SELECT "_object_id", "title", "pages" FROM "Book" WHERE ("title" IS ? AND ("pages" IS NOT NULL AND "pages" > ?)) ORDER BY "pages" DESC, "title" ASC"#
        );
        assert_eq!(compiled.params, vec![Value::from("Dune"), Value::from(100)]);
        assert_eq!(compiled.columns.len(), 2);
    }

    #[test]
    fn test_ordering_against_null_is_false() {
        let request = FetchRequest::new("Book").filter(Predicate::lt("pages", Value::Null));
        let compiled = compile(&request, &book());
        assert!(compiled.sql.ends_with("WHERE 0"));
        assert!(compiled.params.is_empty());
    }
}
