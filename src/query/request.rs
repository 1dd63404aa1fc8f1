//! Fetch requests

use crate::entity::Entity;
use crate::model::Model;
use crate::predicate::Predicate;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// One sort criterion; keys apply in order (primary, secondary, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), ascending: true }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), ascending: false }
    }
}

impl FromStr for SortKey {
    type Err = Error;

    /// `field`, `field:asc` or `field:desc`
    fn from_str(s: &str) -> Result<Self> {
        let (field, direction) = s.split_once(':').unwrap_or((s, "asc"));
        let field = field.trim();
        if field.is_empty() {
            return Err(Error::Parse(format!("Missing field in sort key: {:?}", s)));
        }
        match direction.trim().to_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortKey::asc(field)),
            "desc" | "descending" => Ok(SortKey::desc(field)),
            other => Err(Error::Parse(format!("Unknown sort direction: {}", other))),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, if self.ascending { "asc" } else { "desc" })
    }
}

/// Request for the objects of one entity
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

/// Build a request from its parts
pub fn build_query(
    entity: impl Into<String>,
    predicate: Option<Predicate>,
    sort: Option<Vec<SortKey>>,
) -> FetchRequest {
    FetchRequest {
        entity: entity.into(),
        predicate,
        sort: sort.unwrap_or_default(),
        limit: None,
    }
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        build_query(entity, None, None)
    }

    /// Restrict results; combines with an existing predicate using AND
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validate against the model and coerce predicate literals to field types
    pub fn bind(self, model: &Model) -> Result<Self> {
        let description = model.require_entity(&self.entity)?;
        for key in &self.sort {
            description.require_field(&key.field)?;
        }
        let predicate = match self.predicate {
            Some(p) => Some(p.bind(description)?),
            None => None,
        };
        Ok(Self { predicate, ..self })
    }

    /// Whether an in-memory object belongs to this request's result
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.entity == self.entity
            && self.predicate.as_ref().is_none_or(|p| p.matches(entity))
    }

    /// Stable sort by the request's keys
    pub fn order(&self, results: &mut [Entity]) {
        if self.sort.is_empty() {
            return;
        }
        results.sort_by(|a, b| {
            for key in &self.sort {
                let ord = a.get(&key.field).sort_cmp(b.get(&key.field));
                let ord = if key.ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    /// Apply ordering and limit to a merged result
    pub fn finish(&self, mut results: Vec<Entity>) -> Vec<Entity> {
        self.order(&mut results);
        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityDescription, FieldType};

    fn model() -> Model {
        Model::new("Library", 1).entity(
            EntityDescription::new("Book")
                .field("title", FieldType::Text)
                .optional_field("pages", FieldType::Integer),
        )
    }

    #[test]
    fn test_bind_rejects_unknown_sort_field() {
        let request = FetchRequest::new("Book").sort_by(SortKey::asc("isbn"));
        assert!(request.bind(&model()).is_err());
        assert!(FetchRequest::new("Shelf").bind(&model()).is_err());
    }

    #[test]
    fn test_order_uses_keys_in_sequence() {
        let request = build_query(
            "Book",
            None,
            Some(vec![SortKey::desc("pages"), SortKey::asc("title")]),
        );
        let books = vec![
            Entity::new("Book").with("title", "b").with("pages", 100),
            Entity::new("Book").with("title", "a").with("pages", 100),
            Entity::new("Book").with("title", "c").with("pages", 300),
        ];
        let ordered = request.limit(2).finish(books);
        let titles: Vec<_> = ordered.iter().filter_map(|b| b.get_str("title")).collect();
        assert_eq!(titles, vec!["c", "a"]);
    }

    #[test]
    fn test_sort_key_parsing() {
        assert_eq!("pages:desc".parse::<SortKey>().unwrap(), SortKey::desc("pages"));
        assert_eq!("title".parse::<SortKey>().unwrap(), SortKey::asc("title"));
        assert!("title:sideways".parse::<SortKey>().is_err());
    }

    #[test]
    fn test_filter_combines_predicates() {
        let request = FetchRequest::new("Book")
            .filter(Predicate::eq("title", "Dune"))
            .filter(Predicate::gt("pages", 10));
        let book = Entity::new("Book").with("title", "Dune").with("pages", 412);
        assert!(request.matches(&book));
        assert!(!request.matches(&Entity::new("Author").with("title", "Dune").with("pages", 412)));
    }
}
