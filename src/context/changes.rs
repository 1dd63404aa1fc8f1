//! Pending changes held by a context

use std::collections::BTreeMap;

use crate::entity::{Entity, ObjectId};
use crate::model::Model;
use crate::query::FetchRequest;
use crate::Result;

/// Staged mutation of one object
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert or replace the whole object
    Upsert(Entity),
    /// Remove the object of the named entity
    Delete { entity: String },
}

/// Pending mutations keyed by object identity; the latest change per object wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: BTreeMap<ObjectId, Change>,
}

impl ChangeSet {
    pub fn upsert(&mut self, entity: Entity) {
        self.changes.insert(entity.id, Change::Upsert(entity));
    }

    pub fn delete(&mut self, entity: &Entity) {
        self.changes.insert(
            entity.id,
            Change::Delete { entity: entity.entity.clone() },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &Change)> {
        self.changes.iter()
    }

    /// Fold a child's changes into this set; the child's entry replaces ours
    pub fn merge(&mut self, child: ChangeSet) {
        self.changes.extend(child.changes);
    }

    /// Check every upserted object against the model
    pub fn validate(&self, model: &Model) -> Result<()> {
        for change in self.changes.values() {
            match change {
                Change::Upsert(entity) => model.require_entity(&entity.entity)?.validate(entity)?,
                Change::Delete { entity } => {
                    model.require_entity(entity)?;
                }
            }
        }
        Ok(())
    }

    /// Lay these changes over a result fetched from further up the tree.
    ///
    /// Objects touched here are replaced by their pending version, or dropped
    /// when deleted or when the pending version no longer matches.
    pub fn overlay(&self, request: &FetchRequest, base: Vec<Entity>) -> Vec<Entity> {
        if self.changes.is_empty() {
            return base;
        }
        let mut merged: Vec<Entity> = base
            .into_iter()
            .filter(|e| !self.changes.contains_key(&e.id))
            .collect();
        for change in self.changes.values() {
            if let Change::Upsert(entity) = change {
                if request.matches(entity) {
                    merged.push(entity.clone());
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Predicate;

    #[test]
    fn test_latest_change_wins() {
        let book = Entity::new("Book").with("title", "Dune");
        let mut changes = ChangeSet::default();
        changes.upsert(book.clone());
        changes.delete(&book);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes.get(&book.id), Some(Change::Delete { .. })));
    }

    #[test]
    fn test_merge_prefers_child() {
        let book = Entity::new("Book").with("title", "Dune");
        let mut parent = ChangeSet::default();
        parent.upsert(book.clone());

        let mut child = ChangeSet::default();
        child.upsert(book.clone().with("title", "Dune Messiah"));
        parent.merge(child);

        match parent.get(&book.id) {
            Some(Change::Upsert(e)) => assert_eq!(e.get_str("title"), Some("Dune Messiah")),
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_overlay_hides_and_replaces() {
        let kept = Entity::new("Book").with("title", "Emma");
        let deleted = Entity::new("Book").with("title", "Dune");
        let renamed = Entity::new("Book").with("title", "Ulysses");
        let base = vec![kept.clone(), deleted.clone(), renamed.clone()];

        let mut changes = ChangeSet::default();
        changes.delete(&deleted);
        changes.upsert(renamed.clone().with("title", "Odyssey"));
        changes.upsert(Entity::new("Book").with("title", "Beloved"));

        let request = FetchRequest::new("Book").filter(Predicate::ne("title", "Odyssey"));
        let merged = changes.overlay(&request, base);
        let mut titles: Vec<_> = merged.iter().filter_map(|e| e.get_str("title")).collect();
        titles.sort();
        assert_eq!(titles, vec!["Beloved", "Emma"]);
    }
}
