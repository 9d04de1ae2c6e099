//! Keyed, ordered collection of registry entities

use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::models::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Entities in first-seen order. Updates replace in place; nothing is ever
/// removed, because the backend sends no tombstones.
#[derive(Debug, Clone, Default)]
pub struct EntityStateStore {
    entities: Vec<Entity>,
}

impl EntityStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, entity: Entity) -> UpsertOutcome {
        match self.entities.iter_mut().find(|e| e.id == entity.id) {
            Some(existing) => {
                debug!("Replacing entity {}", entity.id);
                *existing = entity;
                UpsertOutcome::Replaced
            }
            None => {
                debug!("Inserting entity {}", entity.id);
                self.entities.push(entity);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Validate a raw update payload and upsert it. Payloads without an id
    /// are rejected and leave the store untouched.
    pub fn upsert_value(&mut self, payload: Value) -> Result<UpsertOutcome> {
        let entity = Entity::from_value(payload)?;
        Ok(self.upsert(entity))
    }

    pub fn list(&self) -> &[Entity] {
        &self.entities
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
