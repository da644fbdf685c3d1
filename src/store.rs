//! Pluggable diagram persistence (spec §6).
//!
//! `Store` is the seam between the collaborative core and whatever owns
//! the diagram's durable state upstream — mirrors the shape of
//! `clawd::session::runner::Runner`: a small async-trait the hub is
//! generic over, so the real backend never has to live in this crate.

use crate::diagram::Diagram;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, diagram_id: Uuid) -> Result<Diagram, StoreError>;
    async fn update(&self, diagram_id: Uuid, diagram: Diagram) -> Result<(), StoreError>;
}

/// In-process `Store` used for tests and for running the hub without an
/// upstream diagram service wired in. Not suitable as the production
/// backend — it has no durability across restarts.
#[derive(Default)]
pub struct InMemoryStore {
    diagrams: Mutex<HashMap<Uuid, Diagram>>,
    fail_next: Mutex<bool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, diagram: Diagram) {
        self.diagrams.lock().unwrap().insert(diagram.id, diagram);
    }

    /// Makes the next `update` call fail, to exercise save-failure paths.
    pub async fn fail_next_update(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, diagram_id: Uuid) -> Result<Diagram, StoreError> {
        self.diagrams
            .lock()
            .unwrap()
            .get(&diagram_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update(&self, diagram_id: Uuid, diagram: Diagram) -> Result<(), StoreError> {
        let mut fail = self.fail_next.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(StoreError::Backend("simulated failure".to_string()));
        }
        drop(fail);
        self.diagrams.lock().unwrap().insert(diagram_id, diagram);
        Ok(())
    }
}
