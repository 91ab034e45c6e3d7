//! JSON seed data for in-memory runs
//!
//! ```json
//! {
//!   "entities": [
//!     {
//!       "entity_type": "agent",
//!       "entity_id": "a1",
//!       "entity_name": "Planner",
//!       "local": { "version": "3", "timestamp": "2024-05-01T10:00:00Z", "payload": { "goal": "plan" } },
//!       "remote": {
//!         "primary": { "version": "4", "timestamp": "2024-05-02T10:00:00Z", "payload": { "goal": "ship" } }
//!       }
//!     }
//!   ]
//! }
//! ```

use anyhow::Context;
use mcpsync_engine::{
    EntityDescriptor, LocalEntity, MemoryRepository, MemoryTransport, RemoteEntity, Replica, SyncEngine,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub entities: Vec<SeedEntity>,
}

#[derive(Debug, Deserialize)]
pub struct SeedEntity {
    #[serde(flatten)]
    pub descriptor: EntityDescriptor,
    #[serde(default)]
    pub local: Option<Replica>,
    /// Remote replicas by server id
    #[serde(default)]
    pub remote: BTreeMap<String, Replica>,
}

impl Seed {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
    }

    /// Fill both sides and start tracking every entity; returns the entity count
    pub async fn apply(
        self,
        engine: &SyncEngine,
        repository: &MemoryRepository,
        transport: &MemoryTransport,
    ) -> anyhow::Result<usize> {
        let count = self.entities.len();
        for entity in self.entities {
            let key = entity.descriptor.key();
            let name = entity.descriptor.entity_name.clone();

            if let Some(replica) = entity.local {
                repository.put(
                    key.clone(),
                    LocalEntity {
                        entity_name: name.clone(),
                        replica,
                        has_local_edits: false,
                    },
                );
            }
            for (server_id, replica) in entity.remote {
                transport.put_remote(
                    &server_id,
                    key.clone(),
                    RemoteEntity {
                        entity_name: name.clone(),
                        replica,
                    },
                );
            }

            engine
                .track_entity(entity.descriptor)
                .await
                .with_context(|| format!("tracking {}", key))?;
            debug!(entity = %key, "seeded");
        }
        Ok(count)
    }
}
