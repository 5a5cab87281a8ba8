use serde::{Deserialize, Serialize};

use crate::id::{Entity, EntityId};

/// Memoised result of one query: the IDs it produced, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit<ID> {
    /// Query fingerprint, `"0:<entity type>/<query name>"`.
    pub query_id: String,
    pub entity_ids: Vec<ID>,
}

impl<ID> Hit<ID> {
    pub fn new(query_id: impl Into<String>, entity_ids: Vec<ID>) -> Self {
        Self {
            query_id: query_id.into(),
            entity_ids,
        }
    }
}

impl<ID> Default for Hit<ID> {
    fn default() -> Self {
        Self {
            query_id: String::new(),
            entity_ids: Vec::new(),
        }
    }
}

impl<ID: EntityId> Entity for Hit<ID> {
    type Id = String;

    fn id(&self) -> &String {
        &self.query_id
    }

    fn set_id(&mut self, id: String) {
        self.query_id = id;
    }
}
