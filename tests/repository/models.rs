#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use sourced_cache::Entity;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Entity)]
pub struct Item {
    pub id: u64,
    pub v: String,
}

pub fn item(id: u64, v: &str) -> Item {
    Item { id, v: v.into() }
}

/// Keyed by a non-`id` field, stored under an explicit namespace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Entity)]
#[entity(namespace = "accounts")]
pub struct Account {
    #[entity(id)]
    pub handle: String,
    pub balance: i64,
}
