//! Read-through cache manager.
//!
//! ```text
//!                  find_by_id / find_all
//!                          │
//!                          ▼
//!   ┌────────────────── Manager ──────────────────┐
//!   │ 1. entity store (find_by_id only)           │
//!   │ 2. hit store: fingerprint -> [ID]           │──miss──▶ Source
//!   │ 3. per-fingerprint lock, then memoise       │◀─────────  │
//!   └─────────────────────────────────────────────┘            │
//!                 ▲                                             │
//!                 └──── Invalidator ◀── create/update/delete ───┘
//! ```
//!
//! Writes go to the source first and are then applied to the cache storage
//! in one storage transaction. The invalidator re-applies the same changes,
//! idempotently, for mutations that reach the source from elsewhere.

mod hit;
mod invalidation;
mod lock;
mod manager;
mod storage;

pub use hit::Hit;
pub use manager::{Manager, Source, UpdateSource};
pub use storage::{CacheStorage, EntityStore, HitStore, InMemoryCacheStorage};
