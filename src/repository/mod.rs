//! Event-log-backed repositories.
//!
//! A repository is a namespaced CRUD facade whose state is the left fold of
//! its namespace's events (see [`project`]). Reads inside a transaction see
//! the transaction's staged events; reads outside do not.
//!
//! ## Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use sourced_cache::prelude::*;
//!
//! #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Entity)]
//! struct Todo {
//!     id: u64,
//!     title: String,
//! }
//!
//! let repo = EventLogRepository::<Todo, u64>::new(EventLog::new());
//! let ctx = Context::background();
//!
//! let mut todo = Todo { id: 0, title: "write docs".into() };
//! repo.create(&ctx, &mut todo).unwrap();
//! assert_ne!(todo.id, 0);
//!
//! let found = repo.find_by_id(&ctx, &todo.id).unwrap();
//! assert_eq!(found, Some(todo));
//! ```
//!
//! Read-modify-write operations (the existence check of `create`, for
//! example) are not atomic across threads unless wrapped in a transaction
//! via [`OnePhaseCommit`](crate::crud::OnePhaseCommit).

mod log_repository;
mod projection;
mod publisher;

use serde::{de::DeserializeOwned, Serialize};

pub use log_repository::EventLogRepository;
pub use projection::project;

/// Bounds every entity stored in an event-log repository must satisfy.
///
/// `Default` provides the shell carried by `DeleteById` events.
pub trait Storable: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Storable for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}
