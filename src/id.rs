//! Entity identity - ID types, the tag-driven `Entity` trait, and the
//! `IdAccessor` the repositories and the cache manager use at runtime.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::context::Context;
use crate::error::Result;

/// Types usable as entity identifiers.
///
/// An ID equal to its zero value counts as "not assigned yet" when an entity
/// is created, and a fresh one is generated. Lookups take the ID as given, so
/// an integer `0` that is already stored stays addressable.
pub trait EntityId:
    Clone + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn is_zero(&self) -> bool;

    /// Default generator used when a repository has no configured one.
    fn generate() -> Option<Self> {
        None
    }
}

impl EntityId for String {
    fn is_zero(&self) -> bool {
        self.is_empty()
    }

    fn generate() -> Option<Self> {
        Some(uuid::Uuid::new_v4().to_string())
    }
}

impl EntityId for uuid::Uuid {
    fn is_zero(&self) -> bool {
        self.is_nil()
    }

    fn generate() -> Option<Self> {
        Some(uuid::Uuid::new_v4())
    }
}

macro_rules! int_entity_id {
    ($($ty:ty),* $(,)?) => {
        $(
            impl EntityId for $ty {
                fn is_zero(&self) -> bool {
                    *self == 0
                }

                /// Per-type counter starting at 1. It wraps back to 1 after
                /// the largest positive value, so zero is never produced.
                fn generate() -> Option<Self> {
                    static NEXT: AtomicU64 = AtomicU64::new(1);
                    let span = <$ty>::MAX as u64;
                    let n = NEXT.fetch_add(1, Ordering::Relaxed);
                    <$ty>::try_from((n - 1) % span + 1).ok()
                }
            }
        )*
    };
}

int_entity_id!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// Implemented by `#[derive(Entity)]`.
///
/// ```ignore
/// #[derive(Clone, Default, Serialize, Deserialize, Entity)]
/// struct Note {
///     #[entity(id)]
///     key: u64,
///     body: String,
/// }
/// ```
pub trait Entity {
    type Id: EntityId;

    /// Namespace override; `None` means the fully qualified type name.
    const NAMESPACE: Option<&'static str> = None;

    fn id(&self) -> &Self::Id;

    fn set_id(&mut self, id: Self::Id);
}

type Getter<E, ID> = dyn Fn(&E) -> ID + Send + Sync;
type Setter<E, ID> = dyn Fn(&mut E, ID) + Send + Sync;

/// Reads and writes the identity field of `E`.
pub struct IdAccessor<E, ID> {
    get: Arc<Getter<E, ID>>,
    set: Arc<Setter<E, ID>>,
}

impl<E, ID> Clone for IdAccessor<E, ID> {
    fn clone(&self) -> Self {
        Self {
            get: Arc::clone(&self.get),
            set: Arc::clone(&self.set),
        }
    }
}

impl<E, ID: EntityId> IdAccessor<E, ID> {
    /// Accessor from an explicit lookup/setter pair.
    pub fn new<G, S>(get: G, set: S) -> Self
    where
        G: Fn(&E) -> ID + Send + Sync + 'static,
        S: Fn(&mut E, ID) + Send + Sync + 'static,
    {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    pub fn get(&self, entity: &E) -> ID {
        (self.get)(entity)
    }

    pub fn set(&self, entity: &mut E, id: ID) {
        (self.set)(entity, id)
    }

    /// Whether the entity still carries a zero ID.
    pub fn is_absent(&self, entity: &E) -> bool {
        self.get(entity).is_zero()
    }
}

impl<E> IdAccessor<E, E::Id>
where
    E: Entity + 'static,
{
    /// Accessor driven by the `Entity` trait (usually derived).
    pub fn of() -> Self {
        Self::new(|e: &E| e.id().clone(), |e: &mut E, id| e.set_id(id))
    }
}

/// Custom ID generator configured on a repository.
pub type IdGenerator<ID> = Arc<dyn Fn(&Context) -> Result<ID> + Send + Sync>;
