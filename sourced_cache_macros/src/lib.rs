mod entity;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(Entity)]
// ============================================================================

/// Derive macro that implements `sourced_cache::Entity` for a struct.
///
/// Marks the identity field so repositories and the cache manager can read
/// and assign IDs without a hand-written accessor.
///
/// # Usage
///
/// ```ignore
/// use sourced_cache::Entity;
///
/// #[derive(Clone, Default, Serialize, Deserialize, Entity)]
/// #[entity(namespace = "todos")]
/// struct Todo {
///     #[entity(id)]
///     pub key: String,
///     pub title: String,
/// }
/// ```
///
/// Attributes:
/// - `#[entity(id)]` on a field: the identity field. Defaults to a field named `id`.
/// - `#[entity(namespace = "...")]` on the struct: overrides the event log namespace,
///   which otherwise is the fully qualified type name.
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    entity::derive_entity(input)
}
