use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::event::{Change, Event};
use crate::id::{EntityId, IdAccessor};

/// Fold the events of `namespace` into the current `ID -> entity` view.
///
/// Create and Update set the entry, DeleteById removes it, DeleteAll clears
/// the view. Events of other namespaces are skipped.
pub fn project<E, ID>(
    events: &[Event],
    namespace: &str,
    ids: &IdAccessor<E, ID>,
) -> Result<HashMap<ID, E>>
where
    E: DeserializeOwned,
    ID: EntityId,
{
    let mut view = HashMap::new();
    for event in events.iter().filter(|e| e.belongs_to(namespace)) {
        match &event.change {
            Change::Create(value) | Change::Update(value) => {
                let entity: E = serde_json::from_value(value.clone())?;
                view.insert(ids.get(&entity), entity);
            }
            Change::DeleteById(value) => {
                let shell: E = serde_json::from_value(value.clone())?;
                view.remove(&ids.get(&shell));
            }
            Change::DeleteAll => view.clear(),
        }
    }
    Ok(view)
}
