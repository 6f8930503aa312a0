//! Change detection between two snapshots of the collection.
//!
//! Only creation and field-level updates are observable. An item missing from
//! the new snapshot (deleted or filtered out) produces nothing.

use std::collections::{HashMap, HashSet};

use crate::collection::{Item, ItemId};

/// Items of `new_items` whose id does not appear in `old_items`, in `new_items` order.
pub fn diff_created(new_items: &[Item], old_items: &[Item]) -> Vec<Item> {
  let known: HashSet<&ItemId> = old_items.iter().map(|item| &item.id).collect();

  new_items
    .iter()
    .filter(|item| !known.contains(&item.id))
    .cloned()
    .collect()
}

/// Items present in both snapshots where at least one watched field changed value.
///
/// Fields outside `watched_fields` are ignored. A watched field that appears
/// or disappears counts as a change.
pub fn diff_updated<S: AsRef<str>>(
  new_items: &[Item],
  old_items: &[Item],
  watched_fields: &[S],
) -> Vec<Item> {
  let previous: HashMap<&ItemId, &Item> = old_items.iter().map(|item| (&item.id, item)).collect();

  new_items
    .iter()
    .filter(|item| {
      previous.get(&item.id).is_some_and(|old| {
        watched_fields
          .iter()
          .any(|field| item.field(field.as_ref()) != old.field(field.as_ref()))
      })
    })
    .cloned()
    .collect()
}
