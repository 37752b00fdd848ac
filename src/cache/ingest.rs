//! Write path
//!
//! New values are only added to items that are already cached; the cache never
//! admits an item on write. A value that cannot be applied drops the item, so the
//! next request rebuilds it from the store.

use super::item::{CacheItem, ItemState};
use super::registry::Registry;
use crate::error::CacheError;
use crate::types::ItemValue;
use tracing::debug;

/// Apply freshly written values to their cached items
pub(crate) fn add_values(reg: &mut Registry, values: &[ItemValue]) {
    let expire_before = reg.now() - reg.config.item_expire_period;

    for value in values {
        let itemid = value.itemid;
        if !reg.items.contains_key(&itemid) {
            continue;
        }

        reg.addref(itemid);
        let result = reg.with_item(itemid, |reg, item| add_value(reg, item, value, expire_before));

        if let Some(Err(e)) = result {
            debug!(itemid, error = %e, "dropping item from value cache");
            if let Some(item) = reg.items.get_mut(&itemid) {
                item.mark_remove_pending();
            }
        }

        reg.release_item(itemid);
    }
}

fn add_value(
    reg: &mut Registry,
    item: &mut CacheItem,
    value: &ItemValue,
    expire_before: i64,
) -> Result<(), CacheError> {
    if item.state == ItemState::RemovePending {
        return Ok(());
    }

    if item.value_type != value.value_type() {
        return Err(CacheError::TypeMismatch {
            itemid: item.itemid,
            cached: item.value_type,
            requested: value.value_type(),
        });
    }

    if item.last_accessed < expire_before {
        return Err(CacheError::Expired {
            itemid: item.itemid,
            last_accessed: item.last_accessed,
        });
    }

    let head = item.chunks.head();
    item.push_head(reg, &value.record)?;

    // a new head chunk may let the tail fall out of the active range
    if item.chunks.head() != head {
        item.mark_clean_pending();
    }
    Ok(())
}
