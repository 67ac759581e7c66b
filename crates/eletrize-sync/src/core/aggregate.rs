//! Group state derived from individual devices.
//!
//! Always recomputed from the store; nothing here is cached.

use crate::models::{state, DeviceId, MasterKind};

use super::state_store::StateStore;

/// True if any of `ids` is stored as `"on"`. False for an empty set.
pub fn any_on(store: &StateStore, ids: &[DeviceId]) -> bool {
    ids.iter()
        .any(|id| store.get(id).as_deref() == Some(state::ON))
}

/// True if any curtain in `ids` is stored as `"open"`. False for an empty set.
pub fn any_open(store: &StateStore, ids: &[DeviceId]) -> bool {
    ids.iter().any(|id| store.get_curtain(id) == state::OPEN)
}

/// State token a master control of `kind` should display.
pub fn aggregate_state(store: &StateStore, ids: &[DeviceId], kind: MasterKind) -> &'static str {
    match kind {
        MasterKind::Lights if any_on(store, ids) => state::ON,
        MasterKind::Lights => state::OFF,
        MasterKind::Curtains if any_open(store, ids) => state::OPEN,
        MasterKind::Curtains => state::CLOSED,
    }
}
