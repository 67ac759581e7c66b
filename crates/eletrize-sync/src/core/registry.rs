//! Control Registry
//!
//! Remembers every on-screen control bound to a device, and every master
//! control bound to a group, so state changes can be fanned out without
//! walking the element tree each time.
//!
//! The registry never keeps an element alive: it stores [`Weak`] handles and
//! drops them once the element is gone or reports itself detached.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::models::{DeviceId, MasterKind};

use super::aggregate::aggregate_state;
use super::state_store::StateStore;

/// What an element is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Control for a single device
    Device(DeviceId),
    /// Aggregate control over a group
    Master { ids: Vec<DeviceId>, kind: MasterKind },
    /// Not a control
    None,
}

/// A node of the host's element tree.
///
/// Implemented by whatever renders the dashboard: a webview bridge, a
/// terminal UI or a test fake.
pub trait Element: Send + Sync {
    /// Whether the element is still part of the document.
    fn is_connected(&self) -> bool;

    fn binding(&self) -> Binding;

    /// State the element currently shows, if any.
    fn displayed_state(&self) -> Option<String>;

    /// Show `state` (icon swap, attribute change).
    fn render_state(&self, state: &str);

    /// Direct children, for subtree scans.
    fn children(&self) -> Vec<Arc<dyn Element>>;

    /// Show or hide a busy indicator. Only master controls receive this.
    fn set_pending(&self, _pending: bool) {}
}

/// Stable identity of an element for the lifetime of its allocation.
fn element_key(element: &Arc<dyn Element>) -> usize {
    Arc::as_ptr(element) as *const () as usize
}

struct MasterEntry {
    element: Weak<dyn Element>,
    ids: Vec<DeviceId>,
    kind: MasterKind,
    pending: bool,
}

#[derive(Default)]
struct Inner {
    controls: HashMap<DeviceId, HashMap<usize, Weak<dyn Element>>>,
    masters: HashMap<usize, MasterEntry>,
    primed: bool,
}

/// Live master control as seen by callers.
pub struct MasterHandle {
    pub element: Arc<dyn Element>,
    pub ids: Vec<DeviceId>,
    pub kind: MasterKind,
    pub pending: bool,
}

/// Comparable view of the registry's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub controls: BTreeMap<DeviceId, BTreeSet<usize>>,
    pub masters: BTreeMap<usize, Vec<DeviceId>>,
}

/// Device id to control multimap plus master controls.
#[derive(Default)]
pub struct ControlRegistry {
    inner: Mutex<Inner>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== Registration ====================

    /// Bind `element` to `id`. Returns `false` if it already was.
    pub fn register_control(&self, element: &Arc<dyn Element>, id: &DeviceId) -> bool {
        let key = element_key(element);
        let mut inner = self.lock();
        let set = inner.controls.entry(id.clone()).or_default();
        // A dead handle under the same key is a previous allocation at this address.
        if set.get(&key).is_some_and(|w| w.strong_count() > 0) {
            return false;
        }
        set.insert(key, Arc::downgrade(element));
        true
    }

    /// Remove the binding. Returns `false` if there was none.
    pub fn unregister_control(&self, element: &Arc<dyn Element>, id: &DeviceId) -> bool {
        let key = element_key(element);
        let mut inner = self.lock();
        let Some(set) = inner.controls.get_mut(id) else {
            return false;
        };
        let removed = set.remove(&key).is_some();
        if set.is_empty() {
            inner.controls.remove(id);
        }
        removed
    }

    /// Bind a master control to a group. Returns `false` if already registered.
    ///
    /// Re-registering a live master refreshes its group and keeps its
    /// pending flag.
    pub fn register_master(
        &self,
        element: &Arc<dyn Element>,
        ids: &[DeviceId],
        kind: MasterKind,
    ) -> bool {
        let key = element_key(element);
        let mut inner = self.lock();
        if let Some(existing) = inner
            .masters
            .get_mut(&key)
            .filter(|m| m.element.strong_count() > 0)
        {
            existing.ids = ids.to_vec();
            existing.kind = kind;
            return false;
        }
        inner.masters.insert(
            key,
            MasterEntry {
                element: Arc::downgrade(element),
                ids: ids.to_vec(),
                kind,
                pending: false,
            },
        );
        true
    }

    pub fn unregister_master(&self, element: &Arc<dyn Element>) -> bool {
        let key = element_key(element);
        self.lock().masters.remove(&key).is_some()
    }

    /// Register every bound element in the subtree rooted at `root`.
    /// Returns how many registrations were new.
    pub fn collect_from_node(&self, root: &Arc<dyn Element>) -> usize {
        let mut added = 0;
        walk(root, &mut |node| {
            added += match node.binding() {
                Binding::Device(id) => self.register_control(node, &id) as usize,
                Binding::Master { ids, kind } => self.register_master(node, &ids, kind) as usize,
                Binding::None => 0,
            };
        });
        added
    }

    /// Unregister every bound element in the subtree rooted at `root`.
    pub fn remove_from_node(&self, root: &Arc<dyn Element>) -> usize {
        let mut removed = 0;
        walk(root, &mut |node| {
            removed += match node.binding() {
                Binding::Device(id) => self.unregister_control(node, &id) as usize,
                Binding::Master { .. } => self.unregister_master(node) as usize,
                Binding::None => 0,
            };
        });
        removed
    }

    /// Rebuild the registry from a full scan of `root`.
    ///
    /// Without `force` an already primed registry is left as is. Masters
    /// found again keep their entry, so a rescan during a group command does
    /// not clear the pending flag; masters missing from the scan are dropped.
    pub fn prime(&self, root: &Arc<dyn Element>, force: bool) -> usize {
        {
            let mut inner = self.lock();
            if inner.primed && !force {
                return 0;
            }
            inner.controls.clear();
            inner.primed = true;
        }

        let mut count = 0;
        let mut seen_masters = HashSet::new();
        walk(root, &mut |node| match node.binding() {
            Binding::Device(id) => count += self.register_control(node, &id) as usize,
            Binding::Master { ids, kind } => {
                seen_masters.insert(element_key(node));
                self.register_master(node, &ids, kind);
                count += 1;
            }
            Binding::None => {}
        });
        self.lock()
            .masters
            .retain(|key, m| seen_masters.contains(key) && m.element.strong_count() > 0);

        tracing::debug!(registered = count, "Primed control registry");
        count
    }

    /// Drop handles whose element is gone or detached.
    pub fn prune_detached(&self) -> usize {
        let mut inner = self.lock();
        let mut pruned = 0;

        inner.controls.retain(|_, set| {
            let before = set.len();
            set.retain(|_, weak| weak.upgrade().is_some_and(|el| el.is_connected()));
            pruned += before - set.len();
            !set.is_empty()
        });

        let before = inner.masters.len();
        inner
            .masters
            .retain(|_, m| m.element.upgrade().is_some_and(|el| el.is_connected()));
        pruned += before - inner.masters.len();

        if pruned > 0 {
            tracing::debug!(pruned, "Pruned detached controls");
        }
        pruned
    }

    // ==================== Rendering ====================

    /// Live controls of `id`.
    pub fn controls_for(&self, id: &DeviceId) -> Vec<Arc<dyn Element>> {
        self.lock()
            .controls
            .get(id)
            .map(|set| set.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Render `state` on every control of `id` that shows something else,
    /// or on all of them with `force`. Returns the number of writes.
    pub fn apply_state(&self, id: &DeviceId, state: &str, force: bool) -> usize {
        let mut writes = 0;
        for control in self.controls_for(id) {
            if force || control.displayed_state().as_deref() != Some(state) {
                control.render_state(state);
                writes += 1;
            }
        }
        writes
    }

    /// Device ids with at least one registered control.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.lock().controls.keys().cloned().collect()
    }

    // ==================== Masters ====================

    pub fn masters(&self) -> Vec<MasterHandle> {
        self.lock()
            .masters
            .values()
            .filter_map(|m| {
                m.element.upgrade().map(|element| MasterHandle {
                    element,
                    ids: m.ids.clone(),
                    kind: m.kind,
                    pending: m.pending,
                })
            })
            .collect()
    }

    /// Mark a master as waiting on its group command.
    pub fn set_master_pending(&self, element: &Arc<dyn Element>, pending: bool) {
        let key = element_key(element);
        let changed = {
            let mut inner = self.lock();
            match inner.masters.get_mut(&key) {
                Some(m) if m.pending != pending => {
                    m.pending = pending;
                    true
                }
                _ => false,
            }
        };
        if changed {
            element.set_pending(pending);
        }
    }

    /// Set the pending flag unless it already is. Returns `false` if the
    /// master is busy. Unregistered elements are always claimable.
    pub fn claim_master(&self, element: &Arc<dyn Element>) -> bool {
        let key = element_key(element);
        {
            let mut inner = self.lock();
            match inner.masters.get_mut(&key) {
                Some(m) if m.pending => return false,
                Some(m) => m.pending = true,
                None => return true,
            }
        }
        element.set_pending(true);
        true
    }

    pub fn is_master_pending(&self, element: &Arc<dyn Element>) -> bool {
        let key = element_key(element);
        self.lock().masters.get(&key).is_some_and(|m| m.pending)
    }

    /// Recompute every master's aggregate and render the ones that changed.
    /// Pending masters are skipped unless `force`.
    pub fn refresh_masters(&self, store: &StateStore, force: bool) -> usize {
        let mut writes = 0;
        for master in self.masters() {
            if master.pending && !force {
                continue;
            }
            let target = aggregate_state(store, &master.ids, master.kind);
            if force || master.element.displayed_state().as_deref() != Some(target) {
                master.element.render_state(target);
                writes += 1;
            }
        }
        writes
    }

    /// Bring every control in line with the store.
    pub fn sync_all(&self, store: &StateStore, force: bool) -> usize {
        self.prune_detached();
        let mut writes = 0;
        for id in self.device_ids() {
            if let Some(state) = store.get(&id) {
                writes += self.apply_state(&id, &state, force);
            }
        }
        writes + self.refresh_masters(store, false)
    }

    // ==================== Introspection ====================

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();
        RegistrySnapshot {
            controls: inner
                .controls
                .iter()
                .map(|(id, set)| (id.clone(), set.keys().copied().collect()))
                .collect(),
            masters: inner
                .masters
                .iter()
                .map(|(key, m)| (*key, m.ids.clone()))
                .collect(),
        }
    }

    pub fn control_count(&self) -> usize {
        self.lock().controls.values().map(HashMap::len).sum()
    }

    pub fn master_count(&self) -> usize {
        self.lock().masters.len()
    }
}

fn walk(node: &Arc<dyn Element>, visit: &mut dyn FnMut(&Arc<dyn Element>)) {
    visit(node);
    for child in node.children() {
        walk(&child, visit);
    }
}
