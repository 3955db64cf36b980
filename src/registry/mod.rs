//! Listener registry — the authoritative capability table.
//!
//! Maps registered name and payload root tag to listener records. Records
//! are immutable after registration; structural changes (hot-reload, OOB
//! add/remove) replace records wholesale while the pump holds the write
//! lock. Also owns the listener-scoped storage on behalf of every listener.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::handler::Handler;
use crate::schema::CompiledSchema;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("listener '{0}' already registered")]
    NameTaken(String),

    #[error("root tag '{tag}' already bound to agent '{holder}'")]
    RootTagTaken { tag: String, holder: String },

    #[error("listener '{0}' not found")]
    UnknownListener(String),
}

/// Tool or agent. Agents own their root tag exclusively so that emitting it
/// routes back to themselves; tools may share a root tag (broadcast group).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Tool,
    Agent,
}

/// A registered capability. Immutable after registration.
pub struct ListenerRecord {
    pub name: String,
    pub root_tag: String,
    pub description: String,
    pub kind: ListenerKind,
    /// Capabilities this listener may emit to (closed set).
    pub peers: HashSet<String>,
    pub schema: Arc<CompiledSchema>,
    pub handler: Arc<dyn Handler>,
}

impl ListenerRecord {
    pub fn is_agent(&self) -> bool {
        self.kind == ListenerKind::Agent
    }
}

impl std::fmt::Debug for ListenerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRecord")
            .field("name", &self.name)
            .field("root_tag", &self.root_tag)
            .field("kind", &self.kind)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

/// Name → record and root tag → broadcast list, plus scoped storage.
#[derive(Default)]
pub struct ListenerRegistry {
    by_name: HashMap<String, Arc<ListenerRecord>>,
    /// Registration order is preserved per root tag; broadcast fan-out
    /// starts handlers in this order.
    by_root: HashMap<String, Vec<Arc<ListenerRecord>>>,
    storage: ListenerStorage,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Fails on a name collision, or when an agent's
    /// root tag is already bound to anyone (or anyone's to an agent).
    pub fn register(&mut self, record: ListenerRecord) -> Result<Arc<ListenerRecord>, RegistryError> {
        if self.by_name.contains_key(&record.name) {
            return Err(RegistryError::NameTaken(record.name));
        }
        if let Some(bound) = self.by_root.get(&record.root_tag) {
            let agent_holds = bound.iter().find(|r| r.is_agent());
            if let Some(holder) = agent_holds {
                return Err(RegistryError::RootTagTaken {
                    tag: record.root_tag,
                    holder: holder.name.clone(),
                });
            }
            if record.is_agent() {
                return Err(RegistryError::RootTagTaken {
                    tag: record.root_tag,
                    holder: bound[0].name.clone(),
                });
            }
        }

        let record = Arc::new(record);
        self.by_name.insert(record.name.clone(), record.clone());
        self.by_root
            .entry(record.root_tag.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    /// Remove a listener by name.
    pub fn unregister(&mut self, name: &str) -> Result<Arc<ListenerRecord>, RegistryError> {
        let record = self
            .by_name
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownListener(name.to_string()))?;
        if let Some(bound) = self.by_root.get_mut(&record.root_tag) {
            bound.retain(|r| r.name != name);
            if bound.is_empty() {
                self.by_root.remove(&record.root_tag);
            }
        }
        self.storage.clear_listener(name);
        Ok(record)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<ListenerRecord>> {
        self.by_name.get(name).cloned()
    }

    /// All listeners bound to a root tag, in registration order.
    pub fn lookup_by_root(&self, root_tag: &str) -> Vec<Arc<ListenerRecord>> {
        self.by_root.get(root_tag).cloned().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All registered names, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn records(&self) -> impl Iterator<Item = &Arc<ListenerRecord>> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// The shared storage pool (pump-side handle).
    pub fn storage(&self) -> ListenerStorage {
        self.storage.clone()
    }

    /// A storage view scoped to one listener. Handed out at registration;
    /// handlers can only reach their own slots through it.
    pub fn scoped_storage(&self, listener: &str) -> ScopedStorage {
        self.storage.scoped(listener)
    }
}

// ── Listener-scoped storage ──

/// Keyed store owned by the registry on behalf of each listener:
/// (listener, thread) → value. Cleared per thread when the path registry
/// prunes the thread.
#[derive(Clone, Default)]
pub struct ListenerStorage {
    inner: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

impl ListenerStorage {
    pub fn scoped(&self, listener: &str) -> ScopedStorage {
        ScopedStorage {
            listener: listener.to_string(),
            inner: self.inner.clone(),
        }
    }

    /// Drop every listener's slot for a thread.
    pub fn clear_thread(&self, thread_id: &str) {
        let mut map = self.inner.lock().expect("storage lock");
        for slots in map.values_mut() {
            slots.remove(thread_id);
        }
    }

    /// Drop all slots for a listener (deregistration).
    pub fn clear_listener(&self, listener: &str) {
        self.inner.lock().expect("storage lock").remove(listener);
    }

    pub fn thread_entry_count(&self, thread_id: &str) -> usize {
        self.inner
            .lock()
            .expect("storage lock")
            .values()
            .filter(|slots| slots.contains_key(thread_id))
            .count()
    }
}

/// A single listener's view of the storage pool.
#[derive(Clone)]
pub struct ScopedStorage {
    listener: String,
    inner: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

impl ScopedStorage {
    pub fn get(&self, thread_id: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("storage lock")
            .get(&self.listener)
            .and_then(|slots| slots.get(thread_id).cloned())
    }

    pub fn put(&self, thread_id: &str, value: String) {
        self.inner
            .lock()
            .expect("storage lock")
            .entry(self.listener.clone())
            .or_default()
            .insert(thread_id.to_string(), value);
    }

    pub fn remove(&self, thread_id: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("storage lock")
            .get_mut(&self.listener)
            .and_then(|slots| slots.remove(thread_id))
    }
}
