//! Path registry — opaque thread identifiers and their private paths.
//!
//! The wire only ever carries opaque identifiers. Privately, every thread
//! has a hierarchical path (`sess-ab12cd34.researcher.calculator.add`) that
//! grows by one segment per delegation and shrinks by one per response.
//! The registry also owns each thread's conversation history (the agent
//! memory) and its lifecycle state; both die with the thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("thread '{0}' not found")]
    UnknownThread(String),
}

/// Egress channel back to the external client that opened the root.
pub type ClientHandle = mpsc::UnboundedSender<Vec<u8>>;

/// open → draining → terminal; driven by the pump, invisible to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Open,
    Draining,
    Terminal,
}

pub struct ThreadEntry {
    pub id: String,
    path: String,
    parent: Option<String>,
    /// Listener name this entry was extended with; `None` on roots.
    listener: Option<String>,
    pub state: ThreadState,
    client: Option<ClientHandle>,
    /// Messages queued in pipelines for this thread.
    pub queued: usize,
    /// Dispatches currently running for this thread.
    pub in_flight: usize,
    /// Live child thread count.
    children: usize,
    /// Per-segment sibling counters for disambiguation.
    sibling_names: HashMap<String, u32>,
    /// Append-only envelope log; the agent prompt assembly reads this.
    history: Vec<Vec<u8>>,
    pub last_activity: Instant,
}

#[derive(Default)]
pub struct PathRegistry {
    by_id: HashMap<String, ThreadEntry>,
    by_path: HashMap<String, String>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        id: String,
        path: String,
        parent: Option<String>,
        listener: Option<String>,
        client: Option<ClientHandle>,
    ) {
        self.by_path.insert(path.clone(), id.clone());
        self.by_id.insert(
            id.clone(),
            ThreadEntry {
                id,
                path,
                parent,
                listener,
                state: ThreadState::Open,
                client,
                queued: 0,
                in_flight: 0,
                children: 0,
                sibling_names: HashMap::new(),
                history: Vec::new(),
                last_activity: Instant::now(),
            },
        );
    }

    /// Create a fresh root thread, optionally tied to a client connection.
    pub fn new_root(&mut self, client: Option<ClientHandle>) -> String {
        let id = format!("sess-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.insert(id.clone(), id.clone(), None, None, client);
        id
    }

    /// Accept an externally minted identifier as a root (client ingress,
    /// gateway crossing). Idempotent for known identifiers.
    pub fn adopt_root(&mut self, id: &str, client: Option<ClientHandle>) {
        if self.by_id.contains_key(id) {
            return;
        }
        self.insert(id.to_string(), id.to_string(), None, None, client);
    }

    /// Append one segment under a parent. Sibling name collisions get a
    /// numeric disambiguator suffix.
    pub fn extend(&mut self, parent_id: &str, child_name: &str) -> Result<String, PathError> {
        let parent = self
            .by_id
            .get_mut(parent_id)
            .ok_or_else(|| PathError::UnknownThread(parent_id.to_string()))?;

        let seen = parent.sibling_names.entry(child_name.to_string()).or_insert(0);
        *seen += 1;
        let segment = if *seen == 1 {
            child_name.to_string()
        } else {
            format!("{child_name}-{seen}")
        };
        let path = format!("{}.{segment}", parent.path);
        parent.children += 1;
        parent.last_activity = Instant::now();

        let id = format!("dlg-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.insert(
            id.clone(),
            path,
            Some(parent_id.to_string()),
            Some(child_name.to_string()),
            None,
        );
        Ok(id)
    }

    /// The listener name an entry was extended with (`None` for roots).
    pub fn listener_of(&self, id: &str) -> Option<&str> {
        self.by_id.get(id)?.listener.as_deref()
    }

    /// Truncate one segment: remove the entry and return its parent id
    /// (`None` when the id was a root).
    pub fn prune(&mut self, id: &str) -> Option<String> {
        let entry = self.by_id.remove(id)?;
        self.by_path.remove(&entry.path);
        if let Some(ref parent_id) = entry.parent {
            if let Some(parent) = self.by_id.get_mut(parent_id) {
                parent.children = parent.children.saturating_sub(1);
                parent.last_activity = Instant::now();
            }
        }
        entry.parent
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.by_id.get(id)?.parent.as_deref()
    }

    /// Private path — admin/forensic use only, never the wire.
    pub fn path_of(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(|e| e.path.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ThreadEntry> {
        self.by_id.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<ThreadState> {
        self.by_id.get(id).map(|e| e.state)
    }

    pub fn set_state(&mut self, id: &str, state: ThreadState) {
        if let Some(entry) = self.by_id.get_mut(id) {
            entry.state = state;
        }
    }

    /// Egress handle for a thread: its own, or the nearest ancestor's.
    pub fn client_of(&self, id: &str) -> Option<ClientHandle> {
        let mut cursor = self.by_id.get(id)?;
        loop {
            if let Some(ref client) = cursor.client {
                return Some(client.clone());
            }
            cursor = self.by_id.get(cursor.parent.as_deref()?)?;
        }
    }

    // ── Work accounting (pump-only) ──

    pub fn inc_queued(&mut self, id: &str) {
        if let Some(e) = self.by_id.get_mut(id) {
            e.queued += 1;
            e.last_activity = Instant::now();
        }
    }

    pub fn dec_queued(&mut self, id: &str) {
        if let Some(e) = self.by_id.get_mut(id) {
            e.queued = e.queued.saturating_sub(1);
        }
    }

    pub fn inc_in_flight(&mut self, id: &str) {
        if let Some(e) = self.by_id.get_mut(id) {
            e.in_flight += 1;
            e.last_activity = Instant::now();
        }
    }

    pub fn dec_in_flight(&mut self, id: &str) {
        if let Some(e) = self.by_id.get_mut(id) {
            e.in_flight = e.in_flight.saturating_sub(1);
            e.last_activity = Instant::now();
        }
    }

    /// A thread with no queued work, no in-flight dispatches, no live
    /// children and no parent has nothing left to produce.
    pub fn is_quiescent(&self, id: &str) -> bool {
        self.by_id
            .get(id)
            .map(|e| e.queued == 0 && e.in_flight == 0 && e.children == 0)
            .unwrap_or(false)
    }

    // ── Conversation history ──

    pub fn append_history(&mut self, id: &str, envelope_bytes: Vec<u8>) {
        if let Some(e) = self.by_id.get_mut(id) {
            e.history.push(envelope_bytes);
            e.last_activity = Instant::now();
        }
    }

    pub fn history(&self, id: &str) -> Vec<Vec<u8>> {
        self.by_id
            .get(id)
            .map(|e| e.history.clone())
            .unwrap_or_default()
    }

    // ── Sweeps ──

    /// Root threads idle past the threshold.
    pub fn idle_roots(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        self.by_id
            .values()
            .filter(|e| e.parent.is_none() && now.duration_since(e.last_activity) > threshold)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Remove a thread and every descendant. Returns all removed ids.
    pub fn remove_subtree(&mut self, id: &str) -> Vec<String> {
        let Some(prefix) = self.path_of(id).map(|p| p.to_string()) else {
            return Vec::new();
        };
        let doomed: Vec<String> = self
            .by_id
            .values()
            .filter(|e| e.path == prefix || e.path.starts_with(&format!("{prefix}.")))
            .map(|e| e.id.clone())
            .collect();
        for id in &doomed {
            if let Some(entry) = self.by_id.remove(id) {
                self.by_path.remove(&entry.path);
                if let Some(ref parent_id) = entry.parent {
                    if let Some(parent) = self.by_id.get_mut(parent_id) {
                        parent.children = parent.children.saturating_sub(1);
                    }
                }
            }
        }
        doomed
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_extend() {
        let mut reg = PathRegistry::new();
        let root = reg.new_root(None);
        assert!(root.starts_with("sess-"));
        assert_eq!(reg.path_of(&root), Some(root.as_str()));

        let t1 = reg.extend(&root, "researcher").unwrap();
        assert_eq!(reg.path_of(&t1), Some(format!("{root}.researcher").as_str()));
        assert_eq!(reg.parent_of(&t1), Some(root.as_str()));
        assert_eq!(reg.listener_of(&t1), Some("researcher"));
        assert_eq!(reg.listener_of(&root), None);

        let t2 = reg.extend(&t1, "calculator.add").unwrap();
        assert_eq!(
            reg.path_of(&t2),
            Some(format!("{root}.researcher.calculator.add").as_str())
        );
    }

    #[test]
    fn prune_returns_parent() {
        let mut reg = PathRegistry::new();
        let root = reg.new_root(None);
        let t1 = reg.extend(&root, "researcher").unwrap();
        let t2 = reg.extend(&t1, "search").unwrap();

        assert_eq!(reg.prune(&t2), Some(t1.clone()));
        assert!(!reg.contains(&t2));
        assert_eq!(reg.prune(&t1), Some(root.clone()));
        assert_eq!(reg.prune(&root), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn sibling_collision_disambiguated() {
        let mut reg = PathRegistry::new();
        let root = reg.new_root(None);
        let a = reg.extend(&root, "search").unwrap();
        let b = reg.extend(&root, "search").unwrap();

        assert_eq!(reg.path_of(&a), Some(format!("{root}.search").as_str()));
        assert_eq!(reg.path_of(&b), Some(format!("{root}.search-2").as_str()));
    }

    #[test]
    fn adopt_root_is_idempotent() {
        let mut reg = PathRegistry::new();
        reg.adopt_root("client-uuid-1", None);
        reg.adopt_root("client-uuid-1", None);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.path_of("client-uuid-1"), Some("client-uuid-1"));
    }

    #[test]
    fn client_handle_found_via_ancestors() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reg = PathRegistry::new();
        let root = reg.new_root(Some(tx));
        let t1 = reg.extend(&root, "researcher").unwrap();
        let t2 = reg.extend(&t1, "search").unwrap();

        let handle = reg.client_of(&t2).unwrap();
        handle.send(b"hello".to_vec()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"hello");
    }

    #[test]
    fn quiescence_accounting() {
        let mut reg = PathRegistry::new();
        let root = reg.new_root(None);
        assert!(reg.is_quiescent(&root));

        reg.inc_queued(&root);
        assert!(!reg.is_quiescent(&root));
        reg.dec_queued(&root);
        reg.inc_in_flight(&root);
        assert!(!reg.is_quiescent(&root));
        reg.dec_in_flight(&root);
        assert!(reg.is_quiescent(&root));

        let child = reg.extend(&root, "a").unwrap();
        assert!(!reg.is_quiescent(&root));
        reg.prune(&child);
        assert!(reg.is_quiescent(&root));
    }

    #[test]
    fn history_lives_and_dies_with_thread() {
        let mut reg = PathRegistry::new();
        let root = reg.new_root(None);
        reg.append_history(&root, b"<message/>".to_vec());
        reg.append_history(&root, b"<message2/>".to_vec());
        assert_eq!(reg.history(&root).len(), 2);

        reg.prune(&root);
        assert!(reg.history(&root).is_empty());
    }

    #[test]
    fn remove_subtree_takes_descendants() {
        let mut reg = PathRegistry::new();
        let root = reg.new_root(None);
        let t1 = reg.extend(&root, "a").unwrap();
        let t2 = reg.extend(&t1, "b").unwrap();
        let other = reg.new_root(None);

        let removed = reg.remove_subtree(&t1);
        assert_eq!(removed.len(), 2);
        assert!(!reg.contains(&t1));
        assert!(!reg.contains(&t2));
        assert!(reg.contains(&root));
        assert!(reg.contains(&other));
        assert!(reg.is_quiescent(&root));
    }

    #[test]
    fn idle_roots_reported() {
        let mut reg = PathRegistry::new();
        let root = reg.new_root(None);
        assert!(reg.idle_roots(Duration::from_secs(3600)).is_empty());
        assert_eq!(reg.idle_roots(Duration::ZERO), vec![root]);
    }
}
