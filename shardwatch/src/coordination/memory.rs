//! In-process coordination service.
//!
//! [`InMemoryCoordination`] keeps a node tree in a shared `RefCell` and hands
//! out [`InMemorySession`] handles through its [`Connector`] impl. It follows
//! the semantics the availability client relies on:
//!
//! - watches are one-shot and owned by the session that armed them
//! - closing a session cancels its watches and deletes its ephemeral nodes
//! - creating or deleting a node fires the parent's children watches
//!
//! The admin methods (`write`, `remove`, `disconnect_all`, ...) act as the
//! rest of the cluster: other writers and the service itself.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{
    Acl, CoordinationClient, Connector, CreateMode, SessionEvent, SessionEvents, Watch,
    WatchEvent, WatchEventKind,
};
use crate::error::{CoordinationError, CoordinationResult};

type SessionId = u64;
type WatchList = Vec<(SessionId, oneshot::Sender<WatchEvent>)>;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Pending,
    Connected,
    Disconnected,
}

#[derive(Debug)]
struct SessionSlot {
    phase: SessionPhase,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, WatchList>,
    child_watches: HashMap<String, WatchList>,
    sessions: BTreeMap<SessionId, SessionSlot>,
    next_session: SessionId,
    manual_connect: bool,
    connects: usize,
    connect_strings: Vec<String>,
    auth: Vec<(String, Vec<u8>)>,
    /// One-shot read failures, by path.
    read_failures: HashMap<String, CoordinationError>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                ephemeral_owner: None,
            },
        );
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            sessions: BTreeMap::new(),
            next_session: 1,
            manual_connect: false,
            connects: 0,
            connect_strings: Vec::new(),
            auth: Vec::new(),
            read_failures: HashMap::new(),
        }
    }

    fn check_session(&self, id: SessionId) -> CoordinationResult<()> {
        match self.sessions.get(&id) {
            None => Err(CoordinationError::Closed),
            Some(slot) if slot.phase == SessionPhase::Connected => Ok(()),
            Some(_) => Err(CoordinationError::ConnectionLoss),
        }
    }

    fn take_read_failure(&mut self, path: &str) -> CoordinationResult<()> {
        match self.read_failures.remove(path) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        if !self.nodes.contains_key(path) {
            return Err(no_node(path));
        }
        Ok(self
            .nodes
            .keys()
            .filter(|key| key.as_str() != "/" && parent_of(key) == path)
            .map(|key| name_of(key).to_string())
            .collect())
    }

    fn data(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| no_node(path))
    }

    fn create_node(
        &mut self,
        path: &str,
        data: &[u8],
        owner: Option<SessionId>,
    ) -> CoordinationResult<()> {
        if self.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists {
                path: path.to_string(),
            });
        }
        let parent = parent_of(path).to_string();
        if !self.nodes.contains_key(&parent) {
            return Err(no_node(&parent));
        }
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                ephemeral_owner: owner,
            },
        );
        self.fire(WatchEventKind::ChildrenChanged, &parent);
        Ok(())
    }

    fn mkdirp(&mut self, path: &str, owner: Option<SessionId>) -> CoordinationResult<()> {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            prefix.push('/');
            prefix.push_str(segment);
            if self.nodes.contains_key(&prefix) {
                continue;
            }
            let node_owner = if i + 1 == segments.len() { owner } else { None };
            self.create_node(&prefix, &[], node_owner)?;
        }
        Ok(())
    }

    fn set_node(&mut self, path: &str, data: &[u8]) -> CoordinationResult<()> {
        let node = self.nodes.get_mut(path).ok_or_else(|| no_node(path))?;
        node.data = data.to_vec();
        self.fire(WatchEventKind::DataChanged, path);
        Ok(())
    }

    fn delete_node(&mut self, path: &str) -> CoordinationResult<()> {
        if path == "/" || !self.nodes.contains_key(path) {
            return Err(no_node(path));
        }
        // Children go first, deepest paths first
        let descendants: Vec<String> = self
            .nodes
            .keys()
            .filter(|key| key.starts_with(path) && key.as_bytes().get(path.len()) == Some(&b'/'))
            .cloned()
            .collect();
        for descendant in descendants.into_iter().rev() {
            self.delete_leaf(&descendant);
        }
        self.delete_leaf(path);
        Ok(())
    }

    fn delete_leaf(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.fire(WatchEventKind::Deleted, path);
        self.fire(WatchEventKind::ChildrenChanged, parent_of(path));
    }

    /// Fire and consume the watches a change of `kind` on `path` triggers.
    fn fire(&mut self, kind: WatchEventKind, path: &str) {
        let mut triggered = Vec::new();
        match kind {
            WatchEventKind::DataChanged => {
                triggered.extend(self.data_watches.remove(path).unwrap_or_default());
            }
            WatchEventKind::ChildrenChanged => {
                triggered.extend(self.child_watches.remove(path).unwrap_or_default());
            }
            WatchEventKind::Deleted => {
                triggered.extend(self.data_watches.remove(path).unwrap_or_default());
                triggered.extend(self.child_watches.remove(path).unwrap_or_default());
            }
        }
        for (_, sender) in triggered {
            let _ = sender.send(WatchEvent::new(kind, path));
        }
    }

    fn arm(watches: &mut HashMap<String, WatchList>, path: &str, session: SessionId) -> Watch {
        let (tx, rx) = oneshot::channel();
        watches
            .entry(path.to_string())
            .or_default()
            .push((session, tx));
        rx
    }

    fn end_session(&mut self, id: SessionId) {
        if self.sessions.remove(&id).is_none() {
            return;
        }
        for watches in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            watches.retain(|(owner, _)| *owner != id);
        }
        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            let _ = self.delete_node(&path);
        }
    }

    fn notify_sessions(&mut self, from: &[SessionPhase], to: SessionPhase, event: SessionEvent) {
        for slot in self.sessions.values_mut() {
            if from.contains(&slot.phase) {
                slot.phase = to;
                let _ = slot.events.send(event);
            }
        }
    }
}

fn no_node(path: &str) -> CoordinationError {
    CoordinationError::NoNode {
        path: path.to_string(),
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Shared in-memory coordination service.
///
/// Cloning yields another handle to the same tree.
///
/// # Example
///
/// ```rust,ignore
/// let coordination = InMemoryCoordination::new();
/// coordination.write("/shardwatch/groups/cache-1", br#"{"master":"m"}"#);
/// let client = AvailabilityClient::new(coordination.clone(), config)?;
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryCoordination {
    tree: Rc<RefCell<Tree>>,
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordination {
    /// Create an empty tree containing only `/`.
    pub fn new() -> Self {
        Self {
            tree: Rc::new(RefCell::new(Tree::new())),
        }
    }

    /// When enabled, new sessions stay pending until [`connect_pending`](Self::connect_pending).
    pub fn set_manual_connect(&self, manual: bool) {
        self.tree.borrow_mut().manual_connect = manual;
    }

    /// Deliver "connected" to every pending session.
    pub fn connect_pending(&self) {
        self.tree.borrow_mut().notify_sessions(
            &[SessionPhase::Pending],
            SessionPhase::Connected,
            SessionEvent::Connected,
        );
    }

    /// Drop the connection of every connected session.
    pub fn disconnect_all(&self) {
        self.tree.borrow_mut().notify_sessions(
            &[SessionPhase::Connected],
            SessionPhase::Disconnected,
            SessionEvent::Disconnected,
        );
    }

    /// Restore the connection of every disconnected session.
    pub fn reconnect_all(&self) {
        self.tree.borrow_mut().notify_sessions(
            &[SessionPhase::Disconnected],
            SessionPhase::Connected,
            SessionEvent::Connected,
        );
    }

    /// Expire every live session. Their watches and ephemeral nodes go away.
    pub fn expire_all(&self) {
        let mut tree = self.tree.borrow_mut();
        let ids: Vec<SessionId> = tree.sessions.keys().copied().collect();
        for id in ids {
            if let Some(slot) = tree.sessions.get(&id) {
                let _ = slot.events.send(SessionEvent::Expired);
            }
            tree.end_session(id);
        }
    }

    /// Report an authentication failure to every live session.
    pub fn fail_auth_all(&self) {
        let tree = self.tree.borrow();
        for slot in tree.sessions.values() {
            let _ = slot.events.send(SessionEvent::AuthenticationFailed);
        }
    }

    /// Make the next read of `path` (data or children, watched or not) fail
    /// with `error`. Later reads succeed again.
    pub fn fail_next_read(&self, path: &str, error: CoordinationError) {
        self.tree
            .borrow_mut()
            .read_failures
            .insert(path.to_string(), error);
    }

    /// Create or overwrite `path`, creating missing ancestors.
    pub fn write(&self, path: &str, data: impl AsRef<[u8]>) {
        let mut tree = self.tree.borrow_mut();
        if tree.nodes.contains_key(path) {
            let _ = tree.set_node(path, data.as_ref());
            return;
        }
        let parent = parent_of(path).to_string();
        if tree.mkdirp(&parent, None).is_ok() {
            let _ = tree.create_node(path, data.as_ref(), None);
        }
    }

    /// Read the data stored at `path`.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.borrow().data(path).ok()
    }

    /// Child names of `path`, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.tree.borrow().children(path).unwrap_or_default()
    }

    /// Delete `path` and everything below it. Returns `false` if it did not exist.
    pub fn remove(&self, path: &str) -> bool {
        self.tree.borrow_mut().delete_node(path).is_ok()
    }

    /// Number of sessions handed out so far.
    pub fn connect_count(&self) -> usize {
        self.tree.borrow().connects
    }

    /// Connection strings passed to [`Connector::connect`], in order.
    pub fn connect_strings(&self) -> Vec<String> {
        self.tree.borrow().connect_strings.clone()
    }

    /// Number of sessions that have not been closed or expired.
    pub fn live_sessions(&self) -> usize {
        self.tree.borrow().sessions.len()
    }

    /// Credentials added through [`CoordinationClient::add_auth`].
    pub fn auth_log(&self) -> Vec<(String, Vec<u8>)> {
        self.tree.borrow().auth.clone()
    }

    /// Number of armed data watches on `path` whose receiver is still alive.
    pub fn data_watch_count(&self, path: &str) -> usize {
        count_live(self.tree.borrow().data_watches.get(path))
    }

    /// Number of armed children watches on `path` whose receiver is still alive.
    pub fn child_watch_count(&self, path: &str) -> usize {
        count_live(self.tree.borrow().child_watches.get(path))
    }
}

fn count_live(watches: Option<&WatchList>) -> usize {
    watches.map_or(0, |list| {
        list.iter().filter(|(_, sender)| !sender.is_closed()).count()
    })
}

impl Connector for InMemoryCoordination {
    type Client = InMemorySession;

    fn connect(&self, connect_string: &str) -> CoordinationResult<(InMemorySession, SessionEvents)> {
        let mut tree = self.tree.borrow_mut();
        let id = tree.next_session;
        tree.next_session += 1;
        tree.connects += 1;
        tree.connect_strings.push(connect_string.to_string());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let phase = if tree.manual_connect {
            SessionPhase::Pending
        } else {
            let _ = events_tx.send(SessionEvent::Connected);
            SessionPhase::Connected
        };
        tree.sessions.insert(
            id,
            SessionSlot {
                phase,
                events: events_tx,
            },
        );

        Ok((
            InMemorySession {
                id,
                tree: Rc::clone(&self.tree),
            },
            events_rx,
        ))
    }
}

/// Session handle into an [`InMemoryCoordination`] tree.
#[derive(Debug)]
pub struct InMemorySession {
    id: SessionId,
    tree: Rc<RefCell<Tree>>,
}

#[async_trait(?Send)]
impl CoordinationClient for InMemorySession {
    async fn add_auth(&self, scheme: &str, credentials: &[u8]) -> CoordinationResult<()> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        tree.auth.push((scheme.to_string(), credentials.to_vec()));
        Ok(())
    }

    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        tree.take_read_failure(path)?;
        tree.children(path)
    }

    async fn watch_children(&self, path: &str) -> CoordinationResult<(Vec<String>, Watch)> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        tree.take_read_failure(path)?;
        let children = tree.children(path)?;
        let watch = Tree::arm(&mut tree.child_watches, path, self.id);
        Ok((children, watch))
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        tree.take_read_failure(path)?;
        tree.data(path)
    }

    async fn watch_data(&self, path: &str) -> CoordinationResult<(Vec<u8>, Watch)> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        tree.take_read_failure(path)?;
        let data = tree.data(path)?;
        let watch = Tree::arm(&mut tree.data_watches, path, self.id);
        Ok((data, watch))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<()> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        tree.set_node(path, data)
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        _acl: Acl,
        mode: CreateMode,
    ) -> CoordinationResult<()> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        let owner = (mode == CreateMode::Ephemeral).then_some(self.id);
        tree.create_node(path, data, owner)
    }

    async fn mkdirp(&self, path: &str, _acl: Acl, mode: CreateMode) -> CoordinationResult<()> {
        let mut tree = self.tree.borrow_mut();
        tree.check_session(self.id)?;
        let owner = (mode == CreateMode::Ephemeral).then_some(self.id);
        tree.mkdirp(path, owner)
    }

    fn close(&self) {
        self.tree.borrow_mut().end_session(self.id);
    }
}
