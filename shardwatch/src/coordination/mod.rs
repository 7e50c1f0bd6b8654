//! Coordination service abstraction.
//!
//! The availability client never talks to a coordination service directly.
//! It consumes two traits:
//!
//! - [`Connector`] creates a fresh [`CoordinationClient`] handle plus its
//!   stream of [`SessionEvent`]s. A new handle is requested for every connect
//!   attempt and the previous one is closed and dropped.
//! - [`CoordinationClient`] exposes the primitives the client needs: listing
//!   children, reading and writing node data, creating nodes, and one-shot
//!   watches.
//!
//! Watches are one-shot: a [`Watch`] resolves at most once. Observing a path
//! continuously means re-arming the watch after every notification. A watch
//! whose sender is dropped (session closed) resolves to an error and must be
//! treated as cancelled.
//!
//! [`InMemoryCoordination`] is a complete in-process implementation used by the
//! tests and by embedders that want to run without a real service.

mod memory;

pub use memory::{InMemoryCoordination, InMemorySession};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::CoordinationResult;

/// A one-shot watch registration.
pub type Watch = oneshot::Receiver<WatchEvent>;

/// Stream of lifecycle events for one session.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Kind of change that fired a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// The watched node's data was overwritten.
    DataChanged,
    /// The watched node was deleted.
    Deleted,
    /// A child was added to or removed from the watched node.
    ChildrenChanged,
}

/// Notification delivered when a watch fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What changed.
    pub kind: WatchEventKind,
    /// Path the watch was registered on.
    pub path: String,
}

impl WatchEvent {
    /// Create a watch event.
    pub fn new(kind: WatchEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The session is established (or re-established).
    Connected,
    /// The connection to the service was lost.
    Disconnected,
    /// The service expired the session.
    Expired,
    /// The service rejected the session's credentials.
    AuthenticationFailed,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Expired => write!(f, "expired"),
            Self::AuthenticationFailed => write!(f, "authenticationFailed"),
        }
    }
}

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// Access control applied to created nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acl {
    /// Anyone may read and write.
    OpenUnsafe,
    /// Full access for the authenticated creator only.
    CreatorAll,
}

/// Factory for coordination sessions.
///
/// `connect` must not block: it returns the handle immediately and reports
/// the outcome of the handshake through [`SessionEvents`].
pub trait Connector {
    /// Handle type produced by this connector.
    type Client: CoordinationClient + 'static;

    /// Start a new session against `connect_string` (servers plus chroot).
    fn connect(&self, connect_string: &str) -> CoordinationResult<(Self::Client, SessionEvents)>;
}

/// Primitives of a coordination session.
///
/// Single-threaded design: no `Send` bounds.
#[async_trait(?Send)]
pub trait CoordinationClient {
    /// Attach credentials to the session.
    async fn add_auth(&self, scheme: &str, credentials: &[u8]) -> CoordinationResult<()>;

    /// List the children of `path`.
    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    /// List the children of `path` and arm a one-shot children watch on it.
    async fn watch_children(&self, path: &str) -> CoordinationResult<(Vec<String>, Watch)>;

    /// Read the data of `path`.
    async fn get_data(&self, path: &str) -> CoordinationResult<Vec<u8>>;

    /// Read the data of `path` and arm a one-shot data watch on it.
    async fn watch_data(&self, path: &str) -> CoordinationResult<(Vec<u8>, Watch)>;

    /// Overwrite the data of an existing node.
    async fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<()>;

    /// Create a node. The parent must exist.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: Acl,
        mode: CreateMode,
    ) -> CoordinationResult<()>;

    /// Create `path` and any missing ancestors. Existing nodes are left alone.
    async fn mkdirp(&self, path: &str, acl: Acl, mode: CreateMode) -> CoordinationResult<()>;

    /// Close the session. Pending watches are cancelled.
    fn close(&self);
}

/// Join a parent path and a child name.
pub fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
