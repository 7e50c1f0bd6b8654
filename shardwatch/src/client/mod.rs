//! The availability client.
//!
//! [`AvailabilityClient`] keeps an in-memory copy of every resource group
//! found under the configured base path and answers "who is the master" /
//! "give me a slave" without touching the coordination service.
//!
//! # Architecture
//!
//! ```text
//!   get_client / check_valid             (synchronous, never await)
//!            │
//!            ▼
//!   ┌──────────────────────────────┐
//!   │ Inner                        │  Rc<RefCell<Shared>>: state, groups,
//!   │   connector + config         │  cursors, armed watches, subscribers
//!   └───────▲──────────────▲───────┘
//!           │ Weak         │ Weak
//!   ┌───────┴──────┐  ┌────┴──────────┐
//!   │ SessionDriver│  │ reconnect     │
//!   │ (one per     │  │ timer         │
//!   │  session)    │  └───────────────┘
//!   └───────▲──────┘
//!           │ mpsc: session events + forwarded one-shot watches
//!   CoordinationClient
//! ```
//!
//! Every session gets its own driver task which owns the handle, waits for
//! the "connected" event under the connect timeout, loads all groups, and then
//! processes session events and watch notifications one at a time. All
//! mutations go through one `RefCell` on one thread and no borrow is held
//! across an `.await`.
//!
//! Each session is tagged with a generation number. Resetting the client
//! (disconnect, timeout, close) bumps the generation, so late completions of
//! an older session are dropped instead of being applied to fresh state.

mod connection;
mod events;
mod session;

pub use connection::ConnectionState;
pub use events::{HaEvent, HaEventReceiver};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use crate::config::HaConfig;
use crate::coordination::{CoordinationClient, Connector};
use crate::error::ConfigError;
use crate::state::{ResourceGroupState, Role};
use events::Subscribers;
use session::SessionDriver;

/// Tracks master/slave membership of resource groups.
///
/// The client is single-threaded (`!Send`) and spawns its background work with
/// [`tokio::task::spawn_local`], so it must be used from inside a
/// [`tokio::task::LocalSet`].
///
/// # Example
///
/// ```rust,ignore
/// let client = AvailabilityClient::new(connector, HaConfig::new("10.0.0.1:2181"))?;
/// let mut events = client.subscribe();
/// client.start();
///
/// while let Some(event) = events.recv().await {
///     if event == HaEvent::Ready {
///         break;
///     }
/// }
///
/// let master = client.get_client("cache-1", Role::Master);
/// let replica = client.get_client("cache-1", Role::Slave);
/// ```
///
/// Dropping the client closes it.
pub struct AvailabilityClient<C: Connector + 'static> {
    inner: Rc<Inner<C>>,
}

impl<C: Connector + 'static> AvailabilityClient<C> {
    /// Create a client. Nothing happens until [`start`](Self::start).
    pub fn new(connector: C, config: HaConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Rc::new(Inner {
                connector,
                config,
                shared: RefCell::new(Shared::new()),
            }),
        })
    }

    /// Begin connecting.
    ///
    /// No-op while a connect attempt is in flight or a session is established.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Drop the current session and reconnect on the retry timer.
    ///
    /// No-op while connecting or already reconnecting.
    pub fn reconnect(&self) {
        self.inner.restart();
    }

    /// Stop all background work, close the session and forget every group.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Register for lifecycle events.
    pub fn subscribe(&self) -> HaEventReceiver {
        self.inner.shared.borrow_mut().subscribers.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.borrow().state
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &HaConfig {
        &self.inner.config
    }

    /// Member to use for `name` in the given `role`.
    ///
    /// Returns `None` until the client is ready. A ready client that has no
    /// answer (unknown group, no master, no slaves) treats the miss as a sign
    /// of a stale view, schedules a reconnect and returns `None`.
    ///
    /// Slaves are handed out round-robin per group.
    pub fn get_client(&self, name: &str, role: Role) -> Option<String> {
        self.inner.get_client(name, role)
    }

    /// Shorthand for `get_client(name, Role::Master)`.
    pub fn master(&self, name: &str) -> Option<String> {
        self.get_client(name, Role::Master)
    }

    /// Shorthand for `get_client(name, Role::Slave)`.
    pub fn slave(&self, name: &str) -> Option<String> {
        self.get_client(name, Role::Slave)
    }

    /// Whether `member` is still known to group `name`, either as master,
    /// slave, or as a known-but-unavailable member.
    pub fn check_valid(&self, name: &str, member: &str) -> bool {
        let shared = self.inner.shared.borrow();
        shared.state == ConnectionState::Ready
            && shared
                .groups
                .get(name)
                .is_some_and(|group| group.knows(member))
    }

    /// Snapshot of one group's state, when ready.
    pub fn group(&self, name: &str) -> Option<ResourceGroupState> {
        let shared = self.inner.shared.borrow();
        if shared.state != ConnectionState::Ready {
            return None;
        }
        shared.groups.get(name).cloned()
    }

    /// Names of all known groups, sorted. Empty unless ready.
    pub fn group_names(&self) -> Vec<String> {
        let shared = self.inner.shared.borrow();
        if shared.state != ConnectionState::Ready {
            return Vec::new();
        }
        let mut names: Vec<String> = shared.groups.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<C: Connector + 'static> Drop for AvailabilityClient<C> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<C: Connector + 'static> std::fmt::Debug for AvailabilityClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared.borrow();
        f.debug_struct("AvailabilityClient")
            .field("state", &shared.state)
            .field("generation", &shared.generation)
            .field("groups", &shared.groups.len())
            .finish()
    }
}

struct Inner<C: Connector> {
    connector: C,
    config: HaConfig,
    shared: RefCell<Shared<C::Client>>,
}

impl<C: Connector + 'static> Inner<C> {
    fn start(self: &Rc<Self>) {
        let mut shared = self.shared.borrow_mut();
        if !shared.state.can_transition_to(ConnectionState::Connecting) {
            debug!(state = %shared.state, "start ignored");
            return;
        }

        let connect_string = self.config.connect_string();
        let (session, events) = match self.connector.connect(&connect_string) {
            Ok(pair) => pair,
            Err(e) => {
                error!(servers = %connect_string, error = %e, "failed to create coordination session");
                return;
            }
        };

        shared.generation += 1;
        let generation = shared.generation;
        let session = Rc::new(session);
        if let Some(stale) = shared.session.replace(Rc::clone(&session)) {
            stale.close();
        }
        shared.transition(ConnectionState::Connecting);
        drop(shared);

        info!(servers = %connect_string, generation, "connecting to coordination service");
        SessionDriver::spawn(self, generation, session, events);
    }

    fn restart(self: &Rc<Self>) {
        let state = self.shared.borrow().state;
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            debug!(%state, "restart ignored");
            return;
        }
        info!("restarting availability client");
        self.schedule_reconnect();
    }

    /// Discard everything and retry on a jittered interval until connected.
    fn schedule_reconnect(self: &Rc<Self>) {
        let mut shared = self.shared.borrow_mut();
        if shared.reconnect_timer.is_some()
            || !shared.state.can_transition_to(ConnectionState::Reconnecting)
        {
            debug!(state = %shared.state, "reconnect not scheduled");
            return;
        }

        shared.clear_up();
        shared.transition(ConnectionState::Reconnecting);

        let interval = self.config.reconnect.next_interval(&mut rand::rng());
        info!(?interval, "scheduling reconnect");

        let weak = Rc::downgrade(self);
        shared.reconnect_timer = Some(tokio::task::spawn_local(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_reconnect_tick();
            }
        }));
    }

    fn on_reconnect_tick(self: &Rc<Self>) {
        let state = self.shared.borrow().state;
        if state.attempt_in_flight() {
            debug!("connect attempt in flight, skipping reconnect tick");
            return;
        }
        info!(%state, "coordination client reconnecting");
        self.start();
    }

    /// Returns `false` if the session is no longer the current one.
    fn on_connected(&self, generation: u64) -> bool {
        let mut shared = self.shared.borrow_mut();
        if shared.generation != generation || !shared.transition(ConnectionState::Connected) {
            return false;
        }
        shared.cancel_reconnect_timer();
        info!(generation, "connected to coordination service");
        true
    }

    fn on_connect_timeout(&self, generation: u64) {
        let mut shared = self.shared.borrow_mut();
        if shared.generation != generation || !shared.transition(ConnectionState::TimedOut) {
            return;
        }
        warn!(
            timeout = ?self.config.connect_timeout,
            "connect to coordination service timed out"
        );
        if let Some(session) = shared.session.take() {
            session.close();
        }
        shared.generation += 1;
        shared.subscribers.emit(HaEvent::Timeout);
    }

    fn mark_ready(&self, generation: u64) {
        let mut shared = self.shared.borrow_mut();
        if shared.generation != generation || !shared.transition(ConnectionState::Ready) {
            return;
        }
        info!(groups = shared.groups.len(), "availability client ready");
        shared.subscribers.emit(HaEvent::Ready);
    }

    fn get_client(self: &Rc<Self>, name: &str, role: Role) -> Option<String> {
        let selected = {
            let mut shared = self.shared.borrow_mut();
            if shared.state != ConnectionState::Ready {
                return None;
            }
            shared.select(name, role)
        };

        if selected.is_none() {
            error!(group = name, %role, "no member to hand out, scheduling reconnect");
            self.schedule_reconnect();
        }
        selected
    }

    fn close(&self) {
        let mut shared = self.shared.borrow_mut();
        shared.cancel_reconnect_timer();
        shared.clear_up();
        if shared.state != ConnectionState::Init {
            shared.transition(ConnectionState::Init);
            info!("availability client closed");
        }
    }
}

/// Mutable state of one client. Only touched through `Inner::shared`.
struct Shared<K> {
    state: ConnectionState,
    /// Identifies the current session; bumped on every reset.
    generation: u64,
    session: Option<Rc<K>>,
    groups: HashMap<String, ResourceGroupState>,
    /// Round-robin position per group.
    cursors: HashMap<String, usize>,
    /// Token of the data watch currently armed per group.
    armed: HashMap<String, u64>,
    next_token: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    subscribers: Subscribers,
}

impl<K: CoordinationClient> Shared<K> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Init,
            generation: 0,
            session: None,
            groups: HashMap::new(),
            cursors: HashMap::new(),
            armed: HashMap::new(),
            next_token: 0,
            reconnect_timer: None,
            subscribers: Subscribers::default(),
        }
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "rejected state transition");
            return false;
        }
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        true
    }

    /// Forget all groups and drop the session.
    fn clear_up(&mut self) {
        self.groups.clear();
        self.cursors.clear();
        self.armed.clear();
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.generation += 1;
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn select(&mut self, name: &str, role: Role) -> Option<String> {
        let group = self.groups.get(name)?;
        let member = match role {
            Role::Master => group.master.clone(),
            Role::Slave => {
                let len = group.slaves.len();
                let mut index = self.cursors.get(name).copied().unwrap_or(0);
                if index >= len {
                    index = 0;
                }
                let member = group.slaves.get(index).cloned();
                self.cursors.insert(name.to_string(), (index + 1) % len.max(1));
                member
            }
        };
        member.filter(|m| !m.is_empty())
    }

    fn set_state(&mut self, name: &str, state: ResourceGroupState) {
        match self.groups.insert(name.to_string(), state.clone()) {
            None => {
                info!(group = name, master = ?state.master, slaves = state.slaves.len(), "group added");
                self.subscribers.emit(HaEvent::NodeAdd {
                    name: name.to_string(),
                    state,
                });
            }
            Some(previous) if previous == state => {
                debug!(group = name, "group state unchanged");
            }
            Some(previous) => {
                info!(group = name, master = ?state.master, slaves = state.slaves.len(), "group changed");
                let master_changed = previous.master != state.master;
                self.subscribers.emit(HaEvent::Change {
                    name: name.to_string(),
                    state: state.clone(),
                });
                if master_changed {
                    warn!(group = name, from = ?previous.master, to = ?state.master, "master changed");
                    self.subscribers.emit(HaEvent::MasterChange {
                        name: name.to_string(),
                        state,
                    });
                }
            }
        }
    }

    fn remove_state(&mut self, name: &str) {
        self.armed.remove(name);
        self.cursors.remove(name);
        if let Some(state) = self.groups.remove(name) {
            warn!(group = name, "group removed");
            self.subscribers.emit(HaEvent::NodeRemove {
                name: name.to_string(),
                state,
            });
        }
    }

    fn is_armed(&self, name: &str) -> bool {
        self.armed.contains_key(name)
    }

    /// Record a freshly armed data watch and return its token.
    fn arm(&mut self, name: &str) -> u64 {
        self.next_token += 1;
        self.armed.insert(name.to_string(), self.next_token);
        self.next_token
    }

    /// Consume the armed watch for `name` if `token` is still the current one.
    fn disarm(&mut self, name: &str, token: u64) -> bool {
        if self.armed.get(name) == Some(&token) {
            self.armed.remove(name);
            true
        } else {
            false
        }
    }
}
