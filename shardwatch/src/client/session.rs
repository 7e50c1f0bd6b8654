//! Per-session driver task.
//!
//! One [`SessionDriver`] is spawned for every session handed out by the
//! connector. It waits for the session to connect, loads every group, then
//! serializes session events and watch notifications in a single
//! `select!` loop. The driver exits as soon as its session is no longer the
//! client's current one.
//!
//! A watch that could not be re-armed while the session stayed up is retried
//! after [`ReconnectPolicy::rearm_interval`](crate::ReconnectPolicy::rearm_interval),
//! so a transient read error never leaves a group or the listing unwatched.

use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Inner, Shared};
use crate::coordination::{
    Connector, CoordinationClient, SessionEvent, SessionEvents, Watch, WatchEvent, WatchEventKind,
    child_path,
};
use crate::state::ResourceGroupState;

/// Work queued for the driver loop.
#[derive(Debug)]
enum Notification {
    /// The group listing under the base path changed.
    Children(WatchEvent),
    /// A group's node changed or was deleted.
    Group {
        name: String,
        token: u64,
        event: WatchEvent,
    },
    /// Arming the children watch failed earlier.
    RetryChildren,
    /// Arming the data watch of a group failed earlier.
    RetryGroup(String),
}

pub(super) struct SessionDriver<C: Connector> {
    inner: Weak<Inner<C>>,
    generation: u64,
    session: Rc<C::Client>,
    base_path: String,
    rearm_interval: Duration,
    notify_tx: mpsc::UnboundedSender<Notification>,
    children_armed: Cell<bool>,
    ready: Cell<bool>,
}

impl<C: Connector + 'static> SessionDriver<C> {
    pub(super) fn spawn(
        inner: &Rc<Inner<C>>,
        generation: u64,
        session: Rc<C::Client>,
        events: SessionEvents,
    ) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let driver = Self {
            inner: Rc::downgrade(inner),
            generation,
            session,
            base_path: inner.config.base_path.clone(),
            rearm_interval: inner.config.reconnect.rearm_interval,
            notify_tx,
            children_armed: Cell::new(false),
            ready: Cell::new(false),
        };
        let connect_timeout = inner.config.connect_timeout;
        let credentials = inner.config.credentials();
        tokio::task::spawn_local(driver.run(events, notify_rx, connect_timeout, credentials));
    }

    async fn run(
        self,
        mut events: SessionEvents,
        mut notify_rx: mpsc::UnboundedReceiver<Notification>,
        connect_timeout: Duration,
        credentials: Option<Vec<u8>>,
    ) {
        match tokio::time::timeout(connect_timeout, wait_connected(&mut events)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(generation = self.generation, "session ended before connecting");
                return;
            }
            Err(_) => {
                if let Some(inner) = self.inner.upgrade() {
                    inner.on_connect_timeout(self.generation);
                }
                return;
            }
        }

        let connected = self
            .inner
            .upgrade()
            .is_some_and(|inner| inner.on_connected(self.generation));
        if !connected {
            return;
        }

        if let Some(credentials) = credentials {
            if let Err(e) = self.session.add_auth("digest", &credentials).await {
                error!(error = %e, "failed to add digest credentials");
            }
        }

        if self.load_groups().await {
            self.announce_ready(&mut events);
        }

        while self.current().is_some() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_session_event(event),
                    None => {
                        if let Some(inner) = self.current() {
                            warn!("session event stream closed, reconnecting");
                            inner.schedule_reconnect();
                        }
                        break;
                    }
                },
                Some(notification) = notify_rx.recv() => {
                    if self.on_notification(notification).await {
                        self.announce_ready(&mut events);
                    }
                }
            }
        }

        debug!(generation = self.generation, "session driver stopped");
    }

    /// The client, if this driver's session is still the current one.
    fn current(&self) -> Option<Rc<Inner<C>>> {
        self.inner
            .upgrade()
            .filter(|inner| inner.shared.borrow().generation == self.generation)
    }

    /// Run `f` against the shared state if this session is still current.
    fn with_current<R>(&self, f: impl FnOnce(&mut Shared<C::Client>) -> R) -> Option<R> {
        let inner = self.inner.upgrade()?;
        let mut shared = inner.shared.borrow_mut();
        if shared.generation != self.generation {
            return None;
        }
        Some(f(&mut shared))
    }

    /// Emit `Ready` once the first full listing is in, unless the session
    /// was lost while it loaded.
    fn announce_ready(&self, events: &mut SessionEvents) {
        if self.ready.get() {
            return;
        }
        while let Ok(event) = events.try_recv() {
            self.on_session_event(event);
        }
        if let Some(inner) = self.current() {
            inner.mark_ready(self.generation);
            self.ready.set(true);
        }
    }

    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => info!("session re-established"),
            SessionEvent::Disconnected | SessionEvent::Expired => {
                error!(%event, "lost coordination session, reconnecting");
                if let Some(inner) = self.current() {
                    inner.schedule_reconnect();
                }
            }
            SessionEvent::AuthenticationFailed => {
                error!("authentication to coordination service failed");
            }
        }
    }

    /// Handle one queued notification. Returns `true` when it completed a
    /// full listing.
    async fn on_notification(&self, notification: Notification) -> bool {
        match notification {
            Notification::Children(event) => {
                debug!(path = %event.path, kind = ?event.kind, "group listing changed");
                self.children_armed.set(false);
                self.load_groups().await
            }
            Notification::RetryChildren => {
                if self.children_armed.get() {
                    return false;
                }
                self.load_groups().await
            }
            Notification::Group { name, token, event } => {
                match self.with_current(|shared| shared.disarm(&name, token)) {
                    Some(true) => {}
                    Some(false) => {
                        debug!(group = %name, "ignoring stale watch");
                        return false;
                    }
                    None => return false,
                }
                if event.kind == WatchEventKind::Deleted {
                    self.with_current(|shared| shared.remove_state(&name));
                } else {
                    self.fetch_group(&name).await;
                }
                false
            }
            Notification::RetryGroup(name) => {
                if self.with_current(|shared| shared.is_armed(&name)) == Some(false) {
                    self.fetch_group(&name).await;
                }
                false
            }
        }
    }

    /// List the groups, re-arm the children watch and fetch every group.
    ///
    /// Returns `false` if the listing could not be read; a retry is queued
    /// in that case. A missing base path counts as an empty listing.
    async fn load_groups(&self) -> bool {
        let (children, watch) = match self.session.watch_children(&self.base_path).await {
            Ok(listing) => listing,
            Err(e) if e.is_no_node() => {
                error!(path = %self.base_path, "base path does not exist");
                return true;
            }
            Err(e) => {
                warn!(path = %self.base_path, error = %e, "failed to list resource groups, retrying");
                self.retry_later(Notification::RetryChildren);
                return false;
            }
        };
        self.children_armed.set(true);
        self.forward(watch, Notification::Children);
        debug!(count = children.len(), "listed resource groups");

        for name in children {
            if self.current().is_none() {
                return false;
            }
            self.fetch_group(&name).await;
        }
        true
    }

    /// Read one group's node, arming its data watch unless one is already out.
    async fn fetch_group(&self, name: &str) {
        let path = child_path(&self.base_path, name);
        let Some(armed) = self.with_current(|shared| shared.is_armed(name)) else {
            return;
        };

        let fetched = if armed {
            self.session.get_data(&path).await.map(|data| (data, None))
        } else {
            self.session
                .watch_data(&path)
                .await
                .map(|(data, watch)| (data, Some(watch)))
        };

        let (data, watch) = match fetched {
            Ok(fetched) => fetched,
            Err(e) if e.is_no_node() => {
                warn!(group = name, %path, "group node vanished before it was read");
                self.with_current(|shared| shared.remove_state(name));
                return;
            }
            Err(e) if armed => {
                // The armed watch still reports the next write
                error!(group = name, %path, error = %e, "failed to read group state");
                return;
            }
            Err(e) => {
                warn!(group = name, %path, error = %e, "failed to watch group state, retrying");
                self.retry_later(Notification::RetryGroup(name.to_string()));
                return;
            }
        };

        if let Some(watch) = watch {
            let Some(token) = self.with_current(|shared| shared.arm(name)) else {
                return;
            };
            let name = name.to_string();
            self.forward(watch, move |event| Notification::Group { name, token, event });
        }

        if data.is_empty() {
            warn!(group = name, %path, "group node has no data");
            return;
        }
        match ResourceGroupState::from_bytes(&data) {
            Ok(state) => {
                self.with_current(|shared| shared.set_state(name, state));
            }
            Err(e) => error!(group = name, %path, error = %e, "failed to decode group state"),
        }
    }

    /// Deliver `watch` into the driver's queue once it fires.
    fn forward(&self, watch: Watch, wrap: impl FnOnce(WatchEvent) -> Notification + 'static) {
        let tx = self.notify_tx.clone();
        tokio::task::spawn_local(async move {
            // A dropped sender means the session was closed
            if let Ok(event) = watch.await {
                let _ = tx.send(wrap(event));
            }
        });
    }

    /// Queue `notification` after the re-arm interval.
    fn retry_later(&self, notification: Notification) {
        let tx = self.notify_tx.clone();
        let delay = self.rearm_interval;
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(notification);
        });
    }
}

/// Wait for the first "connected" event. `false` if the stream ended first.
async fn wait_connected(events: &mut SessionEvents) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected => return true,
            SessionEvent::AuthenticationFailed => {
                error!("authentication to coordination service failed");
            }
            other => warn!(event = %other, "session event before connected"),
        }
    }
    false
}
