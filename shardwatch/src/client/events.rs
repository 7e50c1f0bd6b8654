//! Lifecycle notifications emitted by the availability client.

use tokio::sync::mpsc;

use crate::state::ResourceGroupState;

/// Receiver half returned by [`AvailabilityClient::subscribe`](crate::AvailabilityClient::subscribe).
pub type HaEventReceiver = mpsc::UnboundedReceiver<HaEvent>;

/// Something observable happened to the client or to a resource group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaEvent {
    /// The first full listing of a connect cycle is loaded.
    Ready,

    /// A group was seen for the first time.
    NodeAdd {
        /// Group name.
        name: String,
        /// Its state.
        state: ResourceGroupState,
    },

    /// A known group's state was replaced.
    Change {
        /// Group name.
        name: String,
        /// The new state.
        state: ResourceGroupState,
    },

    /// A known group's master differs from the previous state.
    ///
    /// Always preceded by the matching [`HaEvent::Change`].
    MasterChange {
        /// Group name.
        name: String,
        /// The new state.
        state: ResourceGroupState,
    },

    /// A group's node was deleted.
    NodeRemove {
        /// Group name.
        name: String,
        /// The last state seen before removal.
        state: ResourceGroupState,
    },

    /// A connect attempt did not see "connected" within the connect timeout.
    Timeout,
}

impl HaEvent {
    /// Short name of the event, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HaEvent::Ready => "ready",
            HaEvent::NodeAdd { .. } => "nodeAdd",
            HaEvent::Change { .. } => "change",
            HaEvent::MasterChange { .. } => "masterChange",
            HaEvent::NodeRemove { .. } => "nodeRemove",
            HaEvent::Timeout => "timeout",
        }
    }

    /// Group the event refers to, if any.
    pub fn group(&self) -> Option<&str> {
        match self {
            HaEvent::NodeAdd { name, .. }
            | HaEvent::Change { name, .. }
            | HaEvent::MasterChange { name, .. }
            | HaEvent::NodeRemove { name, .. } => Some(name),
            HaEvent::Ready | HaEvent::Timeout => None,
        }
    }
}

/// Fan-out of events to every live subscriber.
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<HaEvent>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&mut self) -> HaEventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Deliver `event` to every subscriber, forgetting the ones that hung up.
    pub(crate) fn emit(&mut self, event: HaEvent) {
        tracing::debug!(event = event.kind(), group = ?event.group(), "emitting event");
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
