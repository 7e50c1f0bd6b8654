//! Connection state machine of the availability client.

/// Connection lifecycle of an [`AvailabilityClient`](crate::AvailabilityClient).
///
/// ```text
///            start()                connected             first load done
///   Init ──────────────> Connecting ─────────> Connected ─────────────────> Ready
///    ^  ^                 │      ^                  │                         │
///    │  │     timeout     │      │ timer tick       │ disconnected / expired  │ disconnected /
///    │  │                 v      │                  v                         │ expired / miss
///    │  └───────────── TimedOut ─┴──────────── Reconnecting <─────────────────┘
///    │
///    └──── close() from any state
/// ```
///
/// Transitions are checked against an explicit table
/// ([`can_transition_to`](Self::can_transition_to)) rather than by comparing
/// states by order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not started, or closed.
    #[default]
    Init,
    /// A session was requested and its "connected" event is awaited.
    Connecting,
    /// The session is up; the initial group listing is loading.
    Connected,
    /// The initial listing completed; lookups are served.
    Ready,
    /// The previous session was dropped; a retry timer is running.
    Reconnecting,
    /// The last connect attempt did not see "connected" in time.
    TimedOut,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Init | Reconnecting | TimedOut, Connecting)
                | (Connecting, Connected)
                | (Connecting, TimedOut)
                | (Connected, Ready)
                | (Init | Connected | Ready | TimedOut, Reconnecting)
                | (_, Init)
        )
    }

    /// Whether a connect attempt is currently outstanding.
    pub fn attempt_in_flight(self) -> bool {
        self == ConnectionState::Connecting
    }

    /// Whether the client holds an established session.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Ready)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Ready => write!(f, "Ready"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}
