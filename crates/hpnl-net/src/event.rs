use std::fmt;

use hpnl_types::{BufferId, EventQueueHandle};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Completion kinds delivered to connection callbacks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EventKind {
    /// The connection handshake finished.
    Connected = 1,
    /// A posted receive buffer was filled.
    Received = 2,
    /// A posted send finished; its buffer may be reused.
    Sent = 3,
    /// An RMA read into a local buffer finished.
    Read = 4,
    /// The connection went down (peer disconnect or local teardown).
    Shutdown = 5,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Connected,
        EventKind::Received,
        EventKind::Sent,
        EventKind::Read,
        EventKind::Shutdown,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Connected => write!(f, "CONNECTED"),
            EventKind::Received => write!(f, "RECEIVED"),
            EventKind::Sent => write!(f, "SENT"),
            EventKind::Read => write!(f, "READ"),
            EventKind::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// One record yielded by [`Transport::poll`](crate::Transport::poll).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A passive endpoint accepted a connection request; `eq` is the new
    /// queue created for it. Its `Connected` event follows on `eq` itself.
    Accepted {
        listener: EventQueueHandle,
        eq: EventQueueHandle,
    },
    /// A completion on a connected queue. `buffer_id` and `len` are zero for
    /// `Connected` and `Shutdown`.
    Event {
        eq: EventQueueHandle,
        kind: EventKind,
        buffer_id: BufferId,
        len: usize,
    },
}

impl Completion {
    /// Shorthand for a completion without an associated buffer.
    pub fn bare(eq: EventQueueHandle, kind: EventKind) -> Self {
        Completion::Event {
            eq,
            kind,
            buffer_id: BufferId(0),
            len: 0,
        }
    }

    /// The queue this record was reported on.
    pub fn event_queue(&self) -> EventQueueHandle {
        match self {
            Completion::Accepted { listener, .. } => *listener,
            Completion::Event { eq, .. } => *eq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_numeric() {
        assert_eq!(u8::from(EventKind::Connected), 1);
        assert_eq!(EventKind::try_from(4u8).unwrap(), EventKind::Read);
        assert!(EventKind::try_from(0u8).is_err());
        assert!(EventKind::try_from(6u8).is_err());
    }

    #[test]
    fn test_event_kind_display() {
        let names: Vec<String> = EventKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, ["CONNECTED", "RECEIVED", "SENT", "READ", "SHUTDOWN"]);
    }

    #[test]
    fn test_completion_event_queue() {
        let accepted = Completion::Accepted {
            listener: EventQueueHandle(1),
            eq: EventQueueHandle(2),
        };
        assert_eq!(accepted.event_queue(), EventQueueHandle(1));

        let bare = Completion::bare(EventQueueHandle(5), EventKind::Shutdown);
        assert_eq!(bare.event_queue(), EventQueueHandle(5));
    }
}
