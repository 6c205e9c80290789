//! The relationship lifecycle between a private VID and a remote VID, as a
//! pure transition function. The store applies these transitions when sealing
//! or opening control messages; keeping the rules here makes the allowed
//! state changes auditable in one place.

use serde::{Deserialize, Serialize};

use crate::definitions::ThreadId;

/// Where a relationship with a remote VID currently stands. A relationship is
/// always tracked from the local point of view; both ends converge on
/// `Established` with the same thread id when a handshake completes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipState {
    /// No handshake has happened (or the VID was imported out-of-band).
    #[default]
    NoRelation,
    /// We sent a relationship request and are waiting for the accept.
    Requested { thread_id: ThreadId },
    /// A bidirectional relationship exists. Nested handshakes that were
    /// started under this relationship but not yet affirmed are tracked here.
    Established {
        thread_id: ThreadId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outstanding_nested_threads: Vec<ThreadId>,
    },
    /// The relationship was cancelled by either side. Terminal: no further
    /// handshake can revive this pair.
    Cancelled,
}

impl RelationshipState {
    /// The thread id of the live handshake or relationship, if there is one.
    pub fn thread_id(&self) -> Option<ThreadId> {
        match self {
            RelationshipState::Requested { thread_id }
            | RelationshipState::Established { thread_id, .. } => Some(*thread_id),
            RelationshipState::NoRelation | RelationshipState::Cancelled => None,
        }
    }
}

/// A handshake step, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipEvent {
    SendRequest { thread_id: ThreadId },
    ReceiveAccept { thread_id: ThreadId },
    SendAccept { thread_id: ThreadId },
    SendCancel,
    ReceiveCancel { thread_id: ThreadId },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RelationshipError {
    #[error("event {event:?} is not allowed in state {state:?}")]
    InvalidTransition {
        state: &'static str,
        event: RelationshipEvent,
    },
    #[error("thread id of the control message does not match the handshake")]
    ThreadIdMismatch,
}

fn invalid(state: &RelationshipState, event: RelationshipEvent) -> RelationshipError {
    let state = match state {
        RelationshipState::NoRelation => "NoRelation",
        RelationshipState::Requested { .. } => "Requested",
        RelationshipState::Established { .. } => "Established",
        RelationshipState::Cancelled => "Cancelled",
    };

    RelationshipError::InvalidTransition { state, event }
}

/// Apply a handshake event to a relationship state.
pub fn transition(
    state: &RelationshipState,
    event: RelationshipEvent,
) -> Result<RelationshipState, RelationshipError> {
    use RelationshipEvent::*;
    use RelationshipState::*;

    match (state, event) {
        // a cancelled relationship stays cancelled; tolerate duplicate
        // cancels but nothing else
        (Cancelled, ReceiveCancel { .. }) => Ok(Cancelled),
        (Cancelled, _) => Err(invalid(state, event)),

        // (re)sending a request supersedes an earlier unanswered one
        (NoRelation | Requested { .. }, SendRequest { thread_id }) => Ok(Requested { thread_id }),
        (Established { .. }, SendRequest { .. }) => Err(invalid(state, event)),

        // the accept must echo the thread id of our request
        (Requested { thread_id }, ReceiveAccept { thread_id: reply }) => {
            if *thread_id != reply {
                return Err(RelationshipError::ThreadIdMismatch);
            }
            Ok(Established {
                thread_id: reply,
                outstanding_nested_threads: vec![],
            })
        }
        (
            Established {
                thread_id,
                outstanding_nested_threads,
            },
            ReceiveAccept { thread_id: reply },
        ) if *thread_id == reply => Ok(Established {
            thread_id: reply,
            outstanding_nested_threads: outstanding_nested_threads.clone(),
        }),
        (_, ReceiveAccept { .. }) => Err(invalid(state, event)),

        // accepting a request we received; a concurrent request of our own
        // is superseded by the accepted thread
        (NoRelation | Requested { .. }, SendAccept { thread_id }) => Ok(Established {
            thread_id,
            outstanding_nested_threads: vec![],
        }),
        (Established { thread_id, .. }, SendAccept { thread_id: reply }) if *thread_id == reply => {
            Ok(state.clone())
        }
        (Established { .. }, SendAccept { .. }) => Err(invalid(state, event)),

        (Requested { .. } | Established { .. }, SendCancel) => Ok(Cancelled),
        (NoRelation, SendCancel) => Err(invalid(state, event)),

        // a received cancel must carry the thread id of the live handshake
        (Requested { thread_id } | Established { thread_id, .. }, ReceiveCancel { thread_id: reply }) => {
            if *thread_id != reply {
                return Err(RelationshipError::ThreadIdMismatch);
            }
            Ok(Cancelled)
        }
        // cancelling a relationship we never tracked is a no-op
        (NoRelation, ReceiveCancel { .. }) => Ok(NoRelation),
    }
}
