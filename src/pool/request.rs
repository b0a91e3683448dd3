use std::fmt;

use log::warn;

use super::{ConnectionId, DestinationKey};

/// Identifies one logical request issued through a client.
#[derive(Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn new(id: u64) -> RequestId {
        RequestId(id)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle of a request.
///
/// ```text
/// Created  -> Queued | Assigned
/// Queued   -> Assigned
/// Assigned -> InFlight
/// InFlight -> Completed
/// Queued | Assigned | InFlight -> Reset | TimedOut | Failed
/// ```
///
/// Terminal states are final.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Handed to the client, not yet seen by the pool.
    Created,
    /// Waiting for a connection to become available.
    Queued,
    /// Owns a connection that is opening or about to send.
    Assigned,
    /// The exchange is running on the transport.
    InFlight,
    /// A response was fully received.
    Completed,
    /// The deadline fired before a response arrived.
    TimedOut,
    /// The request was cancelled by its caller.
    Reset,
    /// Resolution, connect or the exchange itself failed.
    Failed,
}

impl State {
    /// Returns true if no transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Completed | State::TimedOut | State::Reset | State::Failed
        )
    }

    fn can_advance(self, to: State) -> bool {
        use State::*;

        match (self, to) {
            (Created, Queued) | (Created, Assigned) => true,
            (Queued, Assigned) => true,
            (Assigned, InFlight) => true,
            (InFlight, Completed) => true,
            (Queued | Assigned | InFlight, Reset | TimedOut | Failed) => true,
            _ => false,
        }
    }
}

/// Why a request is being pulled out of the pool before completing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Cancel {
    /// The caller reset the request or dropped its handle.
    Reset,
    /// The request deadline fired.
    Timeout,
}

impl Cancel {
    pub(super) fn state(self) -> State {
        match self {
            Cancel::Reset => State::Reset,
            Cancel::Timeout => State::TimedOut,
        }
    }
}

/// Bookkeeping for a request the pool is tracking.
#[derive(Debug)]
pub(super) struct Request {
    pub(super) id: RequestId,
    pub(super) key: DestinationKey,
    pub(super) state: State,
    pub(super) connection: Option<ConnectionId>,
}

impl Request {
    pub(super) fn new(id: RequestId, key: DestinationKey) -> Request {
        Request {
            id,
            key,
            state: State::Created,
            connection: None,
        }
    }

    /// Moves to `to`, refusing transitions the lifecycle does not allow.
    pub(super) fn advance(&mut self, to: State) -> bool {
        if self.state.can_advance(to) {
            self.state = to;
            true
        } else {
            warn!(
                "invalid transition for {:?}: {:?} -> {:?}",
                self.id, self.state, to
            );
            false
        }
    }
}
