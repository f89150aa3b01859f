//! Lifecycle of one TCP connection attempt.
//!
//! ```text
//! Inprogress ──► Success ──► Closed
//!      │                       ▲
//!      └──────► Failure ───────┘
//! ```
//!
//! Entering `Success` or `Failure` emits the connection stats once; entering
//! `Closed` evicts the attempt from its owner.

use std::fmt;

use super::connection_stats::ConnectionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Inprogress,
    Success,
    Failure,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Inprogress => "inprogress",
            State::Success => "success",
            State::Failure => "failure",
            State::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    TcpConnectNoError,
    TcpConnectError,
    ToEstablished,
    FromEstablished,
    SendRequest,
    ConnectExitSuccess,
    ConnectExitFailure,
    /// `connect` returned a code that does not mean failure (EINPROGRESS and friends).
    ConnectExitNotConcern,
    /// Raised by the `/proc` reconciliation scan.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("receive not supported event [{event:?}] in state [{state}]")]
    Unsupported { state: State, event: Event },
    #[error("state [{0}] is terminal")]
    Terminal(State),
}

fn next_state(state: State, event: Event) -> Result<State, TransitionError> {
    use Event::*;
    use State::*;

    let next = match (state, event) {
        (Inprogress, TcpConnectNoError) => Inprogress,
        (Inprogress, TcpConnectError) => Failure,
        // Either side of ESTABLISHED, or a send, proves the handshake
        // completed even when the other signals were lost.
        (Inprogress, ToEstablished | FromEstablished | SendRequest) => Success,
        (Inprogress, ConnectExitSuccess) => Success,
        (Inprogress, ConnectExitFailure) => Failure,
        (Inprogress, ConnectExitNotConcern) => Inprogress,
        (Inprogress, Expired) => Failure,

        (Success, ToEstablished | SendRequest) => Success,
        (Success, FromEstablished) => Closed,
        (Success, ConnectExitSuccess | ConnectExitNotConcern) => Success,
        (Success, Expired) => Closed,

        (Failure, ConnectExitFailure | ConnectExitNotConcern) => Failure,
        (Failure, Expired) => Closed,

        (Closed, _) => return Err(TransitionError::Terminal(state)),
        _ => return Err(TransitionError::Unsupported { state, event }),
    };
    Ok(next)
}

/// Outcome of feeding one event to a connection attempt.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next_state: State,
    /// Stats to publish, set only when the state changed into `Success` or `Failure`.
    pub emit: Option<ConnectionStats>,
    /// The attempt reached `Closed` and must be dropped by its owner.
    pub evict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    current: State,
    last: State,
}

impl StateMachine {
    pub fn new(initial: State) -> Self {
        Self {
            current: initial,
            last: initial,
        }
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn last(&self) -> State {
        self.last
    }

    /// Move to the state `event` leads to. Returns whether the state changed.
    pub fn receive(&mut self, event: Event) -> Result<bool, TransitionError> {
        let next = next_state(self.current, event)?;
        self.last = self.current;
        self.current = next;
        Ok(self.last != self.current)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(State::Inprogress)
    }
}
