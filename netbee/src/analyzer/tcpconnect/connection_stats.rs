use std::{fmt, net::Ipv4Addr};

use super::state_machine::{Event, State, StateMachine, Transition, TransitionError};

/// Client-side 4-tuple of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src: {}:{}, dst: {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub key: ConnKey,
    pub pid: u32,
    pub comm: String,
    pub container_id: String,
    pub initial_timestamp: u64,
    pub end_timestamp: u64,
    /// Return code of the failing `tcp_connect`/`connect`, 0 otherwise.
    pub code: i64,
    state_machine: StateMachine,
}

impl ConnectionStats {
    pub fn new(key: ConnKey, timestamp: u64, code: i64) -> Self {
        Self {
            key,
            pid: 0,
            comm: String::new(),
            container_id: String::new(),
            initial_timestamp: timestamp,
            end_timestamp: timestamp,
            code,
            state_machine: StateMachine::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state_machine.current()
    }

    pub fn connect_duration(&self) -> i64 {
        self.end_timestamp as i64 - self.initial_timestamp as i64
    }

    pub fn receive_event(&mut self, event: Event) -> Result<Transition, TransitionError> {
        let changed = self.state_machine.receive(event)?;
        let next_state = self.state_machine.current();
        let (emit, evict) = match next_state {
            State::Success | State::Failure if changed => (Some(self.clone()), false),
            State::Closed => (None, true),
            _ => (None, false),
        };
        Ok(Transition {
            next_state,
            emit,
            evict,
        })
    }
}
