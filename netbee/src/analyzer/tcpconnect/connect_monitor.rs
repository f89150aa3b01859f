//! Tracks TCP connection attempts from the client side.
//!
//! Not thread safe: a single owner feeds every event and runs the trims.

use std::{
    collections::{HashMap, hash_map::Entry},
    net::SocketAddrV4,
    path::PathBuf,
};

use log::{Level, debug, info, log_enabled, warn};
use procfs::net::TcpState;

use netbee_common::tcp_state;

use super::{
    connection_stats::{ConnKey, ConnectionStats},
    net_tcp::{SocketStates, host_proc_path, read_pid_tcp_states},
    state_machine::{Event, TransitionError},
};
use crate::{analyzer::now_nanos, model::RawEvent};

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("{attribute} of {event} is nil")]
    MissingAttribute {
        attribute: &'static str,
        event: String,
    },
    #[error("some fields of the 4-tuple are nil for event {0}")]
    MissingTuple(String),
    #[error("no state is 'established' for tcp_set_state event, old state: {old}, new state: {new}")]
    NoEstablishedSide { old: i64, new: i64 },
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// `connect` return codes that mean "not finished yet" rather than failure.
fn is_not_error_return_code(code: i64) -> bool {
    [libc::EINPROGRESS, libc::EINTR, libc::EISCONN, libc::EALREADY]
        .iter()
        .any(|errno| code == -i64::from(*errno))
}

fn user_int(evt: &RawEvent, attribute: &'static str) -> Result<i64, MonitorError> {
    evt.user_attribute(attribute)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| MonitorError::MissingAttribute {
            attribute,
            event: evt.name.clone(),
        })
}

/// Key of kernel-side events, which carry the tuple as user attributes.
fn conn_key_from_attributes(evt: &RawEvent) -> Result<ConnKey, MonitorError> {
    let ip = |k| evt.user_attribute(k).and_then(|v| v.as_ipv4());
    let port = |k| {
        evt.user_attribute(k)
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
    };
    match (ip("sip"), port("sport"), ip("dip"), port("dport")) {
        (Some(src_ip), Some(src_port), Some(dst_ip), Some(dst_port)) => Ok(ConnKey {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }),
        _ => Err(MonitorError::MissingTuple(evt.name.clone())),
    }
}

/// Key of syscall events, taken from the socket the fd refers to.
fn conn_key_from_fd(evt: &RawEvent) -> Result<ConnKey, MonitorError> {
    match (evt.sip(), evt.dip()) {
        (Some(src_ip), Some(dst_ip)) => Ok(ConnKey {
            src_ip,
            src_port: evt.sport(),
            dst_ip,
            dst_port: evt.dport(),
        }),
        _ => Err(MonitorError::MissingTuple(evt.name.clone())),
    }
}

fn fill_process_info(stats: &mut ConnectionStats, evt: &RawEvent) {
    if evt.thread().is_none() {
        return;
    }
    stats.pid = evt.pid();
    stats.comm = evt.comm().to_string();
    stats.container_id = evt.container_id().to_string();
}

pub struct ConnectMonitor {
    conn_map: HashMap<ConnKey, ConnectionStats>,
    host_proc_path: PathBuf,
}

impl ConnectMonitor {
    /// Monitor reading `/proc` from `HOST_PROC_PATH`, default `/proc`.
    pub fn new() -> Self {
        Self::with_proc_path(host_proc_path())
    }

    pub fn with_proc_path(host_proc_path: PathBuf) -> Self {
        Self {
            conn_map: HashMap::new(),
            host_proc_path,
        }
    }

    pub fn get_map_size(&self) -> usize {
        self.conn_map.len()
    }

    pub fn get(&self, key: &ConnKey) -> Option<&ConnectionStats> {
        self.conn_map.get(key)
    }

    /// Feed `event` to the attempt under `key`, dropping it once closed.
    fn receive(
        &mut self,
        key: &ConnKey,
        event: Event,
    ) -> Result<Option<ConnectionStats>, TransitionError> {
        let Some(stats) = self.conn_map.get_mut(key) else {
            return Ok(None);
        };
        let transition = stats.receive_event(event)?;
        if transition.evict {
            self.conn_map.remove(key);
        }
        Ok(transition.emit)
    }

    pub fn read_in_tcp_connect(
        &mut self,
        evt: &RawEvent,
    ) -> Result<Option<ConnectionStats>, MonitorError> {
        let key = conn_key_from_attributes(evt)?;
        let retval = user_int(evt, "retval")?;
        debug!("Receive tcp_connect event: {}, retval: {}", key, retval);

        let event = if retval == 0 {
            Event::TcpConnectNoError
        } else {
            Event::TcpConnectError
        };

        match self.conn_map.entry(key) {
            Entry::Vacant(v) => {
                let stats = v.insert(ConnectionStats::new(key, evt.timestamp, retval));
                fill_process_info(stats, evt);
            }
            Entry::Occupied(mut o) => {
                info!("Receive another unexpected tcp_connect event: {}", key);
                let stats = o.get_mut();
                stats.end_timestamp = evt.timestamp;
                stats.code = retval;
            }
        }
        Ok(self.receive(&key, event)?)
    }

    pub fn read_in_connect_exit_syscall(
        &mut self,
        evt: &RawEvent,
    ) -> Result<Option<ConnectionStats>, MonitorError> {
        let res = user_int(evt, "res")?;
        let key = conn_key_from_fd(evt)?;
        debug!("Receive connect_exit event: {}, res: {}", key, res);

        // Already closed by a tcp_set_state event, or never seen.
        let Some(stats) = self.conn_map.get_mut(&key) else {
            return Ok(None);
        };
        stats.end_timestamp = evt.timestamp;
        fill_process_info(stats, evt);

        let event = if res == 0 {
            Event::ConnectExitSuccess
        } else if is_not_error_return_code(res) {
            Event::ConnectExitNotConcern
        } else {
            stats.code = res;
            Event::ConnectExitFailure
        };
        Ok(self.receive(&key, event)?)
    }

    pub fn read_in_tcp_set_state(
        &mut self,
        evt: &RawEvent,
    ) -> Result<Option<ConnectionStats>, MonitorError> {
        let key = conn_key_from_attributes(evt)?;
        let old = user_int(evt, "old_state")?;
        let new = user_int(evt, "new_state")?;

        let event = if old == tcp_state::ESTABLISHED {
            Event::FromEstablished
        } else if new == tcp_state::ESTABLISHED {
            Event::ToEstablished
        } else {
            return Err(MonitorError::NoEstablishedSide { old, new });
        };
        debug!("Receive tcp_set_state({:?}) event: {}", event, key);

        // Server-side sockets and already-emitted connections are not tracked.
        let Some(stats) = self.conn_map.get_mut(&key) else {
            return Ok(None);
        };
        stats.end_timestamp = evt.timestamp;
        Ok(self.receive(&key, event)?)
    }

    /// A data write on the socket also proves the connection was established.
    pub fn read_send_request_syscall(
        &mut self,
        evt: &RawEvent,
    ) -> Result<Option<ConnectionStats>, MonitorError> {
        let key = conn_key_from_fd(evt)?;
        if log_enabled!(Level::Debug) {
            debug!("Receive send request event {}: {}", evt.name, key);
        }
        let Some(stats) = self.conn_map.get_mut(&key) else {
            return Ok(None);
        };
        fill_process_info(stats, evt);
        Ok(self.receive(&key, Event::SendRequest)?)
    }

    /// Resolve attempts still pending after `wait_secs` against the kernel's
    /// TCP table of their process.
    pub fn trim_connections_with_tcp_stat(&mut self, wait_secs: u64) -> Vec<ConnectionStats> {
        self.trim_connections_at(now_nanos(), wait_secs)
    }

    pub fn trim_connections_at(&mut self, now_ns: u64, wait_secs: u64) -> Vec<ConnectionStats> {
        let wait_ns = wait_secs.saturating_mul(NANOS_PER_SEC);
        let expired: Vec<(ConnKey, u32)> = self
            .conn_map
            .values()
            .filter(|s| s.pid != 0 && now_ns.saturating_sub(s.initial_timestamp) >= wait_ns)
            .map(|s| (s.key, s.pid))
            .collect();

        // One scan per pid.
        let mut tables: HashMap<u32, Option<SocketStates>> = HashMap::new();
        let mut ret = Vec::new();

        for (key, pid) in expired {
            let table = tables.entry(pid).or_insert_with(|| {
                match read_pid_tcp_states(&self.host_proc_path, pid) {
                    Ok(states) => Some(states),
                    Err(e) => {
                        debug!("Error happened when scanning net/tcp of pid {}: {}", pid, e);
                        None
                    }
                }
            });

            let socket = (
                SocketAddrV4::new(key.src_ip, key.src_port),
                SocketAddrV4::new(key.dst_ip, key.dst_port),
            );
            // A vanished process or socket means the attempt never completed.
            let event = match table.as_ref().and_then(|t| t.get(&socket)) {
                None => Event::Expired,
                Some(TcpState::Established) => Event::ToEstablished,
                Some(TcpState::SynSent | TcpState::SynRecv) => continue,
                Some(state) => {
                    debug!(
                        "Socket {} is in state {:?}, behind ESTABLISHED",
                        key, state
                    );
                    Event::FromEstablished
                }
            };

            match self.receive(&key, event) {
                Ok(Some(stats)) => ret.push(stats),
                Ok(None) => {}
                Err(e) => warn!("Error happened when receiving event: {}", e),
            }
        }
        ret
    }
}

impl Default for ConnectMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::Ipv4Addr};

    use serial_test::serial;

    use super::*;
    use crate::{
        analyzer::tcpconnect::{
            net_tcp::{
                HOST_PROC_ENV,
                tests::{tcp_line, write_tcp_table},
            },
            state_machine::State,
        },
        model::{AttrValue, Category, EventContext, FdInfo, L4Proto, ThreadInfo},
    };

    const SIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const SPORT: u16 = 40000;
    const DPORT: u16 = 80;
    const PID: u32 = 4242;
    const SEC: u64 = 1_000_000_000;

    fn key() -> ConnKey {
        ConnKey {
            src_ip: SIP,
            src_port: SPORT,
            dst_ip: DIP,
            dst_port: DPORT,
        }
    }

    fn kernel_event(name: &str, ts: u64, attrs: &[(&str, i64)]) -> RawEvent {
        let mut user_attributes: HashMap<String, AttrValue> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), AttrValue::Int(*v)))
            .collect();
        user_attributes.insert("sip".into(), AttrValue::Str(SIP.to_string()));
        user_attributes.insert("dip".into(), AttrValue::Uint(u64::from(u32::from(DIP))));
        user_attributes.insert("sport".into(), AttrValue::Uint(u64::from(SPORT)));
        user_attributes.insert("dport".into(), AttrValue::Uint(u64::from(DPORT)));
        RawEvent {
            name: name.into(),
            category: Category::Net,
            timestamp: ts,
            user_attributes,
            ..Default::default()
        }
    }

    fn syscall_event(name: &str, ts: u64, res: Option<i64>) -> RawEvent {
        let mut evt = RawEvent {
            name: name.into(),
            category: Category::Net,
            timestamp: ts,
            ctx: Some(EventContext {
                thread: Some(ThreadInfo {
                    pid: PID,
                    tid: PID,
                    comm: "curl".into(),
                    container_id: "abc123".into(),
                }),
                fd: Some(FdInfo {
                    num: 3,
                    protocol: L4Proto::Tcp,
                    role: false,
                    sip: Some(SIP),
                    dip: Some(DIP),
                    sport: SPORT,
                    dport: DPORT,
                }),
            }),
            ..Default::default()
        };
        if let Some(res) = res {
            evt.user_attributes.insert("res".into(), AttrValue::Int(res));
        }
        evt
    }

    fn tcp_connect(monitor: &mut ConnectMonitor, ts: u64, retval: i64) -> Option<ConnectionStats> {
        monitor
            .read_in_tcp_connect(&kernel_event("tcp_connect", ts, &[("retval", retval)]))
            .unwrap()
    }

    fn set_state(monitor: &mut ConnectMonitor, ts: u64, old: i64, new: i64) -> Option<ConnectionStats> {
        monitor
            .read_in_tcp_set_state(&kernel_event(
                "tcp_set_state",
                ts,
                &[("old_state", old), ("new_state", new)],
            ))
            .unwrap()
    }

    #[test]
    fn test_established_then_closed() {
        let mut monitor = ConnectMonitor::with_proc_path("/nonexistent".into());

        assert!(tcp_connect(&mut monitor, SEC, 0).is_none());
        assert_eq!(monitor.get_map_size(), 1);

        let stats = set_state(&mut monitor, SEC + 500, tcp_state::SYN_SENT, tcp_state::ESTABLISHED)
            .expect("success is emitted");
        assert_eq!(stats.state(), State::Success);
        assert_eq!(stats.connect_duration(), 500);
        assert_eq!(monitor.get_map_size(), 1);

        assert!(set_state(&mut monitor, SEC + 900, tcp_state::ESTABLISHED, tcp_state::FIN_WAIT1).is_none());
        assert_eq!(monitor.get_map_size(), 0);
    }

    #[test]
    fn test_tcp_connect_error_emits_failure() {
        let mut monitor = ConnectMonitor::with_proc_path("/nonexistent".into());
        let stats = tcp_connect(&mut monitor, SEC, -111).expect("failure is emitted");
        assert_eq!(stats.state(), State::Failure);
        assert_eq!(stats.code, -111);
    }

    #[test]
    fn test_connect_exit_classification() {
        let mut monitor = ConnectMonitor::with_proc_path("/nonexistent".into());
        tcp_connect(&mut monitor, SEC, 0);

        let in_progress = -i64::from(libc::EINPROGRESS);
        assert!(monitor
            .read_in_connect_exit_syscall(&syscall_event("connect", SEC + 10, Some(in_progress)))
            .unwrap()
            .is_none());
        let stats = monitor.get(&key()).unwrap();
        assert_eq!(stats.state(), State::Inprogress);
        assert_eq!(stats.pid, PID);
        assert_eq!(stats.comm, "curl");

        let stats = monitor
            .read_in_connect_exit_syscall(&syscall_event("connect", SEC + 20, Some(-111)))
            .unwrap()
            .expect("failure is emitted");
        assert_eq!(stats.state(), State::Failure);
        assert_eq!(stats.code, -111);
    }

    #[test]
    fn test_connect_exit_without_attempt_is_ignored() {
        let mut monitor = ConnectMonitor::with_proc_path("/nonexistent".into());
        assert!(monitor
            .read_in_connect_exit_syscall(&syscall_event("connect", SEC, Some(0)))
            .unwrap()
            .is_none());
        assert_eq!(monitor.get_map_size(), 0);
    }

    #[test]
    fn test_missing_attributes_are_errors() {
        let mut monitor = ConnectMonitor::with_proc_path("/nonexistent".into());

        let err = monitor
            .read_in_connect_exit_syscall(&syscall_event("connect", SEC, None))
            .unwrap_err();
        assert_eq!(err.to_string(), "res of connect is nil");

        let err = monitor
            .read_in_tcp_connect(&kernel_event("tcp_connect", SEC, &[]))
            .unwrap_err();
        assert_eq!(err.to_string(), "retval of tcp_connect is nil");

        let mut evt = kernel_event("tcp_connect", SEC, &[("retval", 0)]);
        evt.user_attributes.remove("dip");
        assert!(matches!(
            monitor.read_in_tcp_connect(&evt),
            Err(MonitorError::MissingTuple(_))
        ));
    }

    #[test]
    fn test_set_state_needs_established_side() {
        let mut monitor = ConnectMonitor::with_proc_path("/nonexistent".into());
        let evt = kernel_event(
            "tcp_set_state",
            SEC,
            &[("old_state", tcp_state::SYN_SENT), ("new_state", tcp_state::CLOSE)],
        );
        assert!(matches!(
            monitor.read_in_tcp_set_state(&evt),
            Err(MonitorError::NoEstablishedSide { .. })
        ));
    }

    #[test]
    fn test_send_request_marks_success() {
        let mut monitor = ConnectMonitor::with_proc_path("/nonexistent".into());
        tcp_connect(&mut monitor, SEC, 0);

        let stats = monitor
            .read_send_request_syscall(&syscall_event("write", SEC + 50, None))
            .unwrap()
            .expect("success is emitted");
        assert_eq!(stats.state(), State::Success);
        assert_eq!(stats.container_id, "abc123");

        // Redundant signals do not emit again.
        assert!(monitor
            .read_send_request_syscall(&syscall_event("write", SEC + 60, None))
            .unwrap()
            .is_none());
    }

    fn pending(monitor: &mut ConnectMonitor) {
        tcp_connect(monitor, SEC, 0);
        monitor
            .read_in_connect_exit_syscall(&syscall_event(
                "connect",
                SEC + 1,
                Some(-i64::from(libc::EINPROGRESS)),
            ))
            .unwrap();
    }

    #[test]
    fn test_trim_waits_for_events() {
        let root = tempfile::tempdir().unwrap();
        let mut monitor = ConnectMonitor::with_proc_path(root.path().to_path_buf());
        pending(&mut monitor);

        assert!(monitor.trim_connections_at(SEC + 9 * SEC, 10).is_empty());
        assert_eq!(monitor.get_map_size(), 1);
    }

    #[test]
    fn test_trim_process_gone_is_failure() {
        let root = tempfile::tempdir().unwrap();
        let mut monitor = ConnectMonitor::with_proc_path(root.path().to_path_buf());
        pending(&mut monitor);

        let emitted = monitor.trim_connections_at(SEC + 10 * SEC, 10);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].state(), State::Failure);
        assert_eq!(monitor.get_map_size(), 1);

        // The next scan closes it.
        assert!(monitor.trim_connections_at(SEC + 20 * SEC, 10).is_empty());
        assert_eq!(monitor.get_map_size(), 0);
    }

    #[test]
    fn test_trim_established_socket_is_success() {
        let root = tempfile::tempdir().unwrap();
        write_tcp_table(
            root.path(),
            PID,
            &[tcp_line(0, (SIP, SPORT), (DIP, DPORT), tcp_state::ESTABLISHED)],
        );
        let mut monitor = ConnectMonitor::with_proc_path(root.path().to_path_buf());
        pending(&mut monitor);

        let emitted = monitor.trim_connections_at(SEC + 10 * SEC, 10);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].state(), State::Success);
    }

    #[test]
    fn test_trim_leaves_handshake_pending() {
        let root = tempfile::tempdir().unwrap();
        write_tcp_table(
            root.path(),
            PID,
            &[tcp_line(0, (SIP, SPORT), (DIP, DPORT), tcp_state::SYN_SENT)],
        );
        let mut monitor = ConnectMonitor::with_proc_path(root.path().to_path_buf());
        pending(&mut monitor);

        assert!(monitor.trim_connections_at(SEC + 10 * SEC, 10).is_empty());
        assert_eq!(monitor.get(&key()).map(|s| s.state()), Some(State::Inprogress));
    }

    #[test]
    fn test_trim_socket_past_established_is_success() {
        let root = tempfile::tempdir().unwrap();
        write_tcp_table(
            root.path(),
            PID,
            &[tcp_line(0, (SIP, SPORT), (DIP, DPORT), tcp_state::CLOSE_WAIT)],
        );
        let mut monitor = ConnectMonitor::with_proc_path(root.path().to_path_buf());
        pending(&mut monitor);

        let emitted = monitor.trim_connections_at(SEC + 10 * SEC, 10);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].state(), State::Success);
    }

    #[test]
    fn test_trim_socket_missing_is_failure() {
        let root = tempfile::tempdir().unwrap();
        write_tcp_table(root.path(), PID, &[]);
        let mut monitor = ConnectMonitor::with_proc_path(root.path().to_path_buf());
        pending(&mut monitor);

        let emitted = monitor.trim_connections_at(SEC + 10 * SEC, 10);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].state(), State::Failure);
    }

    #[test]
    #[serial]
    fn test_host_proc_path_from_env() {
        let root = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var(HOST_PROC_ENV, root.path());
        }
        let monitor = ConnectMonitor::new();
        assert_eq!(monitor.host_proc_path, root.path());
        unsafe {
            std::env::remove_var(HOST_PROC_ENV);
        }
        assert_eq!(ConnectMonitor::new().host_proc_path, PathBuf::from("/proc"));
    }
}
