//! Per-process view of `/proc/<pid>/net/tcp`.

use std::{
    collections::HashMap,
    net::{SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
};

use procfs::{
    FromReadSI, ProcResult,
    net::{TcpNetEntries, TcpState},
};

/// Overrides the `/proc` root, e.g. when running in a container with the
/// host's procfs mounted elsewhere.
pub const HOST_PROC_ENV: &str = "HOST_PROC_PATH";
const DEFAULT_PROC_PATH: &str = "/proc";

pub fn host_proc_path() -> PathBuf {
    std::env::var_os(HOST_PROC_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROC_PATH))
}

/// Kernel state of each IPv4 socket, keyed by (local, remote).
pub type SocketStates = HashMap<(SocketAddrV4, SocketAddrV4), TcpState>;

/// Read the TCP table as seen from the network namespace of `pid`.
pub fn read_pid_tcp_states(proc_root: &Path, pid: u32) -> ProcResult<SocketStates> {
    let path = proc_root.join(pid.to_string()).join("net").join("tcp");
    let TcpNetEntries(entries) = TcpNetEntries::from_file(path, procfs::current_system_info())?;

    Ok(entries
        .into_iter()
        .filter_map(|e| match (e.local_address, e.remote_address) {
            (SocketAddr::V4(local), SocketAddr::V4(remote)) => Some(((local, remote), e.state)),
            _ => None,
        })
        .collect())
}
