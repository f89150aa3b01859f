use std::{collections::HashMap, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

pub use super::record::AttrValue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Unknown,
    Net,
    File,
    Process,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum L4Proto {
    #[default]
    Unknown,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub pid: u32,
    pub tid: u32,
    #[serde(default)]
    pub comm: String,
    #[serde(default)]
    pub container_id: String,
}

/// Socket described by the file descriptor the syscall operated on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdInfo {
    pub num: i32,
    #[serde(default)]
    pub protocol: L4Proto,
    /// `true` when the traced process is the server side of the socket.
    #[serde(default)]
    pub role: bool,
    pub sip: Option<Ipv4Addr>,
    pub dip: Option<Ipv4Addr>,
    #[serde(default)]
    pub sport: u16,
    #[serde(default)]
    pub dport: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    pub thread: Option<ThreadInfo>,
    pub fd: Option<FdInfo>,
}

/// Raised by [`RawEvent::is_request`] for syscalls that do not move socket data.
#[derive(Debug, thiserror::Error)]
#[error("event {0} is not a socket data event")]
pub struct NotSocketEvent(pub String);

const READ_EVENTS: [&str; 6] = ["read", "readv", "recvfrom", "recvmsg", "pread", "preadv"];
const WRITE_EVENTS: [&str; 7] = [
    "write", "writev", "sendto", "sendmsg", "sendmmsg", "pwrite", "pwritev",
];

/// One kernel-probe event. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Syscall or kernel event name, e.g. `connect`, `write`, `tcp_set_state`.
    pub name: String,
    #[serde(default)]
    pub category: Category,
    /// Exit timestamp in nanoseconds.
    pub timestamp: u64,
    /// Nanoseconds spent inside the syscall.
    #[serde(default)]
    pub latency: u64,
    #[serde(default)]
    pub res_val: i64,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub ctx: Option<EventContext>,
    #[serde(default)]
    pub user_attributes: HashMap<String, AttrValue>,
}

impl RawEvent {
    pub fn thread(&self) -> Option<&ThreadInfo> {
        self.ctx.as_ref()?.thread.as_ref()
    }

    pub fn fd(&self) -> Option<&FdInfo> {
        self.ctx.as_ref()?.fd.as_ref()
    }

    pub fn pid(&self) -> u32 {
        self.thread().map(|t| t.pid).unwrap_or(0)
    }

    pub fn tid(&self) -> u32 {
        self.thread().map(|t| t.tid).unwrap_or(0)
    }

    pub fn comm(&self) -> &str {
        self.thread().map(|t| t.comm.as_str()).unwrap_or("")
    }

    pub fn container_id(&self) -> &str {
        self.thread().map(|t| t.container_id.as_str()).unwrap_or("")
    }

    pub fn fd_num(&self) -> i32 {
        self.fd().map(|f| f.num).unwrap_or(-1)
    }

    pub fn sip(&self) -> Option<Ipv4Addr> {
        self.fd()?.sip
    }

    pub fn dip(&self) -> Option<Ipv4Addr> {
        self.fd()?.dip
    }

    pub fn sport(&self) -> u16 {
        self.fd().map(|f| f.sport).unwrap_or(0)
    }

    pub fn dport(&self) -> u16 {
        self.fd().map(|f| f.dport).unwrap_or(0)
    }

    pub fn l4_proto(&self) -> L4Proto {
        self.fd().map(|f| f.protocol).unwrap_or_default()
    }

    pub fn is_udp(&self) -> bool {
        self.l4_proto() == L4Proto::Udp
    }

    pub fn is_tcp(&self) -> bool {
        self.l4_proto() == L4Proto::Tcp
    }

    pub fn is_server(&self) -> bool {
        self.fd().map(|f| f.role).unwrap_or(false)
    }

    /// Syscall entry time.
    pub fn start_time(&self) -> u64 {
        self.timestamp.saturating_sub(self.latency)
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_connect(&self) -> bool {
        self.name == "connect"
    }

    /// Whether this data event carries the request side of a dialog.
    ///
    /// Reads are requests on the server side, writes are requests on the client side.
    pub fn is_request(&self) -> Result<bool, NotSocketEvent> {
        if self.category != Category::Net {
            return Err(NotSocketEvent(self.name.clone()));
        }
        let inbound = if READ_EVENTS.contains(&self.name.as_str()) {
            true
        } else if WRITE_EVENTS.contains(&self.name.as_str()) {
            false
        } else {
            return Err(NotSocketEvent(self.name.clone()));
        };
        let fd = self.fd().ok_or_else(|| NotSocketEvent(self.name.clone()))?;
        Ok(fd.role == inbound)
    }

    pub fn is_write(&self) -> bool {
        WRITE_EVENTS.contains(&self.name.as_str())
    }

    pub fn user_attribute(&self, key: &str) -> Option<&AttrValue> {
        self.user_attributes.get(key)
    }
}
