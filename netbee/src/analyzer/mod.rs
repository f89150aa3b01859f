//! Event analyzers and the collaborators they talk to.
//!
//! ## Analyzers
//! - **NetworkAnalyzer**: pairs socket syscalls into request/response records
//! - **TcpConnectAnalyzer**: tracks TCP connection establishment
//!
//! Both hand every record to each configured [`Consumer`].

use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use log::warn;

use crate::model::DataGroup;

pub mod network;
pub mod tcpconnect;

/// Downstream sink for emitted records. Called synchronously; a blocking
/// consumer blocks the analyzer.
pub trait Consumer: Send + Sync {
    fn consume(&self, record: &DataGroup) -> Result<()>;
}

/// Destination-NAT translation of a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpTranslation {
    pub repl_src_ip: Ipv4Addr,
    pub repl_dst_ip: Ipv4Addr,
    pub repl_src_port: u16,
    pub repl_dst_port: u16,
}

/// Black-box conntrack lookup.
pub trait Conntracker: Send + Sync {
    fn get_dnat_tuple(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        is_udp: bool,
    ) -> Option<IpTranslation>;
}

/// Hand `record` to every consumer. Failures are logged, never propagated.
pub(crate) fn pass_through_consumers(consumers: &[Arc<dyn Consumer>], record: &DataGroup) {
    for consumer in consumers {
        if let Err(e) = consumer.consume(record) {
            warn!("Error happened while passing through consumers: {:#}", e);
        }
    }
}

/// Wall-clock nanoseconds, the clock event timestamps are expressed in.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Consumer that writes each record as one JSON line to stdout.
pub struct JsonLinesConsumer;

impl Consumer for JsonLinesConsumer {
    fn consume(&self, record: &DataGroup) -> Result<()> {
        println!("{}", serde_json::to_string(record)?);
        Ok(())
    }
}

/// In-memory collaborators for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::{net::Ipv4Addr, sync::Mutex};

    use anyhow::Result;

    use super::{Consumer, Conntracker, IpTranslation};
    use crate::model::DataGroup;

    /// Consumer that keeps every record in memory.
    #[derive(Default)]
    pub struct RecordingConsumer {
        records: Mutex<Vec<DataGroup>>,
    }

    impl RecordingConsumer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<DataGroup> {
            self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn len(&self) -> usize {
            self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl Consumer for RecordingConsumer {
        fn consume(&self, record: &DataGroup) -> Result<()> {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(record.clone());
            Ok(())
        }
    }

    /// Conntracker backed by a fixed table, keyed by the original 4-tuple.
    #[derive(Default)]
    pub struct StaticConntracker {
        entries: Vec<((Ipv4Addr, Ipv4Addr, u16, u16), IpTranslation)>,
    }

    impl StaticConntracker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_entry(
            mut self,
            tuple: (Ipv4Addr, Ipv4Addr, u16, u16),
            translation: IpTranslation,
        ) -> Self {
            self.entries.push((tuple, translation));
            self
        }
    }

    impl Conntracker for StaticConntracker {
        fn get_dnat_tuple(
            &self,
            src_ip: Ipv4Addr,
            dst_ip: Ipv4Addr,
            src_port: u16,
            dst_port: u16,
            _is_udp: bool,
        ) -> Option<IpTranslation> {
            self.entries
                .iter()
                .find(|(t, _)| *t == (src_ip, dst_ip, src_port, dst_port))
                .map(|(_, tr)| tr.clone())
        }
    }
}
