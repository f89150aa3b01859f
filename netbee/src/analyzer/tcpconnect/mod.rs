//! TCP connection establishment analyzer.
//!
//! The [`ConnectMonitor`] is single-owner, so all events are funnelled
//! through a bounded channel into one task that also runs the periodic
//! `/proc` reconciliation.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{debug, info};
use tokio::{sync::mpsc, task::JoinHandle};

use netbee_common::{gauges, groups, labels};

use self::{
    config::TcpConnectConfig,
    connect_monitor::{ConnectMonitor, MonitorError},
    connection_stats::ConnectionStats,
    state_machine::State,
};
use super::{Consumer, Conntracker, pass_through_consumers};
use crate::{
    model::{AttributeMap, Category, DataGroup, L4Proto, RawEvent},
    telemetry,
};

pub mod config;
pub mod connect_monitor;
pub mod connection_stats;
pub mod net_tcp;
pub mod state_machine;

/// Event names this analyzer reacts to.
pub const CONSUMABLE_EVENTS: [&str; 7] = [
    "connect",
    "tcp_connect",
    "tcp_set_state",
    "write",
    "writev",
    "sendmsg",
    "sendto",
];

pub struct TcpConnectAnalyzer {
    cfg: TcpConnectConfig,
    monitor: ConnectMonitor,
    consumers: Vec<Arc<dyn Consumer>>,
    conntracker: Option<Arc<dyn Conntracker>>,
}

/// Sending side of a running [`TcpConnectAnalyzer`]. Dropping every handle
/// stops the analyzer after a final trim.
#[derive(Clone)]
pub struct TcpConnectHandle {
    sender: mpsc::Sender<RawEvent>,
}

impl TcpConnectHandle {
    pub async fn consume_event(&self, evt: RawEvent) -> Result<()> {
        if !CONSUMABLE_EVENTS.contains(&evt.name.as_str()) {
            return Ok(());
        }
        self.sender
            .send(evt)
            .await
            .context("tcp connect analyzer has stopped")
    }
}

/// Data writes only count for established TCP sockets with a known tuple.
fn is_send_request_candidate(evt: &RawEvent) -> bool {
    evt.category == Category::Net
        && evt.thread().is_some()
        && evt
            .fd()
            .is_some_and(|fd| fd.protocol == L4Proto::Tcp && fd.sip.is_some() && fd.dip.is_some())
}

impl TcpConnectAnalyzer {
    pub fn new(
        cfg: TcpConnectConfig,
        consumers: Vec<Arc<dyn Consumer>>,
        conntracker: Option<Arc<dyn Conntracker>>,
    ) -> Self {
        Self::with_monitor(cfg, ConnectMonitor::new(), consumers, conntracker)
    }

    pub fn with_monitor(
        cfg: TcpConnectConfig,
        monitor: ConnectMonitor,
        consumers: Vec<Arc<dyn Consumer>>,
        conntracker: Option<Arc<dyn Conntracker>>,
    ) -> Self {
        Self {
            cfg,
            monitor,
            consumers,
            conntracker,
        }
    }

    /// Move the analyzer onto its own task.
    pub fn start(self) -> (TcpConnectHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(self.cfg.channel_size.max(1));
        let task = tokio::spawn(self.run(receiver));
        (TcpConnectHandle { sender }, task)
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<RawEvent>) {
        let period = Duration::from_secs(self.cfg.scan_interval_secs());
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        info!("TCP connect analyzer started, scanning /proc every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.trim_connections_with_tcp_stat(),
                evt = receiver.recv() => match evt {
                    Some(evt) => self.consume_channel_event(&evt),
                    None => {
                        // Only expired attempts are resolved; unfinished ones are dropped.
                        self.trim_connections_with_tcp_stat();
                        info!("TCP connect analyzer stopped");
                        return;
                    }
                },
            }
        }
    }

    pub fn consume_channel_event(&mut self, evt: &RawEvent) {
        let result: Result<Option<ConnectionStats>, MonitorError> = match evt.name.as_str() {
            "connect" => {
                if !evt.is_tcp() {
                    return;
                }
                self.monitor.read_in_connect_exit_syscall(evt)
            }
            "tcp_connect" => self.monitor.read_in_tcp_connect(evt),
            "tcp_set_state" => self.monitor.read_in_tcp_set_state(evt),
            "write" | "writev" | "sendmsg" | "sendto" => {
                if !is_send_request_candidate(evt) {
                    return;
                }
                self.monitor.read_send_request_syscall(evt)
            }
            _ => return,
        };

        match result {
            Ok(Some(stats)) => self.publish(&stats),
            Ok(None) => {}
            Err(e) => debug!("Cannot update connection stats: {}", e),
        }
    }

    pub fn trim_connections_with_tcp_stat(&mut self) {
        let trimmed = self
            .monitor
            .trim_connections_with_tcp_stat(self.cfg.wait_event_second);
        for stats in &trimmed {
            self.publish(stats);
        }
    }

    pub fn monitor(&self) -> &ConnectMonitor {
        &self.monitor
    }

    fn publish(&self, stats: &ConnectionStats) {
        let record = self.generate_data_group(stats);
        telemetry::record_tcp_connect(stats.state() == State::Success);
        pass_through_consumers(&self.consumers, &record);
    }

    fn generate_data_group(&self, stats: &ConnectionStats) -> DataGroup {
        let success = stats.state() == State::Success;
        let mut record = DataGroup::new(
            groups::TCP_CONNECT,
            self.generate_labels(stats, success),
            stats.end_timestamp,
        );
        record.set_value(gauges::TCP_CONNECT_TOTAL, 1);
        // Duration is only meaningful for established connections.
        if success {
            record.set_value(gauges::TCP_CONNECT_DURATION, stats.connect_duration());
        }
        record
    }

    fn generate_labels(&self, stats: &ConnectionStats, success: bool) -> AttributeMap {
        let mut attrs = AttributeMap::new();
        // Connect events always come from the client side.
        attrs.add_bool(labels::IS_SERVER, false);
        if self.cfg.need_process_info {
            attrs.add_int(labels::PID, i64::from(stats.pid));
            attrs.add_str(labels::COMM, stats.comm.as_str());
        }
        attrs.add_str(labels::CONTAINER_ID, stats.container_id.as_str());
        attrs.add_int(labels::ERRNO, stats.code);
        attrs.add_bool(labels::SUCCESS, success);

        let key = &stats.key;
        attrs.add_str(labels::SRC_IP, key.src_ip.to_string());
        attrs.add_str(labels::DST_IP, key.dst_ip.to_string());
        attrs.add_int(labels::SRC_PORT, i64::from(key.src_port));
        attrs.add_int(labels::DST_PORT, i64::from(key.dst_port));

        let dnat = self.conntracker.as_ref().and_then(|c| {
            c.get_dnat_tuple(key.src_ip, key.dst_ip, key.src_port, key.dst_port, false)
        });
        match dnat {
            Some(nat) => {
                attrs.add_str(labels::DNAT_IP, nat.repl_src_ip.to_string());
                attrs.add_int(labels::DNAT_PORT, i64::from(nat.repl_src_port));
            }
            None => {
                attrs.add_str(labels::DNAT_IP, "");
                attrs.add_int(labels::DNAT_PORT, -1);
            }
        }
        attrs
    }
}
