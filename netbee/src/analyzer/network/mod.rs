//! Request/response correlation over socket syscalls.
//!
//! Every socket event is folded into the [`MessagePairs`] of its dialog.
//! A dialog is finalized when a newer connect/request supersedes it or when
//! the idle reaper finds it untouched for `fd_reuse_timeout` seconds; the
//! finalized pair goes through the [`ProtocolDispatcher`] and every record
//! it yields is handed to the consumers.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use dashmap::{DashMap, mapref::entry::Entry};
use log::{Level, debug, info, log_enabled};

use netbee_common::{labels, protocols};

use self::{
    config::NetworkConfig,
    dispatch::{ProtocolDispatcher, ResolutionCounts},
    message_pair::{DialogKey, MessagePairs, Phase},
    protocol::ParserRegistry,
};
use super::{Consumer, Conntracker, now_nanos, pass_through_consumers};
use crate::{
    model::{Category, RawEvent},
    telemetry,
};

pub mod config;
pub mod dispatch;
pub mod message_pair;
pub mod protocol;
pub mod record;

const NANOS_PER_SEC: u64 = 1_000_000_000;
const REAPER_POLL_INTERVAL_MS: u64 = 100;

pub struct NetworkAnalyzer {
    cfg: NetworkConfig,
    dispatcher: ProtocolDispatcher,
    request_monitor: DashMap<DialogKey, Arc<MessagePairs>>,
    consumers: Vec<Arc<dyn Consumer>>,
    conntracker: Option<Arc<dyn Conntracker>>,
    tcp_pairs: AtomicI64,
    udp_pairs: AtomicI64,
    has_dns: bool,
}

impl NetworkAnalyzer {
    pub fn new(
        cfg: NetworkConfig,
        consumers: Vec<Arc<dyn Consumer>>,
        conntracker: Option<Arc<dyn Conntracker>>,
    ) -> Self {
        let registry = ParserRegistry::from_config(&cfg);
        Self::with_registry(cfg, registry, consumers, conntracker)
    }

    /// Build with an explicitly assembled parser registry.
    pub fn with_registry(
        cfg: NetworkConfig,
        registry: ParserRegistry,
        consumers: Vec<Arc<dyn Consumer>>,
        conntracker: Option<Arc<dyn Conntracker>>,
    ) -> Self {
        let has_dns = registry.has_protocol(protocols::DNS);
        info!(
            "Network analyzer ready with {} protocol parsers (dns: {})",
            registry.len(),
            has_dns
        );
        Self {
            dispatcher: ProtocolDispatcher::new(&cfg, registry),
            cfg,
            request_monitor: DashMap::new(),
            consumers,
            conntracker,
            tcp_pairs: AtomicI64::new(0),
            udp_pairs: AtomicI64::new(0),
            has_dns,
        }
    }

    /// Fold one raw event into the message pair store.
    ///
    /// Events this analyzer does not handle are dropped silently.
    pub fn consume_event(&self, evt: RawEvent) -> Result<()> {
        if evt.category != Category::Net || evt.thread().is_none() {
            return Ok(());
        }
        let Some(fd) = evt.fd() else {
            return Ok(());
        };
        if fd.sip.is_none() {
            return Ok(());
        }
        if evt.is_udp() && !self.has_dns {
            return Ok(());
        }

        if evt.is_connect() {
            self.analyse_connect(Arc::new(evt));
            return Ok(());
        }

        match evt.is_request() {
            Ok(is_request) => {
                if evt.data.is_empty() || evt.res_val < 0 {
                    return Ok(());
                }
                let evt = Arc::new(evt);
                if is_request {
                    self.analyse_request(evt);
                } else {
                    self.analyse_response(evt);
                }
            }
            Err(e) => debug!("Ignored: {}", e),
        }
        Ok(())
    }

    fn analyse_connect(&self, evt: Arc<RawEvent>) {
        let key = DialogKey::from_event(&evt);
        let max = self.cfg.max_payload_length();
        let timeout = self.cfg.connect_timeout_secs();

        let superseded = match self.request_monitor.entry(key) {
            Entry::Vacant(v) => {
                v.insert(Arc::new(MessagePairs::new(Phase::Connect, evt, max)));
                self.pair_added(&key);
                None
            }
            Entry::Occupied(mut o) => {
                let pair = Arc::clone(o.get());
                let stale = {
                    let mut state = pair.write();
                    let stale = state.has(Phase::Request)
                        || state
                            .connects()
                            .is_some_and(|c| c.is_timeout(&evt, timeout));
                    if !stale {
                        state.merge(Phase::Connect, Arc::clone(&evt), max);
                    }
                    stale
                };
                if stale {
                    o.insert(Arc::new(MessagePairs::new(Phase::Connect, evt, max)));
                    Some(pair)
                } else {
                    None
                }
            }
        };

        if let Some(old) = superseded {
            self.distribute_trace_metric(&old, true);
        }
    }

    fn analyse_request(&self, evt: Arc<RawEvent>) {
        let key = DialogKey::from_event(&evt);
        let max = self.cfg.max_payload_length();
        let timeout = self.cfg.request_timeout_secs();

        let superseded = match self.request_monitor.entry(key) {
            Entry::Vacant(v) => {
                v.insert(Arc::new(MessagePairs::new(Phase::Request, evt, max)));
                self.pair_added(&key);
                None
            }
            Entry::Occupied(mut o) => {
                let pair = Arc::clone(o.get());
                let (empty, stale) = {
                    let mut state = pair.write();
                    let empty = state.is_empty();
                    let stale = state.has(Phase::Response)
                        || state
                            .requests()
                            .is_some_and(|r| r.is_timeout(&evt, timeout));
                    if !empty && !stale {
                        state.merge(Phase::Request, Arc::clone(&evt), max);
                    }
                    (empty, stale)
                };
                if empty {
                    o.insert(Arc::new(MessagePairs::new(Phase::Request, evt, max)));
                    None
                } else if stale {
                    o.insert(Arc::new(MessagePairs::new(Phase::Request, evt, max)));
                    Some(pair)
                } else {
                    None
                }
            }
        };

        if let Some(old) = superseded {
            self.distribute_trace_metric(&old, true);
        }
    }

    fn analyse_response(&self, evt: Arc<RawEvent>) {
        let key = DialogKey::from_event(&evt);
        let Some(pair) = self.request_monitor.get(&key).map(|p| Arc::clone(p.value())) else {
            debug!("Response without a pending request on {:?}, dropped", key);
            return;
        };

        let mut state = pair.write();
        if !state.has(Phase::Request) {
            debug!("Response before any request on {:?}, dropped", key);
            return;
        }
        state.merge(Phase::Response, evt, pair.max_payload_length());
    }

    /// Publish a finalized pair. `replaced` is set when the store entry has
    /// already been overwritten by its successor.
    fn distribute_trace_metric(&self, old: &Arc<MessagePairs>, replaced: bool) {
        if !old.check_send() {
            return;
        }

        let mut state = old.snapshot();
        let Some(key) = state.key() else {
            return;
        };

        if !replaced
            && self
                .request_monitor
                .remove_if(&key, |_, v| Arc::ptr_eq(v, old))
                .is_some()
        {
            self.pair_removed(&key);
        }

        if self.cfg.enable_conntrack {
            if let (Some(conntracker), Some(evt)) = (&self.conntracker, state.first_event()) {
                if let (Some(sip), Some(dip)) = (evt.sip(), evt.dip()) {
                    state.nat_tuple = conntracker.get_dnat_tuple(
                        sip,
                        dip,
                        evt.sport(),
                        evt.dport(),
                        evt.is_udp(),
                    );
                }
            }
        }

        for record in self.dispatcher.dispatch(&state) {
            telemetry::record_parsed_request(record.labels.get_str(labels::PROTOCOL));
            if log_enabled!(Level::Debug) {
                debug!("{}", record);
            }
            pass_through_consumers(&self.consumers, &record);
        }
    }

    /// Finalize every pair whose latest phase is at least `fd_reuse_timeout`
    /// older than `now_ns`. Returns the number of pairs finalized.
    pub fn reap_idle(&self, now_ns: u64) -> usize {
        let timeout = self.cfg.fd_reuse_timeout_secs().saturating_mul(NANOS_PER_SEC);
        let idle: Vec<Arc<MessagePairs>> = self
            .request_monitor
            .iter()
            .filter(|e| now_ns.saturating_sub(e.value().timeout_ts()) >= timeout)
            .map(|e| Arc::clone(e.value()))
            .collect();

        for pair in &idle {
            self.distribute_trace_metric(pair, false);
        }
        idle.len()
    }

    /// Run [`reap_idle`](Self::reap_idle) every `reap_interval` seconds on a
    /// dedicated thread until `shutdown` is raised.
    pub fn spawn_idle_reaper(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let analyzer = Arc::clone(self);
        let interval = Duration::from_secs(self.cfg.reap_interval_secs());

        std::thread::Builder::new()
            .name("netbee-reaper".into())
            .spawn(move || {
                let mut last = Instant::now();
                while !shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(REAPER_POLL_INTERVAL_MS));
                    if last.elapsed() < interval {
                        continue;
                    }
                    last = Instant::now();
                    let reaped = analyzer.reap_idle(now_nanos());
                    if reaped > 0 {
                        debug!("Reaped {} idle message pairs", reaped);
                    }
                }
            })
            .context("Failed to spawn idle reaper")
    }

    fn pair_added(&self, key: &DialogKey) {
        let (counter, l4) = self.counter_for(key);
        counter.fetch_add(1, Ordering::Relaxed);
        telemetry::record_message_pair_size(l4, 1);
    }

    fn pair_removed(&self, key: &DialogKey) {
        let (counter, l4) = self.counter_for(key);
        counter.fetch_sub(1, Ordering::Relaxed);
        telemetry::record_message_pair_size(l4, -1);
    }

    fn counter_for(&self, key: &DialogKey) -> (&AtomicI64, &'static str) {
        if key.is_udp() {
            (&self.udp_pairs, "udp")
        } else {
            (&self.tcp_pairs, "tcp")
        }
    }

    /// Live entries in the message pair store.
    pub fn message_pair_size(&self) -> usize {
        self.request_monitor.len()
    }

    pub fn tcp_pair_count(&self) -> i64 {
        self.tcp_pairs.load(Ordering::Relaxed)
    }

    pub fn udp_pair_count(&self) -> i64 {
        self.udp_pairs.load(Ordering::Relaxed)
    }

    pub fn resolution_stats(&self) -> ResolutionCounts {
        self.dispatcher.stats()
    }

    pub fn dispatcher(&self) -> &ProtocolDispatcher {
        &self.dispatcher
    }
}
