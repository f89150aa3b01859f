//! Protocol resolution for finalized dialogs.
//!
//! Resolution order:
//! 1. static port mapping from configuration
//! 2. adaptive port cache, filled by repeated full-scan hits
//! 3. full scan over every discerning parser, generic last
//! 4. generic protocol-only record

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use log::debug;

use netbee_common::protocols;

use super::{
    config::NetworkConfig,
    message_pair::{PairState, Phase},
    protocol::{ParserRegistry, PayloadMessage, ProtocolParser},
    record::RecordBuilder,
};
use crate::model::{AttributeMap, DataGroup};

/// Full-scan hits on one port before the parser is cached for it.
pub const CACHE_ADD_THRESHOLD: u32 = 50;
/// Cached generic hits on one port before the cache entry is dropped.
pub const CACHE_RESET_THRESHOLD: u32 = 5000;

/// How often each resolution path produced the records of a dialog.
#[derive(Debug, Default)]
pub struct ResolutionStats {
    static_config: AtomicU64,
    cache: AtomicU64,
    full_scan: AtomicU64,
    fallback: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionCounts {
    pub static_config: u64,
    pub cache: u64,
    pub full_scan: u64,
    pub fallback: u64,
}

impl ResolutionStats {
    pub fn snapshot(&self) -> ResolutionCounts {
        ResolutionCounts {
            static_config: self.static_config.load(Ordering::Relaxed),
            cache: self.cache.load(Ordering::Relaxed),
            full_scan: self.full_scan.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
        }
    }
}

pub struct ProtocolDispatcher {
    registry: ParserRegistry,
    static_ports: HashMap<u16, String>,
    /// port -> registry indices. Read-mostly; concurrent promotions are last-write-wins.
    port_cache: DashMap<u16, Vec<usize>>,
    builder: RecordBuilder,
    stats: ResolutionStats,
}

impl ProtocolDispatcher {
    pub fn new(cfg: &NetworkConfig, registry: ParserRegistry) -> Self {
        let mut static_ports = HashMap::new();
        for protocol in &cfg.protocol_config {
            for port in &protocol.ports {
                static_ports.insert(*port, protocol.key.clone());
            }
        }
        Self {
            registry,
            static_ports,
            port_cache: DashMap::new(),
            builder: RecordBuilder::new(cfg),
            stats: ResolutionStats::default(),
        }
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ResolutionCounts {
        self.stats.snapshot()
    }

    /// Protocols currently cached for `port`, in try order.
    pub fn cached_protocols(&self, port: u16) -> Vec<&'static str> {
        self.port_cache
            .get(&port)
            .map(|idx| {
                idx.iter()
                    .filter_map(|i| self.registry.get(*i))
                    .map(|p| p.protocol())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records for one finalized dialog.
    pub fn dispatch(&self, state: &PairState) -> Vec<DataGroup> {
        let port = state.port();

        if let Some(protocol) = self.static_ports.get(&port) {
            self.stats.static_config.fetch_add(1, Ordering::Relaxed);
            if !state.has(Phase::Request) {
                return self.builder.connect_fail(state, protocol).into_iter().collect();
            }
            if let Some(idx) = self.registry.index_of(protocol) {
                if let Some(records) = self.parse_protocol(state, idx) {
                    return records;
                }
            }
            // Parser missing or not matching: keep the configured label only.
            return self.protocol_only(state, protocol);
        }

        if !state.has(Phase::Request) {
            return self
                .builder
                .connect_fail(state, protocols::GENERIC)
                .into_iter()
                .collect();
        }

        let cached = self.port_cache.get(&port).map(|v| v.value().clone());
        if let Some(cached) = cached {
            for idx in cached {
                let Some(records) = self.parse_protocol(state, idx) else {
                    continue;
                };
                self.stats.cache.fetch_add(1, Ordering::Relaxed);
                if let Some(entry) = self.registry.get(idx) {
                    if entry.protocol() == protocols::GENERIC
                        && entry.add_port_count(port) == CACHE_RESET_THRESHOLD
                    {
                        // Give the specific parsers another chance on this port.
                        entry.reset_port(port);
                        self.remove_cached(port, idx);
                    }
                }
                return records;
            }
        }

        let scan: Vec<usize> = self.registry.scan_order().collect();
        for idx in scan {
            let Some(records) = self.parse_protocol(state, idx) else {
                continue;
            };
            self.stats.full_scan.fetch_add(1, Ordering::Relaxed);
            if let Some(entry) = self.registry.get(idx) {
                if entry.add_port_count(port) == CACHE_ADD_THRESHOLD {
                    debug!("Caching protocol {} for port {}", entry.protocol(), port);
                    self.add_cached(port, idx);
                }
            }
            return records;
        }

        self.stats.fallback.fetch_add(1, Ordering::Relaxed);
        self.protocol_only(state, protocols::GENERIC)
    }

    fn add_cached(&self, port: u16, idx: usize) {
        let mut entry = self.port_cache.entry(port).or_default();
        if !entry.contains(&idx) {
            entry.push(idx);
        }
    }

    fn remove_cached(&self, port: u16, idx: usize) {
        if let Some(mut entry) = self.port_cache.get_mut(&port) {
            entry.retain(|i| *i != idx);
        }
        self.port_cache.remove_if(&port, |_, v| v.is_empty());
    }

    fn protocol_only(&self, state: &PairState, protocol: &str) -> Vec<DataGroup> {
        self.builder
            .build(
                state,
                protocol,
                &AttributeMap::new(),
                self.registry.payload_length(protocol),
            )
            .into_iter()
            .collect()
    }

    /// Records produced by one parser, `None` when it does not recognise the dialog.
    fn parse_protocol(&self, state: &PairState, idx: usize) -> Option<Vec<DataGroup>> {
        let entry = self.registry.get(idx)?;
        let parser = entry.parser();
        if parser.multi_requests() {
            return self.parse_multiple_requests(state, parser, entry.payload_length());
        }

        let requests = state.requests()?;
        let l4 = requests.event().l4_proto();
        let mut request_msg = PayloadMessage::request(requests.data()).with_l4_proto(l4);
        if !parser.parse_request(&mut request_msg) {
            return None;
        }

        let attributes = match state.responses() {
            None => request_msg.attributes,
            Some(responses) => {
                let mut response_msg =
                    PayloadMessage::response(responses.data(), request_msg.attributes)
                        .with_l4_proto(l4);
                if !parser.parse_response(&mut response_msg) {
                    return None;
                }
                response_msg.attributes
            }
        };
        let record = self.builder.build(
            state,
            parser.protocol(),
            &attributes,
            entry.payload_length(),
        )?;
        Some(vec![record])
    }

    /// Pair requests and responses of a pipelined dialog one by one.
    fn parse_multiple_requests(
        &self,
        state: &PairState,
        parser: &dyn ProtocolParser,
        payload_length: usize,
    ) -> Option<Vec<DataGroup>> {
        let requests = state.requests()?;
        let l4 = requests.event().l4_proto();
        let max = requests.max_payload_length();

        let mut parsed = Vec::with_capacity(requests.size());
        for i in 0..requests.size() {
            let req = requests.get_event(i)?;
            let mut msg = PayloadMessage::request(&req.data).with_l4_proto(l4);
            if !parser.parse_request(&mut msg) {
                return None;
            }
            parsed.push(msg);
        }

        let protocol = parser.protocol();
        let mut records = Vec::new();
        let mut matched = vec![false; parsed.len()];

        if let Some(responses) = state.responses() {
            for i in 0..responses.size() {
                let resp = responses.get_event(i)?;
                let mut msg =
                    PayloadMessage::response(&resp.data, AttributeMap::new()).with_l4_proto(l4);
                if !parser.parse_response(&mut msg) {
                    return None;
                }
                let idx = parser.pair_match(&parsed, &msg)?;
                *matched.get_mut(idx)? = true;

                let mut attributes = parsed[idx].attributes.clone();
                attributes.merge(&msg.attributes);
                let unit = PairState::single(
                    requests.get_event(idx)?,
                    Some(resp),
                    state.nat_tuple.clone(),
                    max,
                );
                records.extend(self.builder.build(&unit, protocol, &attributes, payload_length));
            }
        }

        for (idx, msg) in parsed.iter().enumerate() {
            if matched[idx] {
                continue;
            }
            let unit = PairState::single(requests.get_event(idx)?, None, state.nat_tuple.clone(), max);
            records.extend(self.builder.build(&unit, protocol, &msg.attributes, payload_length));
        }
        Some(records)
    }
}
