//! Protocol parser capability and the explicit parser registry.
//!
//! A parser recognises one wire protocol in captured payload prefixes and
//! extracts a few identifying fields into the message's attribute map.
//! Payloads are truncated captures, so parsers must accept partial messages.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use log::warn;

use netbee_common::protocols;

use super::config::NetworkConfig;
use crate::model::{AttributeMap, L4Proto};

pub mod dns;
pub mod dubbo;
pub mod generic;
pub mod http;
pub mod kafka;
pub mod mysql;
pub mod redis;
pub mod rocketmq;
pub mod trace_header;

/// Captured payload with a read cursor and the attributes extracted so far.
#[derive(Debug, Clone)]
pub struct PayloadMessage<'a> {
    data: &'a [u8],
    pub offset: usize,
    pub attributes: AttributeMap,
    /// Transport the payload was captured on.
    pub l4_proto: L4Proto,
}

impl<'a> PayloadMessage<'a> {
    pub fn request(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            attributes: AttributeMap::new(),
            l4_proto: L4Proto::Unknown,
        }
    }

    /// Response message seeded with the attributes of its request.
    pub fn response(data: &'a [u8], attributes: AttributeMap) -> Self {
        Self {
            data,
            offset: 0,
            attributes,
            l4_proto: L4Proto::Unknown,
        }
    }

    pub fn with_l4_proto(mut self, l4_proto: L4Proto) -> Self {
        self.l4_proto = l4_proto;
        self
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn has_more_length(&self, length: usize) -> bool {
        self.offset + length <= self.data.len()
    }

    /// Up to `length` bytes from `offset`, shorter if the capture ends first.
    pub fn get_data(&self, offset: usize, length: usize) -> &'a [u8] {
        let start = offset.min(self.data.len());
        let end = offset.saturating_add(length).min(self.data.len());
        &self.data[start..end]
    }

    /// Bytes from `from` up to the next space, and the offset just past it.
    /// Without a space the rest of the capture is returned.
    pub fn read_until_blank(&self, from: usize) -> (usize, &'a [u8]) {
        self.read_until_blank_with_length(from, usize::MAX)
    }

    /// Like [`read_until_blank`](Self::read_until_blank) but looks at no more
    /// than `max_len` bytes.
    pub fn read_until_blank_with_length(&self, from: usize, max_len: usize) -> (usize, &'a [u8]) {
        let start = from.min(self.data.len());
        let end = from.saturating_add(max_len).min(self.data.len());
        match self.data[start..end].iter().position(|b| *b == b' ') {
            Some(pos) => (start + pos + 1, &self.data[start..start + pos]),
            None => (end, &self.data[start..end]),
        }
    }

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    pub fn read_u16_be(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16_be(&self, offset: usize) -> Option<i16> {
        self.read_u16_be(offset).map(|v| v as i16)
    }

    pub fn read_u32_be(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32_be(&self, offset: usize) -> Option<i32> {
        self.read_u32_be(offset).map(|v| v as i32)
    }

    pub fn read_i64_be(&self, offset: usize) -> Option<i64> {
        let b = self.data.get(offset..offset + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Some(i64::from_be_bytes(buf))
    }

    /// Little-endian unsigned integer of `size` (1..=4) bytes.
    pub fn read_uint_le(&self, offset: usize, size: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + size)?;
        Some(
            b.iter()
                .rev()
                .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)),
        )
    }
}

/// Capability every protocol parser provides.
pub trait ProtocolParser: Send + Sync {
    /// Protocol key, e.g. `http`.
    fn protocol(&self) -> &'static str;

    /// Whether one dialog can carry several independent requests that are
    /// answered out of order and must be paired by [`ProtocolParser::pair_match`].
    fn multi_requests(&self) -> bool {
        false
    }

    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool;

    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool;

    /// Index of the request answered by `response`, `None` if none matches.
    fn pair_match(
        &self,
        _requests: &[PayloadMessage<'_>],
        _response: &PayloadMessage<'_>,
    ) -> Option<usize> {
        None
    }
}

/// A registered parser and its per-port success counters.
pub struct RegisteredParser {
    parser: Box<dyn ProtocolParser>,
    port_counts: DashMap<u16, AtomicU32>,
    payload_length: usize,
    discern: bool,
}

impl RegisteredParser {
    pub fn parser(&self) -> &dyn ProtocolParser {
        self.parser.as_ref()
    }

    pub fn protocol(&self) -> &'static str {
        self.parser.protocol()
    }

    /// Increment the success counter for `port` and return the new count.
    pub fn add_port_count(&self, port: u16) -> u32 {
        self.port_counts
            .entry(port)
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    pub fn reset_port(&self, port: u16) {
        self.port_counts.remove(&port);
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length
    }
}

/// Table of parsers keyed by protocol, built once at startup.
///
/// Scan order is registration order, with the generic parser always last.
pub struct ParserRegistry {
    parsers: Vec<RegisteredParser>,
    default_payload_length: usize,
}

impl ParserRegistry {
    pub fn new(default_payload_length: usize) -> Self {
        Self {
            parsers: Vec::new(),
            default_payload_length,
        }
    }

    /// Register the enabled parsers of `cfg` plus the generic fallback.
    pub fn from_config(cfg: &NetworkConfig) -> Self {
        let mut registry = Self::new(cfg.max_payload_length());
        let overrides: HashMap<&str, _> = cfg
            .protocol_config
            .iter()
            .map(|p| (p.key.as_str(), p))
            .collect();

        for key in &cfg.protocol_parser {
            let Some(parser) = builtin_parser(key) else {
                warn!("Unknown protocol parser {}, skipped", key);
                continue;
            };
            let (payload_length, discern) = match overrides.get(key.as_str()) {
                Some(p) => (p.payload_length, !p.disable_discern),
                None => (None, true),
            };
            registry.register_with(parser, payload_length, discern);
        }
        if registry.generic_index().is_none() {
            registry.register(Box::new(generic::GenericParser));
        }
        registry
    }

    pub fn register(&mut self, parser: Box<dyn ProtocolParser>) {
        self.register_with(parser, None, true);
    }

    fn register_with(
        &mut self,
        parser: Box<dyn ProtocolParser>,
        payload_length: Option<usize>,
        discern: bool,
    ) {
        let entry = RegisteredParser {
            parser,
            port_counts: DashMap::new(),
            payload_length: payload_length
                .filter(|l| *l > 0)
                .unwrap_or(self.default_payload_length),
            discern,
        };
        if entry.protocol() == protocols::GENERIC {
            match self.generic_index() {
                Some(idx) => self.parsers[idx] = entry,
                None => self.parsers.push(entry),
            }
            return;
        }
        match self.generic_index() {
            Some(idx) => self.parsers.insert(idx, entry),
            None => self.parsers.push(entry),
        }
        if self.generic_index().is_none() {
            self.parsers.push(RegisteredParser {
                parser: Box::new(generic::GenericParser),
                port_counts: DashMap::new(),
                payload_length: self.default_payload_length,
                discern: true,
            });
        }
    }

    fn generic_index(&self) -> Option<usize> {
        self.parsers
            .iter()
            .position(|p| p.protocol() == protocols::GENERIC)
    }

    pub fn index_of(&self, protocol: &str) -> Option<usize> {
        self.parsers.iter().position(|p| p.protocol() == protocol)
    }

    pub fn get(&self, idx: usize) -> Option<&RegisteredParser> {
        self.parsers.get(idx)
    }

    pub fn has_protocol(&self, protocol: &str) -> bool {
        self.index_of(protocol).is_some()
    }

    /// Indices tried by a full scan.
    pub fn scan_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.parsers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.discern)
            .map(|(i, _)| i)
    }

    /// Payload label length for `protocol`.
    pub fn payload_length(&self, protocol: &str) -> usize {
        self.index_of(protocol)
            .and_then(|i| self.get(i))
            .map(RegisteredParser::payload_length)
            .unwrap_or(self.default_payload_length)
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

fn builtin_parser(key: &str) -> Option<Box<dyn ProtocolParser>> {
    let parser: Box<dyn ProtocolParser> = match key {
        protocols::HTTP => Box::new(http::HttpParser),
        protocols::DNS => Box::new(dns::DnsParser),
        protocols::REDIS => Box::new(redis::RedisParser),
        protocols::MYSQL => Box::new(mysql::MysqlParser),
        protocols::KAFKA => Box::new(kafka::KafkaParser),
        protocols::DUBBO => Box::new(dubbo::DubboParser),
        protocols::ROCKETMQ => Box::new(rocketmq::RocketMqParser),
        _ => return None,
    };
    Some(parser)
}

/// Printable rendering of a payload prefix, non-printable bytes shown as `.`.
pub fn payload_string(data: &[u8], max_len: usize) -> String {
    data.iter()
        .take(max_len)
        .map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            }
        })
        .collect()
}
