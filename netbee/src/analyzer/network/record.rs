//! Turns a finalized dialog into an output record.

use std::collections::HashMap;

use netbee_common::{ErrorType, gauges, groups, labels};

use super::{config::NetworkConfig, message_pair::PairState, protocol::payload_string};
use crate::model::{AttributeMap, DataGroup, RawEvent};

const NANOS_PER_MILLI: u64 = 1_000_000;

pub struct RecordBuilder {
    default_slow_threshold_ms: u64,
    slow_thresholds: HashMap<String, u64>,
}

impl RecordBuilder {
    pub fn new(cfg: &NetworkConfig) -> Self {
        let slow_thresholds = cfg
            .protocol_config
            .iter()
            .filter_map(|p| p.slow_threshold.map(|t| (p.key.clone(), t)))
            .collect();
        Self {
            default_slow_threshold_ms: cfg.response_slow_threshold_ms(),
            slow_thresholds,
        }
    }

    /// Per-protocol override if set and positive, else the global default.
    pub fn slow_threshold_ms(&self, protocol: &str) -> u64 {
        match self.slow_thresholds.get(protocol) {
            Some(t) if *t > 0 => *t,
            _ => self.default_slow_threshold_ms,
        }
    }

    pub fn is_slow(&self, duration_ns: u64, protocol: &str) -> bool {
        duration_ns >= self.slow_threshold_ms(protocol).saturating_mul(NANOS_PER_MILLI)
    }

    /// Record for a dialog that never sent a request.
    pub fn connect_fail(&self, state: &PairState, protocol: &str) -> Option<DataGroup> {
        let connects = state.connects()?;
        let evt = connects.event();

        let mut attrs = base_labels(evt);
        attrs.add_int(labels::REQUEST_TID, 0);
        attrs.add_int(labels::RESPONSE_TID, 0);
        attrs.add_str(labels::PROTOCOL, protocol);
        attrs.add_bool(labels::IS_ERROR, true);
        attrs.add_int(labels::ERROR_TYPE, ErrorType::ConnectFail.code());
        attrs.add_bool(labels::IS_SLOW, false);

        let mut record = DataGroup::new(groups::NET_REQUEST, attrs, evt.start_time());
        record.set_value(gauges::CONNECT_TIME, connects.duration() as i64);
        record.set_value(gauges::REQUEST_TOTAL_TIME, connects.duration() as i64);
        Some(record)
    }

    /// Record for a request and its response, if any. `attributes` are the
    /// fields extracted by the protocol parser and override the defaults.
    pub fn build(
        &self,
        state: &PairState,
        protocol: &str,
        attributes: &AttributeMap,
        payload_length: usize,
    ) -> Option<DataGroup> {
        let requests = state.requests()?;
        let responses = state.responses();
        let evt = requests.event();

        let slow = responses.is_some() && self.is_slow(state.duration(), protocol);

        let mut attrs = base_labels(evt);
        attrs.add_int(labels::REQUEST_TID, i64::from(evt.tid()));
        attrs.add_int(
            labels::RESPONSE_TID,
            responses.map(|r| i64::from(r.event().tid())).unwrap_or(0),
        );
        attrs.add_bool(labels::IS_ERROR, false);
        attrs.add_int(labels::ERROR_TYPE, ErrorType::NoError.code());
        attrs.add_bool(labels::IS_SLOW, slow);
        attrs.add_str(labels::PROTOCOL, protocol);

        attrs.merge(attributes);

        if let Some(resp) = responses {
            attrs.add_int(labels::END_TIMESTAMP, resp.last_timestamp() as i64);
        }
        attrs.add_str(
            labels::REQUEST_PAYLOAD,
            payload_string(requests.data(), payload_length),
        );
        attrs.add_str(
            labels::RESPONSE_PAYLOAD,
            responses
                .map(|r| payload_string(r.data(), payload_length))
                .unwrap_or_default(),
        );

        // A parser-reported error wins over the missing response.
        if !attrs.get_bool(labels::IS_ERROR) && responses.is_none() {
            attrs.add_bool(labels::IS_ERROR, true);
            attrs.add_int(labels::ERROR_TYPE, ErrorType::NoResponse.code());
        }

        if let (Some(nat), Some(_)) = (&state.nat_tuple, responses) {
            attrs.add_str(labels::DNAT_IP, nat.repl_src_ip.to_string());
            attrs.add_int(labels::DNAT_PORT, i64::from(nat.repl_src_port));
        }

        let connect_time = state.connect_duration();
        let mut record = DataGroup::new(groups::NET_REQUEST, attrs, evt.start_time());
        record.set_value(gauges::CONNECT_TIME, connect_time as i64);
        record.set_value(gauges::REQUEST_SENT_TIME, state.sent_time());
        record.set_value(gauges::WAITING_TTFB_TIME, state.waiting_time());
        record.set_value(gauges::CONTENT_DOWNLOAD_TIME, state.download_time());
        record.set_value(
            gauges::REQUEST_TOTAL_TIME,
            (connect_time + state.duration()) as i64,
        );
        record.set_value(gauges::REQUEST_IO, state.request_size());
        record.set_value(gauges::RESPONSE_IO, state.response_size());
        Some(record)
    }
}

fn base_labels(evt: &RawEvent) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    attrs.add_int(labels::PID, i64::from(evt.pid()));
    attrs.add_str(labels::COMM, evt.comm());
    attrs.add_str(
        labels::SRC_IP,
        evt.sip().map(|ip| ip.to_string()).unwrap_or_default(),
    );
    attrs.add_str(
        labels::DST_IP,
        evt.dip().map(|ip| ip.to_string()).unwrap_or_default(),
    );
    attrs.add_int(labels::SRC_PORT, i64::from(evt.sport()));
    attrs.add_int(labels::DST_PORT, i64::from(evt.dport()));
    attrs.add_str(labels::DNAT_IP, "");
    attrs.add_int(labels::DNAT_PORT, -1);
    attrs.add_str(labels::CONTAINER_ID, evt.container_id());
    attrs.add_bool(labels::IS_SERVER, evt.is_server());
    attrs
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::Arc};

    use super::*;
    use crate::{
        analyzer::{IpTranslation, network::message_pair::Phase},
        model::{Category, EventContext, FdInfo, L4Proto, ThreadInfo},
    };

    const MS: u64 = NANOS_PER_MILLI;

    fn evt(name: &str, ts: u64, latency: u64, data: &[u8], tid: u32) -> Arc<RawEvent> {
        Arc::new(RawEvent {
            name: name.into(),
            category: Category::Net,
            timestamp: ts,
            latency,
            res_val: data.len() as i64,
            data: data.to_vec(),
            ctx: Some(EventContext {
                thread: Some(ThreadInfo {
                    pid: 42,
                    tid,
                    comm: "curl".into(),
                    container_id: "abc123".into(),
                }),
                fd: Some(FdInfo {
                    num: 3,
                    protocol: L4Proto::Tcp,
                    role: false,
                    sip: Some(Ipv4Addr::new(10, 0, 0, 1)),
                    dip: Some(Ipv4Addr::new(10, 0, 0, 2)),
                    sport: 40000,
                    dport: 80,
                }),
            }),
            ..Default::default()
        })
    }

    fn builder() -> RecordBuilder {
        RecordBuilder::new(&NetworkConfig::default())
    }

    #[test]
    fn test_complete_exchange() {
        let mut state = PairState::with_phase(Phase::Connect, evt("connect", 5 * MS, 5 * MS, b"", 1), 80);
        state.merge(Phase::Request, evt("write", 10 * MS, 2 * MS, b"GET /x", 1), 80);
        state.merge(Phase::Response, evt("read", 60 * MS, 40 * MS, b"200 OK", 2), 80);

        let record = builder()
            .build(&state, "http", &AttributeMap::new(), 80)
            .unwrap();
        assert_eq!(record.name, groups::NET_REQUEST);
        assert_eq!(record.timestamp, 8 * MS);
        assert_eq!(record.value(gauges::CONNECT_TIME), Some(5 * MS as i64));
        assert_eq!(record.value(gauges::REQUEST_TOTAL_TIME), Some(57 * MS as i64));
        assert_eq!(record.value(gauges::REQUEST_IO), Some(6));
        assert_eq!(record.value(gauges::RESPONSE_IO), Some(6));
        assert!(!record.labels.get_bool(labels::IS_ERROR));
        assert!(!record.labels.get_bool(labels::IS_SLOW));
        assert_eq!(record.labels.get_int(labels::RESPONSE_TID), 2);
        assert_eq!(record.labels.get_int(labels::END_TIMESTAMP), 60 * MS as i64);
        assert_eq!(record.labels.get_str(labels::REQUEST_PAYLOAD), "GET /x");
        assert_eq!(record.labels.get_str(labels::DNAT_IP), "");
        assert_eq!(record.labels.get_int(labels::DNAT_PORT), -1);
    }

    #[test]
    fn test_no_response() {
        let state = PairState::with_phase(Phase::Request, evt("write", 10 * MS, 2 * MS, b"PING", 1), 80);
        let record = builder()
            .build(&state, "generic", &AttributeMap::new(), 80)
            .unwrap();
        assert!(record.labels.get_bool(labels::IS_ERROR));
        assert_eq!(record.labels.get_int(labels::ERROR_TYPE), ErrorType::NoResponse.code());
        assert_eq!(record.value(gauges::WAITING_TTFB_TIME), Some(-1));
        assert_eq!(record.labels.get_str(labels::RESPONSE_PAYLOAD), "");
        assert!(!record.labels.contains(labels::END_TIMESTAMP));
    }

    #[test]
    fn test_parser_error_is_kept() {
        let mut state = PairState::with_phase(Phase::Request, evt("write", 10 * MS, 0, b"GET /", 1), 80);
        state.merge(Phase::Response, evt("read", 20 * MS, 0, b"HTTP/1.1 500", 1), 80);
        let mut attrs = AttributeMap::new();
        attrs.add_bool(labels::IS_ERROR, true);
        attrs.add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.code());

        let record = builder().build(&state, "http", &attrs, 80).unwrap();
        assert_eq!(record.labels.get_int(labels::ERROR_TYPE), ErrorType::ProtocolError.code());
    }

    #[test]
    fn test_slow_threshold_override() {
        let b = builder();
        assert_eq!(b.slow_threshold_ms("http"), 500);
        assert_eq!(b.slow_threshold_ms("mysql"), 100);
        assert!(b.is_slow(100 * MS, "mysql"));
        assert!(!b.is_slow(100 * MS, "http"));
    }

    #[test]
    fn test_nat_substitution_needs_response() {
        let nat = IpTranslation {
            repl_src_ip: Ipv4Addr::new(172, 17, 0, 5),
            repl_dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            repl_src_port: 8080,
            repl_dst_port: 40000,
        };
        let mut state = PairState::with_phase(Phase::Request, evt("write", 10 * MS, 0, b"x", 1), 80);
        state.nat_tuple = Some(nat);
        let record = builder().build(&state, "generic", &AttributeMap::new(), 80).unwrap();
        assert_eq!(record.labels.get_int(labels::DNAT_PORT), -1);

        state.merge(Phase::Response, evt("read", 20 * MS, 0, b"y", 1), 80);
        let record = builder().build(&state, "generic", &AttributeMap::new(), 80).unwrap();
        assert_eq!(record.labels.get_str(labels::DNAT_IP), "172.17.0.5");
        assert_eq!(record.labels.get_int(labels::DNAT_PORT), 8080);
    }

    #[test]
    fn test_connect_fail() {
        let state = PairState::with_phase(Phase::Connect, evt("connect", 5 * MS, 3 * MS, b"", 1), 80);
        let record = builder().connect_fail(&state, "mysql").unwrap();
        assert_eq!(record.labels.get_int(labels::ERROR_TYPE), ErrorType::ConnectFail.code());
        assert_eq!(record.labels.get_str(labels::PROTOCOL), "mysql");
        assert_eq!(record.value(gauges::REQUEST_TOTAL_TIME), Some(3 * MS as i64));
        assert!(builder().build(&state, "mysql", &AttributeMap::new(), 80).is_none());
    }
}
