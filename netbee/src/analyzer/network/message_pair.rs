//! Phase merge model and the per-dialog message pair.
//!
//! A dialog on a reused file descriptor can see several raw events for the
//! same logical phase (Keep-Alive, pipelining, partial writes). [`Events`]
//! folds them into one bounded logical event; [`MessagePairs`] holds the
//! connect/request/response phases of one dialog behind a lock.

use std::{
    net::Ipv4Addr,
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{analyzer::IpTranslation, model::RawEvent};

/// Raw events kept per merged phase.
pub const MAX_MERGED_EVENTS: usize = 10;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Identity of a dialog in the message pair store.
///
/// A TCP fd is bound to a single peer while open. A UDP fd can address many
/// peers (DNS), so the 4-tuple is part of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogKey {
    Tcp {
        pid: u32,
        fd: i32,
    },
    Udp {
        pid: u32,
        fd: i32,
        sip: Ipv4Addr,
        dip: Ipv4Addr,
        sport: u16,
        dport: u16,
    },
}

impl DialogKey {
    pub fn from_event(evt: &RawEvent) -> Self {
        if evt.is_udp() {
            DialogKey::Udp {
                pid: evt.pid(),
                fd: evt.fd_num(),
                sip: evt.sip().unwrap_or(Ipv4Addr::UNSPECIFIED),
                dip: evt.dip().unwrap_or(Ipv4Addr::UNSPECIFIED),
                sport: evt.sport(),
                dport: evt.dport(),
            }
        } else {
            DialogKey::Tcp {
                pid: evt.pid(),
                fd: evt.fd_num(),
            }
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, DialogKey::Udp { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect = 0,
    Request = 1,
    Response = 2,
}

#[derive(Debug, Clone)]
struct MergableEvent {
    events: Vec<Arc<RawEvent>>,
    latency: u64,
    res_val: i64,
    timestamp: u64,
    data: Vec<u8>,
}

/// One logical phase: the first raw event plus an optional merge accumulator.
#[derive(Debug, Clone)]
pub struct Events {
    event: Arc<RawEvent>,
    mergable: Option<MergableEvent>,
    max_payload_length: usize,
}

impl Events {
    pub fn new(event: Arc<RawEvent>, max_payload_length: usize) -> Self {
        Self {
            event,
            mergable: None,
            max_payload_length,
        }
    }

    /// First raw event of the phase.
    pub fn event(&self) -> &RawEvent {
        &self.event
    }

    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    /// Number of raw events retained, at most [`MAX_MERGED_EVENTS`].
    pub fn size(&self) -> usize {
        self.mergable.as_ref().map(|m| m.events.len()).unwrap_or(1)
    }

    pub fn get_event(&self, index: usize) -> Option<&Arc<RawEvent>> {
        match &self.mergable {
            None if index == 0 => Some(&self.event),
            None => None,
            Some(m) => m.events.get(index),
        }
    }

    pub fn merge_event(&mut self, evt: Arc<RawEvent>) {
        let max = self.max_payload_length;
        let first = &self.event;
        let m = self.mergable.get_or_insert_with(|| {
            let keep = first.data.len().min(max);
            MergableEvent {
                events: vec![Arc::clone(first)],
                latency: first.latency,
                res_val: first.res_val,
                timestamp: first.timestamp,
                data: first.data[..keep].to_vec(),
            }
        });

        m.latency = (evt.timestamp + m.latency).saturating_sub(m.timestamp);
        m.res_val += evt.res_val;
        m.timestamp = evt.timestamp;

        let remaining = max.saturating_sub(m.data.len());
        let append = remaining.min(evt.data.len());
        m.data.extend_from_slice(&evt.data[..append]);

        if m.events.len() < MAX_MERGED_EVENTS {
            m.events.push(evt);
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.mergable {
            Some(m) => &m.data,
            None => &self.event.data,
        }
    }

    pub fn first_timestamp(&self) -> u64 {
        self.event.timestamp
    }

    pub fn last_timestamp(&self) -> u64 {
        self.mergable
            .as_ref()
            .map(|m| m.timestamp)
            .unwrap_or(self.event.timestamp)
    }

    pub fn duration(&self) -> u64 {
        self.mergable
            .as_ref()
            .map(|m| m.latency)
            .unwrap_or(self.event.latency)
    }

    pub fn res_val(&self) -> i64 {
        self.mergable
            .as_ref()
            .map(|m| m.res_val)
            .unwrap_or(self.event.res_val)
    }

    /// Stale when `new` lands past the timeout window measured from this
    /// phase's first start, or comes from another source port.
    pub fn is_timeout(&self, new: &RawEvent, timeout_secs: u64) -> bool {
        let first_start = self.event.start_time();
        if new.timestamp < first_start {
            return false;
        }
        new.timestamp - first_start > timeout_secs.saturating_mul(NANOS_PER_SEC)
            || new.sport() != self.event.sport()
    }
}

/// Phases and NAT tuple of one dialog.
#[derive(Debug, Clone, Default)]
pub struct PairState {
    phases: [Option<Events>; 3],
    pub nat_tuple: Option<IpTranslation>,
}

impl PairState {
    pub fn with_phase(phase: Phase, evt: Arc<RawEvent>, max_payload_length: usize) -> Self {
        let mut state = Self::default();
        state.phases[phase as usize] = Some(Events::new(evt, max_payload_length));
        state
    }

    /// One request and its optional response, taken out of a merged phase.
    pub fn single(
        request: &Arc<RawEvent>,
        response: Option<&Arc<RawEvent>>,
        nat_tuple: Option<IpTranslation>,
        max_payload_length: usize,
    ) -> Self {
        let mut state = Self::with_phase(Phase::Request, Arc::clone(request), max_payload_length);
        if let Some(resp) = response {
            state.phases[Phase::Response as usize] =
                Some(Events::new(Arc::clone(resp), max_payload_length));
        }
        state.nat_tuple = nat_tuple;
        state
    }

    pub fn get(&self, phase: Phase) -> Option<&Events> {
        self.phases[phase as usize].as_ref()
    }

    pub fn has(&self, phase: Phase) -> bool {
        self.phases[phase as usize].is_some()
    }

    pub fn connects(&self) -> Option<&Events> {
        self.get(Phase::Connect)
    }

    pub fn requests(&self) -> Option<&Events> {
        self.get(Phase::Request)
    }

    pub fn responses(&self) -> Option<&Events> {
        self.get(Phase::Response)
    }

    pub fn is_empty(&self) -> bool {
        self.phases.iter().all(Option::is_none)
    }

    /// Start or extend `phase` with `evt`.
    pub fn merge(&mut self, phase: Phase, evt: Arc<RawEvent>, max_payload_length: usize) {
        match &mut self.phases[phase as usize] {
            Some(events) => events.merge_event(evt),
            slot @ None => *slot = Some(Events::new(evt, max_payload_length)),
        }
    }

    /// Any event of the dialog, earliest phase first.
    pub fn first_event(&self) -> Option<&RawEvent> {
        self.phases.iter().flatten().next().map(Events::event)
    }

    pub fn key(&self) -> Option<DialogKey> {
        self.first_event().map(DialogKey::from_event)
    }

    /// Destination port used for protocol resolution.
    pub fn port(&self) -> u16 {
        [Phase::Request, Phase::Response, Phase::Connect]
            .iter()
            .find_map(|p| self.get(*p))
            .map(|e| e.event().dport())
            .unwrap_or(0)
    }

    /// Timestamp of the most recent phase activity.
    pub fn timeout_ts(&self) -> u64 {
        [Phase::Response, Phase::Request, Phase::Connect]
            .iter()
            .find_map(|p| self.get(*p))
            .map(Events::last_timestamp)
            .unwrap_or(0)
    }

    pub fn connect_duration(&self) -> u64 {
        self.connects().map(Events::duration).unwrap_or(0)
    }

    pub fn sent_time(&self) -> i64 {
        self.requests().map(|r| r.duration() as i64).unwrap_or(-1)
    }

    /// Gap between the last request byte and the first response byte.
    /// -1 when either side is absent.
    pub fn waiting_time(&self) -> i64 {
        match (self.requests(), self.responses()) {
            (Some(req), Some(resp)) => {
                resp.first_timestamp() as i64
                    - resp.event().latency as i64
                    - req.last_timestamp() as i64
            }
            _ => -1,
        }
    }

    pub fn download_time(&self) -> i64 {
        self.responses().map(|r| r.duration() as i64).unwrap_or(-1)
    }

    /// Request start to last response byte, 0 without a response.
    pub fn duration(&self) -> u64 {
        match (self.requests(), self.responses()) {
            (Some(req), Some(resp)) => resp
                .last_timestamp()
                .saturating_sub(req.event().start_time()),
            _ => 0,
        }
    }

    pub fn request_size(&self) -> i64 {
        self.requests().map(Events::res_val).unwrap_or(0)
    }

    pub fn response_size(&self) -> i64 {
        self.responses().map(Events::res_val).unwrap_or(0)
    }
}

/// Live entry of the message pair store.
#[derive(Debug)]
pub struct MessagePairs {
    state: RwLock<PairState>,
    is_send: AtomicBool,
    max_payload_length: usize,
}

impl MessagePairs {
    pub fn new(phase: Phase, evt: Arc<RawEvent>, max_payload_length: usize) -> Self {
        Self {
            state: RwLock::new(PairState::with_phase(phase, evt, max_payload_length)),
            is_send: AtomicBool::new(false),
            max_payload_length,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PairState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PairState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    pub fn merge(&self, phase: Phase, evt: Arc<RawEvent>) {
        self.write().merge(phase, evt, self.max_payload_length);
    }

    pub fn snapshot(&self) -> PairState {
        self.read().clone()
    }

    /// True for exactly one caller over the lifetime of the pair.
    pub fn check_send(&self) -> bool {
        !self.is_send.swap(true, Ordering::AcqRel)
    }

    pub fn timeout_ts(&self) -> u64 {
        self.read().timeout_ts()
    }
}
