//! APM trace id extraction from HTTP headers.
//!
//! Header names are expected lowercased. The first propagation format
//! found wins, in the order SkyWalking, HarmonyCloud, Zipkin B3, Jaeger,
//! W3C `traceparent`, W3C `traceresponse`.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};

/// `(trace_type, trace_id)` of the first recognised header, `None` when no
/// header carries a usable id.
pub fn parse_trace_header(headers: &HashMap<String, String>) -> Option<(&'static str, String)> {
    let (kind, id) = if let Some(sw8) = headers.get("sw8") {
        ("skywalking", skywalking_trace_id(sw8)?)
    } else if let Some(id) = headers.get("apm-transactionid") {
        ("harmonycloud", id.clone())
    } else if let Some(id) = headers.get("x-b3-traceid") {
        ("zipkin", id.clone())
    } else if let Some(jaeger) = headers.get("uber-trace-id") {
        let id = match jaeger.find(':') {
            Some(pos) if pos > 0 => &jaeger[..pos],
            _ => jaeger.as_str(),
        };
        ("jaeger", id.to_string())
    } else if let Some(id) = w3c_trace_id(headers.get("traceparent")) {
        ("w3c", id)
    } else if let Some(id) = w3c_trace_id(headers.get("traceresponse")) {
        ("w3c", id)
    } else {
        return None;
    };

    if id.is_empty() { None } else { Some((kind, id)) }
}

/// `sw8` is `<sample>-<base64 trace id>-...`.
fn skywalking_trace_id(value: &str) -> Option<String> {
    let encoded = value.get(2..)?.split('-').next()?;
    let decoded = STANDARD.decode(encoded).ok()?;
    String::from_utf8(decoded).ok()
}

/// `<version>-<32 hex trace id>-...`.
fn w3c_trace_id(value: Option<&String>) -> Option<String> {
    value.and_then(|v| v.get(3..35)).map(str::to_string)
}
