use std::{borrow::Cow, collections::HashMap};

use log::debug;

use netbee_common::{ErrorType, labels, protocols};

use super::{PayloadMessage, ProtocolParser, payload_string, trace_header::parse_trace_header};

/// Shortest request or status line worth parsing: `GET / HTTP/1.1`.
const MIN_HTTP_LEN: usize = 14;
const MAX_HEADERS: usize = 64;
const MAX_METHOD_LEN: usize = 8;
const VERSION_LEN: usize = 9;
const STATUS_CODE_LEN: usize = 6;
const RESPONSE_PAYLOAD_LEN: usize = 80;

const HTTP_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "TRACE", "OPTIONS", "CONNECT",
];
const HTTP_VERSIONS: [&[u8]; 2] = [b"HTTP/1.0", b"HTTP/1.1"];

/// Method tails left over when a request was split right after its first
/// byte, e.g. `ET /x` from `GET /x`.
const SPLIT_METHODS: [(&[u8], &str); 1] = [(b"ET", "GET")];

// --- HTTP/1.x ---
#[derive(Clone)]
pub struct HttpParser;

/// URL without its query string, `*` when empty.
fn content_key(url: &str) -> &str {
    let path = url.split('?').next().unwrap_or("");
    if path.is_empty() { "*" } else { path }
}

fn find_pattern(data: &[u8], pattern: &[u8]) -> Option<usize> {
    data.windows(pattern.len()).position(|w| w == pattern)
}

/// Lowercased header map of a request or response. Lines cut off by the end
/// of the capture are ignored.
fn parse_headers(data: &[u8]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(line_end) = find_pattern(data, b"\r\n") else {
        return out;
    };
    let rest = &data[line_end + 2..];

    let block: Cow<'_, [u8]> = match find_pattern(rest, b"\r\n\r\n") {
        Some(end) => Cow::Borrowed(&rest[..end + 4]),
        None => match rest.windows(2).rposition(|w| w == b"\r\n") {
            Some(last) => {
                let mut owned = rest[..last + 2].to_vec();
                owned.extend_from_slice(b"\r\n");
                Cow::Owned(owned)
            }
            None => return out,
        },
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(&block, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            for h in parsed {
                out.insert(
                    h.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                );
            }
        }
        Ok(httparse::Status::Partial) => {}
        Err(e) => debug!("Unparsable HTTP headers: {}", e),
    }
    out
}

fn add_trace_attributes(msg: &mut PayloadMessage<'_>) {
    if let Some((kind, id)) = parse_trace_header(&parse_headers(msg.data())) {
        msg.attributes.add_str(labels::TRACE_TYPE, kind);
        msg.attributes.add_str(labels::TRACE_ID, id);
    }
}

impl ProtocolParser for HttpParser {
    fn protocol(&self) -> &'static str {
        protocols::HTTP
    }

    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool {
        let data = msg.data();
        if data.len() < MIN_HTTP_LEN {
            return false;
        }

        let (offset, raw_method) = msg.read_until_blank_with_length(0, MAX_METHOD_LEN);
        let method = match HTTP_METHODS.iter().find(|m| m.as_bytes() == raw_method) {
            Some(m) => *m,
            None => {
                let split_url = offset
                    .checked_sub(1)
                    .is_some_and(|i| data[i] == b' ')
                    && data.get(offset) == Some(&b'/');
                if !split_url {
                    return false;
                }
                match SPLIT_METHODS.iter().find(|(tail, _)| *tail == raw_method) {
                    Some((_, m)) => *m,
                    None => return false,
                }
            }
        };

        // The URL may run to the end of a truncated capture.
        let (_, raw_url) = msg.read_until_blank(offset);
        let url = String::from_utf8_lossy(raw_url);

        add_trace_attributes(msg);
        msg.attributes.add_str(labels::HTTP_METHOD, method);
        msg.attributes.add_str(labels::HTTP_URL, url.as_ref());
        msg.attributes.add_str(labels::CONTENT_KEY, content_key(&url));
        true
    }

    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool {
        let data = msg.data();
        if data.len() < MIN_HTTP_LEN {
            return false;
        }

        let (offset, version) = msg.read_until_blank_with_length(0, VERSION_LEN);
        let has_blank = offset.checked_sub(1).is_some_and(|i| data[i] == b' ');
        if !HTTP_VERSIONS.contains(&version) || !has_blank {
            return false;
        }

        let (_, raw_status) = msg.read_until_blank_with_length(offset, STATUS_CODE_LEN);
        let digits = raw_status
            .split(|b| !b.is_ascii_digit())
            .next()
            .unwrap_or_default();
        let Some(code) = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        else {
            return false;
        };
        let code = if (99..=999).contains(&code) { code } else { 0 };

        if !msg.attributes.contains(labels::TRACE_TYPE) {
            add_trace_attributes(msg);
        }
        msg.attributes.add_int(labels::HTTP_STATUS_CODE, code);
        msg.attributes.add_str(
            labels::HTTP_RESPONSE_PAYLOAD,
            payload_string(data, RESPONSE_PAYLOAD_LEN),
        );
        if code >= 400 {
            msg.attributes.add_bool(labels::IS_ERROR, true);
            msg.attributes
                .add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.code());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeMap;

    #[test]
    fn test_parse_request_line() {
        let mut msg = PayloadMessage::request(b"GET /api/users?id=7 HTTP/1.1\r\nHost: exa");
        assert!(HttpParser.parse_request(&mut msg));
        assert_eq!(msg.attributes.get_str(labels::HTTP_METHOD), "GET");
        assert_eq!(msg.attributes.get_str(labels::HTTP_URL), "/api/users?id=7");
        assert_eq!(msg.attributes.get_str(labels::CONTENT_KEY), "/api/users");
    }

    #[test]
    fn test_rejects_non_http() {
        let mut short = PayloadMessage::request(b"GET /x");
        assert!(!HttpParser.parse_request(&mut short));

        let mut redis = PayloadMessage::request(b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
        assert!(!HttpParser.parse_request(&mut redis));

        let mut unknown = PayloadMessage::request(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert!(!HttpParser.parse_request(&mut unknown));
    }

    #[test]
    fn test_parse_response_status() {
        let mut ok = PayloadMessage::response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n", AttributeMap::new());
        assert!(HttpParser.parse_response(&mut ok));
        assert_eq!(ok.attributes.get_int(labels::HTTP_STATUS_CODE), 200);
        assert!(!ok.attributes.contains(labels::IS_ERROR));

        let mut missing = PayloadMessage::response(b"HTTP/1.1 503 Service Unavailable\r\n", AttributeMap::new());
        assert!(HttpParser.parse_response(&mut missing));
        assert!(missing.attributes.get_bool(labels::IS_ERROR));
        assert_eq!(missing.attributes.get_int(labels::ERROR_TYPE), 3);
    }

    #[test]
    fn test_response_keeps_request_attributes() {
        let mut req = PayloadMessage::request(b"POST /orders HTTP/1.1\r\n\r\n");
        assert!(HttpParser.parse_request(&mut req));
        let mut resp = PayloadMessage::response(b"HTTP/1.0 201 Created\r\n\r\n", req.attributes);
        assert!(HttpParser.parse_response(&mut resp));
        assert_eq!(resp.attributes.get_str(labels::HTTP_METHOD), "POST");
        assert_eq!(resp.attributes.get_int(labels::HTTP_STATUS_CODE), 201);
    }

    #[test]
    fn test_truncated_url_is_accepted() {
        let mut data = b"GET /".to_vec();
        data.extend(std::iter::repeat_n(b'a', 100));
        let mut msg = PayloadMessage::request(&data);
        assert!(HttpParser.parse_request(&mut msg));
        assert_eq!(msg.attributes.get_str(labels::HTTP_METHOD), "GET");
        assert_eq!(msg.attributes.get_str(labels::HTTP_URL).len(), 101);
        assert_eq!(
            msg.attributes.get_str(labels::CONTENT_KEY),
            msg.attributes.get_str(labels::HTTP_URL)
        );
    }

    #[test]
    fn test_split_method_is_repaired() {
        let mut msg = PayloadMessage::request(b"ET /index HTTP/1.1\r\n\r\n");
        assert!(HttpParser.parse_request(&mut msg));
        assert_eq!(msg.attributes.get_str(labels::HTTP_METHOD), "GET");
        assert_eq!(msg.attributes.get_str(labels::HTTP_URL), "/index");

        let mut other = PayloadMessage::request(b"ST /index HTTP/1.1\r\n\r\n");
        assert!(!HttpParser.parse_request(&mut other));
        let mut no_slash = PayloadMessage::request(b"ET index HTTP/1.1\r\n\r\n");
        assert!(!HttpParser.parse_request(&mut no_slash));
    }

    #[test]
    fn test_trace_header_from_truncated_request() {
        let mut msg = PayloadMessage::request(
            b"GET /a HTTP/1.1\r\nHost: x\r\ntraceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01\r\nAccept: tex",
        );
        assert!(HttpParser.parse_request(&mut msg));
        assert_eq!(msg.attributes.get_str(labels::TRACE_TYPE), "w3c");
        assert_eq!(
            msg.attributes.get_str(labels::TRACE_ID),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
    }

    #[test]
    fn test_trace_header_from_response() {
        let mut req = PayloadMessage::request(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(HttpParser.parse_request(&mut req));
        assert!(!req.attributes.contains(labels::TRACE_TYPE));

        let mut resp = PayloadMessage::response(
            b"HTTP/1.1 200 OK\r\nX-B3-TraceId: 80f198ee56343ba8\r\n\r\n",
            req.attributes,
        );
        assert!(HttpParser.parse_response(&mut resp));
        assert_eq!(resp.attributes.get_str(labels::TRACE_TYPE), "zipkin");
        assert_eq!(resp.attributes.get_str(labels::TRACE_ID), "80f198ee56343ba8");
    }

    #[test]
    fn test_response_payload_and_version() {
        let mut ok = PayloadMessage::response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n", AttributeMap::new());
        assert!(HttpParser.parse_response(&mut ok));
        assert_eq!(
            ok.attributes.get_str(labels::HTTP_RESPONSE_PAYLOAD),
            "HTTP/1.1 200 OK..Content-Length: 2.."
        );

        let mut h2 = PayloadMessage::response(b"HTTP/2.0 200 OK\r\n\r\n", AttributeMap::new());
        assert!(!HttpParser.parse_response(&mut h2));

        let mut bare = PayloadMessage::response(b"HTTP/1.1 204\r\nA: b\r\n", AttributeMap::new());
        assert!(HttpParser.parse_response(&mut bare));
        assert_eq!(bare.attributes.get_int(labels::HTTP_STATUS_CODE), 204);
    }
}
