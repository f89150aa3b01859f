//! Dubbo 2 RPC.
//!
//! Header: `0xdabb` magic, flag byte (request, two-way, event, serialization
//! id), status byte, `int64` request id, `int32` body length. Request bodies
//! start with the dubbo version, service path, service version and method
//! name, encoded by the chosen serializer.

use netbee_common::{ErrorType, labels, protocols};

use super::{PayloadMessage, ProtocolParser};

const HEADER_LEN: usize = 16;
const MAGIC: [u8; 2] = [0xDA, 0xBB];

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWOWAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIAL_MASK: u8 = 0x1F;

const SERIAL_HESSIAN2: u8 = 0x02;
const SERIAL_FASTJSON: u8 = 0x06;

const STATUS_OK: u8 = 20;

#[derive(Clone)]
pub struct DubboParser;

#[derive(Clone, Copy)]
enum Serializer {
    Hessian2,
    FastJson,
}

impl Serializer {
    fn from_id(id: u8) -> Option<Self> {
        match id {
            SERIAL_HESSIAN2 => Some(Serializer::Hessian2),
            SERIAL_FASTJSON => Some(Serializer::FastJson),
            _ => None,
        }
    }

    /// Read one string at `offset`, returning it and the offset after it.
    /// A string cut off by the capture is returned as far as it goes.
    fn read_string(self, data: &[u8], offset: usize) -> (String, usize) {
        if offset >= data.len() {
            return (String::new(), data.len());
        }
        let (start, len) = match self {
            Serializer::Hessian2 => {
                let tag = data[offset];
                if (0x30..=0x33).contains(&tag) {
                    let Some(low) = data.get(offset + 1) else {
                        return (String::new(), data.len());
                    };
                    (offset + 2, (usize::from(tag - 0x30) << 8) + usize::from(*low))
                } else {
                    (offset + 1, usize::from(tag))
                }
            }
            Serializer::FastJson => {
                // "value"\n
                let Some(open) = data[offset..].iter().position(|b| *b == b'"') else {
                    return (String::new(), data.len());
                };
                let start = offset + open + 1;
                let tail = data.get(start..).unwrap_or_default();
                let len = tail.iter().position(|b| *b == b'"').unwrap_or(tail.len());
                let value = String::from_utf8_lossy(&tail[..len]).into_owned();
                // closing quote and newline
                return (value, (start + len + 2).min(data.len()));
            }
        };
        let end = (start + len).min(data.len());
        let value = String::from_utf8_lossy(&data[start.min(end)..end]).into_owned();
        (value, end)
    }
}

/// `service#method` for two-way calls, a fixed marker for other frames,
/// `None` for anything that is not a request.
fn content_key(data: &[u8]) -> Option<String> {
    let flag = data[2];
    let serial_id = flag & SERIAL_MASK;
    if serial_id == 0 {
        return None;
    }
    if flag & FLAG_EVENT != 0 {
        return Some("Heartbeat".to_string());
    }
    if flag & FLAG_REQUEST == 0 {
        return None;
    }
    if flag & FLAG_TWOWAY == 0 {
        return Some("Oneway".to_string());
    }
    let Some(serializer) = Serializer::from_id(serial_id) else {
        return Some("UnSupportSerialFormat".to_string());
    };

    let (_version, offset) = serializer.read_string(data, HEADER_LEN);
    let (service, offset) = serializer.read_string(data, offset);
    let (_service_version, offset) = serializer.read_string(data, offset);
    let (method, _) = serializer.read_string(data, offset);
    Some(format!("{}#{}", service, method))
}

fn has_header(msg: &PayloadMessage<'_>) -> bool {
    msg.len() >= HEADER_LEN && msg.get_data(0, 2) == MAGIC
}

impl ProtocolParser for DubboParser {
    fn protocol(&self) -> &'static str {
        protocols::DUBBO
    }

    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool {
        if !has_header(msg) {
            return false;
        }
        let Some(key) = content_key(msg.data()) else {
            return false;
        };
        msg.offset = HEADER_LEN;
        msg.attributes.add_str(labels::CONTENT_KEY, key);
        true
    }

    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool {
        if !has_header(msg) {
            return false;
        }
        let data = msg.data();
        let flag = data[2];
        if flag & SERIAL_MASK == 0 {
            return false;
        }
        let status = if flag & FLAG_EVENT != 0 {
            STATUS_OK
        } else if flag & FLAG_REQUEST != 0 {
            return false;
        } else {
            data[3]
        };

        msg.offset = HEADER_LEN;
        msg.attributes
            .add_int(labels::DUBBO_ERROR_CODE, i64::from(status));
        if status > STATUS_OK {
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

    fn hessian_str(out: &mut Vec<u8>, s: &str) {
        out.push(s.len() as u8);
        out.extend_from_slice(s.as_bytes());
    }

    fn request() -> Vec<u8> {
        let mut out = vec![0xDA, 0xBB, FLAG_REQUEST | FLAG_TWOWAY | SERIAL_HESSIAN2, 0];
        out.extend_from_slice(&1i64.to_be_bytes());
        out.extend_from_slice(&100i32.to_be_bytes());
        hessian_str(&mut out, "2.0.2");
        hessian_str(&mut out, "org.demo.GreetingService");
        hessian_str(&mut out, "0.0.0");
        hessian_str(&mut out, "sayHello");
        out
    }

    fn response(status: u8) -> Vec<u8> {
        let mut out = vec![0xDA, 0xBB, SERIAL_HESSIAN2, status];
        out.extend_from_slice(&1i64.to_be_bytes());
        out.extend_from_slice(&4i32.to_be_bytes());
        out.extend_from_slice(&[0x91, 0x05, b'h', b'i']);
        out
    }

    #[test]
    fn test_request_content_key() {
        let data = request();
        let mut msg = PayloadMessage::request(&data);
        assert!(DubboParser.parse_request(&mut msg));
        assert_eq!(
            msg.attributes.get_str(labels::CONTENT_KEY),
            "org.demo.GreetingService#sayHello"
        );
    }

    #[test]
    fn test_fastjson_content_key() {
        let mut data = vec![0xDA, 0xBB, FLAG_REQUEST | FLAG_TWOWAY | SERIAL_FASTJSON, 0];
        data.extend_from_slice(&[0; 12]);
        data.extend_from_slice(b"\"2.0.2\"\n\"a.B\"\n\"1.0\"\n\"call\"\n");
        assert_eq!(content_key(&data).as_deref(), Some("a.B#call"));
    }

    #[test]
    fn test_response_status() {
        let ok = response(20);
        let mut msg = PayloadMessage::response(&ok, AttributeMap::new());
        assert!(DubboParser.parse_response(&mut msg));
        assert_eq!(msg.attributes.get_int(labels::DUBBO_ERROR_CODE), 20);
        assert!(!msg.attributes.get_bool(labels::IS_ERROR));

        let timeout = response(31);
        let mut msg = PayloadMessage::response(&timeout, AttributeMap::new());
        assert!(DubboParser.parse_response(&mut msg));
        assert!(msg.attributes.get_bool(labels::IS_ERROR));
    }

    #[test]
    fn test_request_frame_is_not_a_response() {
        let data = request();
        let mut msg = PayloadMessage::response(&data, AttributeMap::new());
        assert!(!DubboParser.parse_response(&mut msg));
    }
}
