//! DNS over UDP and TCP.
//!
//! One UDP socket commonly carries several in-flight queries, so requests are
//! parsed one by one and answers are paired back by transaction id.

use std::net::Ipv4Addr;

use netbee_common::{ErrorType, labels, protocols};

use super::{PayloadMessage, ProtocolParser};
use crate::model::L4Proto;

const HEADER_SIZE: usize = 12;
const MAX_NUM_RR: u32 = 25;
const MAX_MESSAGE_SIZE: usize = 512;
const TYPE_A: u16 = 1;
const MAX_POINTER_HOPS: usize = 8;

#[derive(Clone)]
pub struct DnsParser;

struct Header {
    id: u16,
    flags: u16,
    questions: u16,
    answers: u16,
    authorities: u16,
    additionals: u16,
}

impl Header {
    fn num_rr(&self) -> u32 {
        u32::from(self.questions)
            + u32::from(self.answers)
            + u32::from(self.authorities)
            + u32::from(self.additionals)
    }
}

/// TCP messages carry a two-byte length prefix.
fn header_offset(msg: &PayloadMessage<'_>) -> usize {
    if msg.l4_proto == L4Proto::Tcp { 2 } else { 0 }
}

fn read_header(msg: &PayloadMessage<'_>, offset: usize) -> Option<Header> {
    Some(Header {
        id: msg.read_u16_be(offset)?,
        flags: msg.read_u16_be(offset + 2)?,
        questions: msg.read_u16_be(offset + 4)?,
        answers: msg.read_u16_be(offset + 6)?,
        authorities: msg.read_u16_be(offset + 8)?,
        additionals: msg.read_u16_be(offset + 10)?,
    })
}

/// Decode a possibly compressed domain name at `offset`.
///
/// Returns the dotted name and the offset just past it in the original
/// stream. `base` is where the DNS message starts, compression pointers are
/// relative to it.
fn read_domain_name(data: &[u8], base: usize, offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;
        match len {
            0 => {
                pos += 1;
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let ptr = ((l & 0x3F) << 8) | *data.get(pos + 1)? as usize;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                pos = base + ptr;
            }
            l if l & 0xC0 != 0 => return None,
            l => {
                let label = data.get(pos + 1..pos + 1 + l)?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + l;
            }
        }
    }
    Some((labels.join("."), end.unwrap_or(pos)))
}

/// Walk the question section and return the first domain plus the offset after it.
fn read_query(msg: &PayloadMessage<'_>, base: usize, count: u16) -> Option<(String, usize)> {
    let data = msg.data();
    let mut offset = base + HEADER_SIZE;
    let mut domain = String::new();
    for _ in 0..count {
        let (name, next) = read_domain_name(data, base, offset)?;
        // qtype and qclass follow the name.
        if next >= data.len() {
            return None;
        }
        if domain.is_empty() {
            domain = name;
        }
        offset = next + 4;
    }
    Some((domain, offset))
}

/// Collect the A records of the answer section. Stops at the first
/// truncated record.
fn read_ipv4_answers(msg: &PayloadMessage<'_>, mut offset: usize, count: u16) -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();
    for _ in 0..count {
        // Answer names are almost always a two-byte compression pointer.
        offset += 2;
        let Some(rtype) = msg.read_u16_be(offset) else {
            break;
        };
        // type, class, ttl
        offset += 8;
        let Some(rdlength) = msg.read_u16_be(offset) else {
            break;
        };
        offset += 2;
        if rtype == TYPE_A && rdlength == 4 {
            match msg.read_u32_be(offset) {
                Some(ip) => ips.push(Ipv4Addr::from(ip)),
                None => break,
            }
        }
        offset += rdlength as usize;
    }
    ips
}

impl ProtocolParser for DnsParser {
    fn protocol(&self) -> &'static str {
        protocols::DNS
    }

    fn multi_requests(&self) -> bool {
        true
    }

    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool {
        let base = header_offset(msg);
        if msg.len() <= base + HEADER_SIZE {
            return false;
        }
        let Some(header) = read_header(msg, base) else {
            return false;
        };
        // Queries have QR cleared.
        if header.flags & 0x8000 != 0 || header.questions == 0 || header.num_rr() > MAX_NUM_RR {
            return false;
        }
        let Some((domain, offset)) = read_query(msg, base, header.questions) else {
            return false;
        };

        msg.offset = offset;
        msg.attributes.add_int(labels::DNS_ID, i64::from(header.id));
        msg.attributes.add_str(labels::DNS_DOMAIN, domain);
        true
    }

    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool {
        let base = header_offset(msg);
        if msg.len() <= base + HEADER_SIZE || msg.len() > base + MAX_MESSAGE_SIZE {
            return false;
        }
        let Some(header) = read_header(msg, base) else {
            return false;
        };

        let qr = (header.flags >> 15) & 0x1;
        let opcode = (header.flags >> 11) & 0xF;
        let rcode = header.flags & 0xF;
        if qr == 0
            || opcode > 2
            || rcode > 5
            || header.questions == 0
            || header.num_rr() > MAX_NUM_RR
        {
            return false;
        }

        let Some((domain, offset)) = read_query(msg, base, header.questions) else {
            return false;
        };
        let ips = read_ipv4_answers(msg, offset, header.answers);

        msg.attributes.add_str(labels::DNS_DOMAIN, domain);
        if !ips.is_empty() {
            let joined: Vec<String> = ips.iter().map(Ipv4Addr::to_string).collect();
            msg.attributes.add_str(labels::DNS_IP, joined.join(","));
        }
        msg.attributes.add_int(labels::DNS_ID, i64::from(header.id));
        msg.attributes.add_int(labels::DNS_RCODE, i64::from(rcode));
        if rcode > 0 {
            msg.attributes.add_bool(labels::IS_ERROR, true);
            msg.attributes
                .add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.code());
        }
        true
    }

    fn pair_match(
        &self,
        requests: &[PayloadMessage<'_>],
        response: &PayloadMessage<'_>,
    ) -> Option<usize> {
        let id = response.attributes.get_int(labels::DNS_ID);
        requests
            .iter()
            .position(|req| req.attributes.get_int(labels::DNS_ID) == id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::AttributeMap;

    fn encode_name(out: &mut Vec<u8>, name: &str) {
        for part in name.split('.') {
            out.push(part.len() as u8);
            out.extend_from_slice(part.as_bytes());
        }
        out.push(0);
    }

    pub(crate) fn query(id: u16, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        encode_name(&mut out, name);
        out.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        out
    }

    pub(crate) fn answer(id: u16, name: &str, ip: [u8; 4], rcode: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0x81, 0x80 | rcode, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0]);
        encode_name(&mut out, name);
        out.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        // Pointer to the question name at offset 12.
        out.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C, 0x00, 0x04]);
        out.extend_from_slice(&ip);
        out
    }

    #[test]
    fn test_parse_query() {
        let data = query(0x1234, "example.com");
        let mut msg = PayloadMessage::request(&data);
        assert!(DnsParser.parse_request(&mut msg));
        assert_eq!(msg.attributes.get_int(labels::DNS_ID), 0x1234);
        assert_eq!(msg.attributes.get_str(labels::DNS_DOMAIN), "example.com");
    }

    #[test]
    fn test_parse_answer() {
        let data = answer(7, "example.com", [93, 184, 216, 34], 0);
        let mut msg = PayloadMessage::response(&data, AttributeMap::new());
        assert!(DnsParser.parse_response(&mut msg));
        assert_eq!(msg.attributes.get_str(labels::DNS_IP), "93.184.216.34");
        assert_eq!(msg.attributes.get_int(labels::DNS_RCODE), 0);
        assert!(!msg.attributes.get_bool(labels::IS_ERROR));
    }

    #[test]
    fn test_nxdomain_is_protocol_error() {
        let data = answer(7, "nope.invalid", [0, 0, 0, 0], 3);
        let mut msg = PayloadMessage::response(&data, AttributeMap::new());
        assert!(DnsParser.parse_response(&mut msg));
        assert!(msg.attributes.get_bool(labels::IS_ERROR));
        assert_eq!(msg.attributes.get_int(labels::ERROR_TYPE), 3);
    }

    #[test]
    fn test_tcp_length_prefix() {
        let body = query(9, "a.b");
        let mut data = (body.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&body);
        let mut msg = PayloadMessage::request(&data).with_l4_proto(L4Proto::Tcp);
        assert!(DnsParser.parse_request(&mut msg));
        assert_eq!(msg.attributes.get_str(labels::DNS_DOMAIN), "a.b");
    }

    #[test]
    fn test_pair_match_by_id() {
        let q1 = query(1, "one.test");
        let q2 = query(2, "two.test");
        let mut requests = vec![PayloadMessage::request(&q1), PayloadMessage::request(&q2)];
        for req in requests.iter_mut() {
            assert!(DnsParser.parse_request(req));
        }

        let a2 = answer(2, "two.test", [10, 0, 0, 2], 0);
        let mut resp = PayloadMessage::response(&a2, AttributeMap::new());
        assert!(DnsParser.parse_response(&mut resp));
        assert_eq!(DnsParser.pair_match(&requests, &resp), Some(1));

        let a3 = answer(3, "three.test", [10, 0, 0, 3], 0);
        let mut orphan = PayloadMessage::response(&a3, AttributeMap::new());
        assert!(DnsParser.parse_response(&mut orphan));
        assert_eq!(DnsParser.pair_match(&requests, &orphan), None);
    }

    #[test]
    fn test_rejects_http() {
        let mut msg = PayloadMessage::request(b"GET / HTTP/1.1\r\n\r\n");
        assert!(!DnsParser.parse_request(&mut msg));
    }
}
