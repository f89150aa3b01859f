//! Apache RocketMQ remoting.
//!
//! Frame: `int32` frame length, then a 4-byte header descriptor whose first
//! byte is the serialize type and whose remaining three bytes are the header
//! length. JSON headers are plain `RemotingCommand` objects. Binary headers
//! are `code i16`, `language u8`, `version i16`, `opaque i32`, `flag i32`,
//! `remark` and `extFields` as length-prefixed blocks.
//!
//! Requests and responses are paired by `opaque`.

use std::collections::HashMap;

use serde::Deserialize;

use netbee_common::{ErrorType, labels, protocols};

use super::{PayloadMessage, ProtocolParser};

/// Frame length, header descriptor and the fixed binary header fields.
const MIN_FRAME_LEN: usize = 29;
const HEADER_OFFSET: usize = 8;

const SERIALIZE_JSON: u8 = 0;
const SERIALIZE_BINARY: u8 = 1;

#[derive(Clone)]
pub struct RocketMqParser;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotingHeader {
    #[serde(default)]
    code: i16,
    #[serde(default)]
    opaque: i32,
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    ext_fields: HashMap<String, String>,
}

impl RemotingHeader {
    fn topic(&self) -> Option<&str> {
        self.ext_fields
            .get("topic")
            .or_else(|| self.ext_fields.get("b"))
            .map(String::as_str)
    }
}

fn parse_header(msg: &PayloadMessage<'_>) -> Option<RemotingHeader> {
    if msg.len() < MIN_FRAME_LEN {
        return None;
    }
    match msg.read_u8(4)? {
        SERIALIZE_JSON => {
            let header_len = msg.read_u32_be(4)? as usize;
            let json = msg.data().get(HEADER_OFFSET..HEADER_OFFSET + header_len)?;
            serde_json::from_slice(json).ok()
        }
        SERIALIZE_BINARY => parse_binary_header(msg),
        _ => None,
    }
}

fn parse_binary_header(msg: &PayloadMessage<'_>) -> Option<RemotingHeader> {
    let data = msg.data();
    let mut header = RemotingHeader {
        code: msg.read_i16_be(8)?,
        opaque: msg.read_i32_be(13)?,
        ..Default::default()
    };

    let remark_len = msg.read_u32_be(21)? as usize;
    let ext_len = msg.read_u32_be(25)? as usize;
    let mut offset = MIN_FRAME_LEN;
    if remark_len > 0 {
        let remark = msg.get_data(offset, remark_len);
        header.remark = Some(String::from_utf8_lossy(remark).into_owned());
        offset = offset.saturating_add(remark_len);
    }

    // Only the topic is needed, so stop once it is seen.
    let ext_end = offset.saturating_add(ext_len).min(data.len());
    while offset < ext_end {
        let Some(key_len) = msg.read_u16_be(offset) else {
            break;
        };
        let key_start = offset + 2;
        let Some(key) = data.get(key_start..key_start + usize::from(key_len)) else {
            break;
        };
        let value_pos = key_start + usize::from(key_len);
        let Some(value_len) = msg.read_u32_be(value_pos) else {
            break;
        };
        let value_start = value_pos + 4;
        let Some(value) = data.get(value_start..value_start.saturating_add(value_len as usize))
        else {
            break;
        };
        let key = String::from_utf8_lossy(key).into_owned();
        let is_topic = key == "topic" || key == "b";
        header
            .ext_fields
            .insert(key, String::from_utf8_lossy(value).into_owned());
        if is_topic {
            break;
        }
        offset = value_start + value.len();
    }
    Some(header)
}

fn request_name(code: i16) -> String {
    let name = match code {
        10 => "SEND_MESSAGE",
        11 => "PULL_MESSAGE",
        12 => "QUERY_MESSAGE",
        14 => "QUERY_CONSUMER_OFFSET",
        15 => "UPDATE_CONSUMER_OFFSET",
        17 => "UPDATE_AND_CREATE_TOPIC",
        29 => "GET_MAX_OFFSET",
        30 => "GET_MIN_OFFSET",
        33 => "VIEW_MESSAGE_BY_ID",
        34 => "HEART_BEAT",
        35 => "UNREGISTER_CLIENT",
        36 => "CONSUMER_SEND_MSG_BACK",
        37 => "END_TRANSACTION",
        38 => "GET_CONSUMER_LIST_BY_GROUP",
        41 => "LOCK_BATCH_MQ",
        42 => "UNLOCK_BATCH_MQ",
        105 => "GET_ROUTEINFO_BY_TOPIC",
        106 => "GET_BROKER_CLUSTER_INFO",
        310 => "SEND_MESSAGE_V2",
        320 => "SEND_BATCH_MESSAGE",
        _ => return format!("RequestCode:{}", code),
    };
    name.to_string()
}

fn response_error(code: i16) -> Option<&'static str> {
    let name = match code {
        1 => "SYSTEM_ERROR",
        2 => "SYSTEM_BUSY",
        3 => "REQUEST_CODE_NOT_SUPPORTED",
        4 => "TRANSACTION_FAILED",
        10 => "FLUSH_DISK_TIMEOUT",
        11 => "SLAVE_NOT_AVAILABLE",
        12 => "FLUSH_SLAVE_TIMEOUT",
        13 => "MESSAGE_ILLEGAL",
        14 => "SERVICE_NOT_AVAILABLE",
        15 => "VERSION_NOT_SUPPORTED",
        16 => "NO_PERMISSION",
        17 => "TOPIC_NOT_EXIST",
        18 => "TOPIC_EXIST_ALREADY",
        19 => "PULL_NOT_FOUND",
        20 => "PULL_RETRY_IMMEDIATELY",
        21 => "PULL_OFFSET_MOVED",
        22 => "QUERY_NOT_FOUND",
        23 => "SUBSCRIPTION_PARSE_FAILED",
        24 => "SUBSCRIPTION_NOT_EXIST",
        25 => "SUBSCRIPTION_NOT_LATEST",
        26 => "SUBSCRIPTION_GROUP_NOT_EXIST",
        206 => "CONSUMER_NOT_ONLINE",
        _ => return None,
    };
    Some(name)
}

impl ProtocolParser for RocketMqParser {
    fn protocol(&self) -> &'static str {
        protocols::ROCKETMQ
    }

    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool {
        let Some(header) = parse_header(msg) else {
            return false;
        };
        let request_msg = request_name(header.code);
        let content_key = match header.topic() {
            Some(topic) => format!("Topic:{}", topic),
            None => request_msg.clone(),
        };

        msg.offset = msg.len();
        msg.attributes
            .add_str(labels::ROCKETMQ_REQUEST_MSG, request_msg);
        msg.attributes
            .add_int(labels::ROCKETMQ_OPAQUE, i64::from(header.opaque));
        msg.attributes.add_str(labels::CONTENT_KEY, content_key);
        true
    }

    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool {
        let Some(header) = parse_header(msg) else {
            return false;
        };
        if !msg.attributes.contains(labels::ROCKETMQ_OPAQUE)
            || msg.attributes.get_int(labels::ROCKETMQ_OPAQUE) != i64::from(header.opaque)
        {
            return false;
        }

        msg.offset = msg.len();
        msg.attributes
            .add_int(labels::ROCKETMQ_ERROR_CODE, i64::from(header.code));
        if header.code > 0 {
            let error_msg = match (response_error(header.code), header.remark) {
                (Some(name), _) => name.to_string(),
                (None, Some(remark)) if !remark.is_empty() => remark,
                _ => format!("error:response code is {}", header.code),
            };
            msg.attributes.add_str(labels::ROCKETMQ_ERROR_MSG, error_msg);
            msg.attributes.add_bool(labels::IS_ERROR, true);
            msg.attributes
                .add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.code());
        }
        true
    }
}
