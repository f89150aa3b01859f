use netbee_common::{labels, protocols};

use super::{PayloadMessage, ProtocolParser};

const MIN_REQUEST_LEN: usize = 14;
const MIN_RESPONSE_LEN: usize = 8;

/// Highest request api key in use by current brokers.
const MAX_API_KEY: i16 = 74;
const MAX_API_VERSION: i16 = 17;

// --- Kafka wire protocol ---
#[derive(Clone)]
pub struct KafkaParser;

impl ProtocolParser for KafkaParser {
    fn protocol(&self) -> &'static str {
        protocols::KAFKA
    }

    /// `int32 length, int16 api_key, int16 api_version, int32 correlation_id,
    /// nullable_string client_id`
    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool {
        if msg.len() < MIN_REQUEST_LEN {
            return false;
        }
        let (Some(length), Some(api_key), Some(api_version), Some(correlation_id), Some(client_id_len)) = (
            msg.read_i32_be(0),
            msg.read_i16_be(4),
            msg.read_i16_be(6),
            msg.read_i32_be(8),
            msg.read_i16_be(12),
        ) else {
            return false;
        };
        if length <= 8
            || !(0..=MAX_API_KEY).contains(&api_key)
            || !(0..=MAX_API_VERSION).contains(&api_version)
            || correlation_id < 0
            || client_id_len < -1
        {
            return false;
        }
        let offset = MIN_REQUEST_LEN + client_id_len.max(0) as usize;
        if msg.len() < offset {
            return false;
        }

        msg.offset = offset;
        msg.attributes.add_int(labels::KAFKA_API_KEY, i64::from(api_key));
        msg.attributes
            .add_int(labels::KAFKA_CORRELATION_ID, i64::from(correlation_id));
        true
    }

    /// `int32 length, int32 correlation_id`. Must echo the request's id.
    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool {
        if msg.len() < MIN_RESPONSE_LEN {
            return false;
        }
        let (Some(length), Some(correlation_id)) = (msg.read_i32_be(0), msg.read_i32_be(4)) else {
            return false;
        };
        if length < 4 || correlation_id < 0 {
            return false;
        }
        if msg.attributes.contains(labels::KAFKA_CORRELATION_ID)
            && msg.attributes.get_int(labels::KAFKA_CORRELATION_ID) != i64::from(correlation_id)
        {
            return false;
        }

        msg.offset = MIN_RESPONSE_LEN;
        msg.attributes
            .add_int(labels::KAFKA_CORRELATION_ID, i64::from(correlation_id));
        true
    }
}
