use netbee_common::protocols;

use super::{PayloadMessage, ProtocolParser};

/// Catch-all parser. Accepts any payload without extracting fields.
#[derive(Clone)]
pub struct GenericParser;

impl ProtocolParser for GenericParser {
    fn protocol(&self) -> &'static str {
        protocols::GENERIC
    }

    fn parse_request(&self, _msg: &mut PayloadMessage<'_>) -> bool {
        true
    }

    fn parse_response(&self, _msg: &mut PayloadMessage<'_>) -> bool {
        true
    }
}
