use netbee_common::{ErrorType, labels, protocols};

use super::{PayloadMessage, ProtocolParser};

const MAX_COMMAND_LEN: usize = 20;

// --- RESP ---
#[derive(Clone)]
pub struct RedisParser;

/// Read up to the next CRLF starting at `offset`.
/// Returns the line without the terminator and the offset after it.
fn read_line<'a>(msg: &PayloadMessage<'a>, offset: usize) -> Option<(&'a [u8], usize)> {
    let data = msg.data();
    let rest = data.get(offset..)?;
    let pos = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..pos], offset + pos + 2))
}

fn read_int(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

fn is_command(word: &[u8]) -> bool {
    !word.is_empty() && word.len() <= MAX_COMMAND_LEN && word.iter().all(u8::is_ascii_alphabetic)
}

impl ProtocolParser for RedisParser {
    fn protocol(&self) -> &'static str {
        protocols::REDIS
    }

    /// Clients send commands as an array of bulk strings: `*2\r\n$3\r\nGET\r\n...`.
    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool {
        if msg.read_u8(0) != Some(b'*') {
            return false;
        }
        let Some((count, offset)) = read_line(msg, 1) else {
            return false;
        };
        if !matches!(read_int(count), Some(n) if n > 0) {
            return false;
        }
        if msg.read_u8(offset) != Some(b'$') {
            return false;
        }
        let Some((size, offset)) = read_line(msg, offset + 1) else {
            return false;
        };
        let Some(size) = read_int(size).and_then(|s| usize::try_from(s).ok()) else {
            return false;
        };
        let command = msg.get_data(offset, size);
        if command.len() != size || !is_command(command) {
            return false;
        }

        msg.offset = offset + size;
        msg.attributes.add_str(
            labels::REDIS_COMMAND,
            String::from_utf8_lossy(command).to_ascii_uppercase(),
        );
        true
    }

    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool {
        match msg.read_u8(0) {
            Some(b'+' | b'*' | b'$' | b':') => true,
            Some(b'-') => {
                let error = match read_line(msg, 1) {
                    Some((line, _)) => line,
                    None => msg.get_data(1, msg.len()),
                };
                msg.attributes
                    .add_str(labels::REDIS_ERROR, String::from_utf8_lossy(error));
                msg.attributes.add_bool(labels::IS_ERROR, true);
                msg.attributes
                    .add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.code());
                true
            }
            _ => false,
        }
    }
}
