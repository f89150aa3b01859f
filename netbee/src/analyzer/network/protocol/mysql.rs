use netbee_common::{ErrorType, labels, protocols};

use super::{PayloadMessage, ProtocolParser};

const PACKET_HEADER_LEN: usize = 4;

const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;

const ERR_HEADER: u8 = 0xFF;
const OK_HEADER: u8 = 0x00;
const EOF_HEADER: u8 = 0xFE;

const SQL_PREFIXES: [&str; 7] = [
    "select", "insert", "update", "delete", "drop", "create", "alter",
];

// --- MySQL client/server protocol ---
#[derive(Clone)]
pub struct MysqlParser;

fn is_sql(sql: &str) -> bool {
    let lower = sql.trim_start().to_ascii_lowercase();
    SQL_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Statement shape used to group queries: the operation and the table it
/// touches, e.g. `select users`.
pub fn sql_content_key(sql: &str) -> String {
    let words: Vec<&str> = sql.split_whitespace().collect();
    let Some(op) = words.first().map(|w| w.to_ascii_lowercase()) else {
        return String::new();
    };
    let marker = match op.as_str() {
        "select" | "delete" => "from",
        "insert" => "into",
        "drop" | "create" | "alter" => "table",
        "update" => "update",
        _ => return op,
    };
    let table = words
        .iter()
        .position(|w| w.eq_ignore_ascii_case(marker))
        .and_then(|i| words.get(i + 1))
        .map(|t| t.trim_matches(|c: char| c == '`' || c == '(' || c == ';'));
    match table {
        Some(t) if !t.is_empty() => format!("{} {}", op, t),
        _ => op,
    }
}

impl ProtocolParser for MysqlParser {
    fn protocol(&self) -> &'static str {
        protocols::MYSQL
    }

    /// `int<3> length, int<1> sequence, int<1> command, string<EOF> query`
    fn parse_request(&self, msg: &mut PayloadMessage<'_>) -> bool {
        if msg.len() <= PACKET_HEADER_LEN {
            return false;
        }
        match msg.read_u8(PACKET_HEADER_LEN) {
            Some(COM_QUERY | COM_STMT_PREPARE) => {}
            _ => return false,
        }
        let raw = msg.get_data(PACKET_HEADER_LEN + 1, msg.len());
        let sql = String::from_utf8_lossy(raw);
        if !is_sql(&sql) {
            return false;
        }

        msg.offset = msg.len();
        msg.attributes.add_str(labels::CONTENT_KEY, sql_content_key(&sql));
        msg.attributes.add_str(labels::SQL, sql.into_owned());
        true
    }

    fn parse_response(&self, msg: &mut PayloadMessage<'_>) -> bool {
        if msg.len() < PACKET_HEADER_LEN + 2 {
            return false;
        }
        match msg.read_u8(PACKET_HEADER_LEN) {
            Some(ERR_HEADER) => {
                // int<1> 0xff, int<2> code, [# + 5-byte sql state], message
                let code = msg.read_uint_le(PACKET_HEADER_LEN + 1, 2).unwrap_or(0);
                let error = if msg.len() > 14 && msg.read_u8(7) == Some(b'#') {
                    format!(
                        "{}:{}",
                        String::from_utf8_lossy(msg.get_data(8, 5)),
                        String::from_utf8_lossy(msg.get_data(13, msg.len()))
                    )
                } else {
                    String::from_utf8_lossy(msg.get_data(7, msg.len())).into_owned()
                };
                msg.attributes.add_int(labels::SQL_ERROR_CODE, i64::from(code));
                msg.attributes.add_str(labels::SQL_ERROR_MSG, error);
                if code != 0 {
                    msg.attributes.add_bool(labels::IS_ERROR, true);
                    msg.attributes
                        .add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.code());
                }
                true
            }
            Some(OK_HEADER | EOF_HEADER) => true,
            // Result sets start with a column count; only trust them after a
            // recognised query.
            _ => msg.attributes.contains(labels::SQL),
        }
    }
}
