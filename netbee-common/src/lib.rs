#![no_std]

//! Shared vocabulary for records emitted by netbee analyzers.

/// Record group names.
pub mod groups {
    pub const NET_REQUEST: &str = "net_request_metric_group";
    pub const TCP_CONNECT: &str = "tcp_connect_metric_group";
}

/// Gauge names carried in `DataGroup::values`.
pub mod gauges {
    pub const CONNECT_TIME: &str = "connect_time";
    pub const REQUEST_SENT_TIME: &str = "request_sent_time";
    pub const WAITING_TTFB_TIME: &str = "waiting_ttfb_time";
    pub const CONTENT_DOWNLOAD_TIME: &str = "content_download_time";
    pub const REQUEST_TOTAL_TIME: &str = "request_total_time";
    pub const REQUEST_IO: &str = "request_io";
    pub const RESPONSE_IO: &str = "response_io";

    pub const TCP_CONNECT_TOTAL: &str = "tcp_connect_total";
    pub const TCP_CONNECT_DURATION: &str = "tcp_connect_duration";
}

/// Label keys.
pub mod labels {
    pub const PID: &str = "pid";
    pub const COMM: &str = "comm";
    pub const REQUEST_TID: &str = "request_tid";
    pub const RESPONSE_TID: &str = "response_tid";
    pub const SRC_IP: &str = "src_ip";
    pub const DST_IP: &str = "dst_ip";
    pub const SRC_PORT: &str = "src_port";
    pub const DST_PORT: &str = "dst_port";
    pub const DNAT_IP: &str = "dnat_ip";
    pub const DNAT_PORT: &str = "dnat_port";
    pub const CONTAINER_ID: &str = "container_id";
    pub const PROTOCOL: &str = "protocol";
    pub const IS_SERVER: &str = "is_server";
    pub const IS_SLOW: &str = "is_slow";
    pub const IS_ERROR: &str = "is_error";
    pub const ERROR_TYPE: &str = "error_type";
    pub const END_TIMESTAMP: &str = "end_timestamp";
    pub const REQUEST_PAYLOAD: &str = "request_payload";
    pub const RESPONSE_PAYLOAD: &str = "response_payload";
    pub const CONTENT_KEY: &str = "content_key";

    pub const HTTP_METHOD: &str = "http_method";
    pub const HTTP_URL: &str = "http_url";
    pub const HTTP_STATUS_CODE: &str = "http_status_code";
    pub const HTTP_RESPONSE_PAYLOAD: &str = "http_response_payload";
    pub const TRACE_TYPE: &str = "trace_type";
    pub const TRACE_ID: &str = "trace_id";

    pub const DNS_ID: &str = "dns_id";
    pub const DNS_DOMAIN: &str = "dns_domain";
    pub const DNS_IP: &str = "dns_ip";
    pub const DNS_RCODE: &str = "dns_rcode";

    pub const REDIS_COMMAND: &str = "redis_command";
    pub const REDIS_ERROR: &str = "redis_error";

    pub const SQL: &str = "sql";
    pub const SQL_ERROR_CODE: &str = "sql_error_code";
    pub const SQL_ERROR_MSG: &str = "sql_error_msg";

    pub const KAFKA_API_KEY: &str = "kafka_api_key";
    pub const KAFKA_CORRELATION_ID: &str = "kafka_correlation_id";

    pub const DUBBO_ERROR_CODE: &str = "dubbo_error_code";

    pub const ROCKETMQ_OPAQUE: &str = "rocketmq_opaque";
    pub const ROCKETMQ_REQUEST_MSG: &str = "rocketmq_request_msg";
    pub const ROCKETMQ_ERROR_CODE: &str = "rocketmq_error_code";
    pub const ROCKETMQ_ERROR_MSG: &str = "rocketmq_error_msg";

    pub const ERRNO: &str = "errno";
    pub const SUCCESS: &str = "success";
}

/// Error classification stored under `labels::ERROR_TYPE`.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    NoError = 0,
    ConnectFail = 1,
    NoResponse = 2,
    ProtocolError = 3,
}

impl ErrorType {
    pub const fn code(self) -> i64 {
        self as i64
    }
}

/// Well-known protocol keys.
pub mod protocols {
    pub const HTTP: &str = "http";
    pub const DNS: &str = "dns";
    pub const REDIS: &str = "redis";
    pub const MYSQL: &str = "mysql";
    pub const KAFKA: &str = "kafka";
    pub const DUBBO: &str = "dubbo";
    pub const ROCKETMQ: &str = "rocketmq";
    pub const GENERIC: &str = "generic";
}

/// Socket states as printed in the `st` column of `/proc/net/tcp`.
pub mod tcp_state {
    pub const ESTABLISHED: i64 = 0x01;
    pub const SYN_SENT: i64 = 0x02;
    pub const SYN_RECV: i64 = 0x03;
    pub const FIN_WAIT1: i64 = 0x04;
    pub const FIN_WAIT2: i64 = 0x05;
    pub const TIME_WAIT: i64 = 0x06;
    pub const CLOSE: i64 = 0x07;
    pub const CLOSE_WAIT: i64 = 0x08;
    pub const LAST_ACK: i64 = 0x09;
    pub const LISTEN: i64 = 0x0A;
    pub const CLOSING: i64 = 0x0B;
}
