use serde::Deserialize;

fn default_channel_size() -> usize {
    10_000
}

fn default_wait_event_second() -> u64 {
    10
}

fn default_need_process_info() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TcpConnectConfig {
    /// Capacity of the event channel in front of the connect monitor.
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    /// Seconds an attempt may stay pending before `/proc` is consulted.
    #[serde(default = "default_wait_event_second")]
    pub wait_event_second: u64,
    /// Attach `pid` and `comm` labels to connect records.
    #[serde(default = "default_need_process_info")]
    pub need_process_info: bool,
}

impl Default for TcpConnectConfig {
    fn default() -> Self {
        Self {
            channel_size: default_channel_size(),
            wait_event_second: default_wait_event_second(),
            need_process_info: default_need_process_info(),
        }
    }
}

impl TcpConnectConfig {
    /// Period of the `/proc` reconciliation scan.
    pub fn scan_interval_secs(&self) -> u64 {
        (self.wait_event_second / 3).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_interval() {
        let mut cfg = TcpConnectConfig::default();
        assert_eq!(cfg.scan_interval_secs(), 3);
        cfg.wait_event_second = 2;
        assert_eq!(cfg.scan_interval_secs(), 1);
    }

    #[test]
    fn test_deserialize_defaults() {
        let cfg: TcpConnectConfig = serde_json::from_str(r#"{"wait_event_second": 30}"#).unwrap();
        assert_eq!(cfg.wait_event_second, 30);
        assert_eq!(cfg.channel_size, 10_000);
        assert!(cfg.need_process_info);
    }
}
