use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_connections: u8,
    pub ip: [u8; 4],
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "NetOta-Setup".to_string(),
            password: "12345678".to_string(),
            channel: 1,
            max_connections: 4,
            ip: [192, 168, 4, 1],
        }
    }
}

impl AccessPointConfig {
    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }

    pub fn sanitize(&mut self) {
        if self.ssid.trim().is_empty() || self.ssid.len() > 32 {
            self.ssid = Self::default().ssid;
        }

        // WPA2 needs 8..=63 characters; anything else falls back to an open AP.
        if !self.password.is_empty() && !(8..=63).contains(&self.password.len()) {
            self.password.clear();
        }

        self.channel = self.channel.clamp(1, 13);
        self.max_connections = self.max_connections.clamp(1, 10);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub access_point: AccessPointConfig,
    pub max_retry: u8,
    pub restart_grace_ms: u64,
    pub status_log_interval_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            access_point: AccessPointConfig::default(),
            max_retry: 5,
            restart_grace_ms: 3_000,
            status_log_interval_ms: 15_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn sanitize(&mut self) {
        self.access_point.sanitize();
        self.max_retry = self.max_retry.clamp(1, 20);
        self.restart_grace_ms = self.restart_grace_ms.clamp(500, 30_000);
        self.status_log_interval_ms = self.status_log_interval_ms.max(1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub chunk_size: usize,
    pub restart_grace_ms: u64,
    pub require_sha256: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4_096,
            restart_grace_ms: 3_000,
            require_sha256: false,
        }
    }
}

impl UpdateConfig {
    pub fn sanitize(&mut self) {
        self.chunk_size = self.chunk_size.clamp(512, 16 * 1024);
        self.restart_grace_ms = self.restart_grace_ms.clamp(500, 30_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub status_pin: i32,
    pub ap_pin: i32,
    pub fast_blink_ms: u64,
    pub slow_blink_ms: u64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            status_pin: 4,
            ap_pin: 6,
            fast_blink_ms: 200,
            slow_blink_ms: 1_000,
        }
    }
}

impl IndicatorConfig {
    pub fn sanitize(&mut self) {
        if self.status_pin < 0 {
            self.status_pin = 4;
        }
        if self.ap_pin < 0 {
            self.ap_pin = 6;
        }
        self.fast_blink_ms = self.fast_blink_ms.clamp(50, 1_000);
        self.slow_blink_ms = self.slow_blink_ms.clamp(self.fast_blink_ms, 5_000);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub connectivity: ConnectivityConfig,
    pub update: UpdateConfig,
    pub indicator: IndicatorConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.connectivity.sanitize();
        self.update.sanitize();
        self.indicator.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ap_password_falls_back_to_open_network() {
        let mut ap = AccessPointConfig {
            password: "short".to_string(),
            channel: 40,
            ..Default::default()
        };
        ap.sanitize();

        assert!(ap.is_open());
        assert_eq!(ap.channel, 13);
    }

    #[test]
    fn partial_json_keeps_indicator_defaults() {
        let raw = serde_json::json!({
            "connectivity": { "max_retry": 3 },
            "update": UpdateConfig::default(),
        });
        let config: RuntimeConfig = serde_json::from_value(raw).unwrap();

        assert_eq!(config.indicator, IndicatorConfig::default());
        assert_eq!(config.connectivity.max_retry, 3);
        assert_eq!(config.connectivity.access_point.ssid, "NetOta-Setup");
    }

    #[test]
    fn sanitize_bounds_retry_and_grace() {
        let mut config = RuntimeConfig::default();
        config.connectivity.max_retry = 0;
        config.connectivity.restart_grace_ms = 0;
        config.update.chunk_size = 1;
        config.sanitize();

        assert_eq!(config.connectivity.max_retry, 1);
        assert_eq!(config.connectivity.restart_grace_ms, 500);
        assert_eq!(config.update.chunk_size, 512);
    }
}
