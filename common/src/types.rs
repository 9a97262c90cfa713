use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ConnectivityError;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_SECRET_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    AccessPointActive,
    DualActive,
    StationConnecting,
    StationConnected,
    StationDisconnected,
    StationFailed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::AccessPointActive => "ACCESS_POINT_ACTIVE",
            Self::DualActive => "DUAL_ACTIVE",
            Self::StationConnecting => "STATION_CONNECTING",
            Self::StationConnected => "STATION_CONNECTED",
            Self::StationDisconnected => "STATION_DISCONNECTED",
            Self::StationFailed => "STATION_FAILED",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::AccessPointActive => 1,
            Self::DualActive => 2,
            Self::StationConnecting => 3,
            Self::StationConnected => 4,
            Self::StationDisconnected => 5,
            Self::StationFailed => 6,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::AccessPointActive,
            2 => Self::DualActive,
            3 => Self::StationConnecting,
            4 => Self::StationConnected,
            5 => Self::StationDisconnected,
            6 => Self::StationFailed,
            _ => Self::Idle,
        }
    }
}

/// Validated station credentials. An empty secret means an open network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: String,
    password: String,
}

impl Credentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, ConnectivityError> {
        if ssid.is_empty() {
            return Err(ConnectivityError::InvalidCredentials("ssid cannot be empty"));
        }
        if ssid.len() > MAX_SSID_LEN {
            return Err(ConnectivityError::InvalidCredentials(
                "ssid must be at most 32 bytes",
            ));
        }
        if password.len() > MAX_SECRET_LEN {
            return Err(ConnectivityError::InvalidCredentials(
                "password must be at most 64 bytes",
            ));
        }

        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StationInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Events raised by the network driver from its own execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StationStarted,
    StationDisconnected { reason: u16 },
    AddressAcquired(StationInfo),
    PeerJoined { mac: [u8; 6], aid: u16 },
    PeerLeft { mac: [u8; 6], aid: u16 },
}

/// Events published to `ConnectivityManager::subscribe` receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected(StationInfo),
    ConnectionFailed { attempts: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    AccessPointOnly,
    Dual,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub state: &'static str,
    pub connected: bool,
    pub ssid: Option<String>,
    pub ip: Option<String>,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    #[serde(rename = "apIp")]
    pub ap_ip: String,
    #[serde(rename = "apSsid")]
    pub ap_ssid: String,
    #[serde(rename = "apActive")]
    pub ap_active: bool,
    #[serde(rename = "apPeers")]
    pub ap_peers: u8,
    #[serde(rename = "retryCount")]
    pub retry_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageRegion {
    pub label: String,
    pub address: u32,
    pub size: u32,
    #[serde(rename = "booted")]
    pub is_booted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Receiving,
    Committing,
    Complete,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receiving => "RECEIVING",
            Self::Committing => "COMMITTING",
            Self::Complete => "COMPLETE",
            Self::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Distinguishes sessions on the same region; see `UpdatePipeline::abort_session`.
    pub id: u64,
    pub region: StorageRegion,
    pub bytes_expected: u32,
    pub bytes_written: u32,
    pub status: SessionStatus,
}

impl SessionSnapshot {
    pub fn progress_pct(&self) -> u8 {
        progress_pct(self.bytes_written, self.bytes_expected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub region_label: String,
    pub bytes_expected: u32,
    pub bytes_written: u32,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub sha256: Option<String>,
    pub finished_epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    Progress { written: u32, expected: u32 },
    Completed { written: u32 },
    Aborted { written: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateInfo {
    pub version: &'static str,
    pub partition: Option<String>,
    #[serde(rename = "bootPartition")]
    pub boot_partition: Option<String>,
    #[serde(rename = "freeSpace")]
    pub free_space: Option<u32>,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u32,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u32>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastStatus")]
    pub last_status: Option<&'static str>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    pub last_completed_epoch: Option<i64>,
}

pub(crate) fn progress_pct(written: u32, expected: u32) -> u8 {
    if expected == 0 {
        return 0;
    }
    ((u64::from(written) * 100) / u64::from(expected)).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_reject_empty_and_oversized_fields() {
        assert!(matches!(
            Credentials::new("", "pw"),
            Err(ConnectivityError::InvalidCredentials(_))
        ));
        assert!(Credentials::new(&"s".repeat(33), "").is_err());
        assert!(Credentials::new("home", &"p".repeat(65)).is_err());

        let creds = Credentials::new(&"s".repeat(32), &"p".repeat(64)).unwrap();
        assert_eq!(creds.ssid().len(), 32);
        assert!(!creds.is_open());
        assert!(Credentials::new("cafe", "").unwrap().is_open());
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress_pct(0, 0), 0);
        assert_eq!(progress_pct(600, 1000), 60);
        assert_eq!(progress_pct(1000, 1000), 100);
        assert_eq!(progress_pct(4_000_000_000, 1), 100);
    }
}
