use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

use netota_common::{ConnectivityError, SessionSummary, UpdateError};

pub const FIRMWARE_SHA256_HEADER: &str = "x-firmware-sha256";
pub const WIFI_SAVED_MESSAGE: &str = "Credentials saved. Restarting...";
pub const UPDATE_DONE_MESSAGE: &str = "Update successful. Restarting...";

#[derive(Debug, Deserialize)]
pub struct WifiSaveRequest {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub success: bool,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub success: bool,
    pub message: &'static str,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u32,
    pub partition: String,
    pub sha256: Option<String>,
}

impl From<SessionSummary> for UpdateResponse {
    fn from(summary: SessionSummary) -> Self {
        Self {
            success: true,
            message: UPDATE_DONE_MESSAGE,
            bytes_written: summary.bytes_written,
            partition: summary.region_label,
            sha256: summary.sha256,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TimeStatus {
    pub synced: bool,
    pub time: Option<String>,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
}

/// A clock before 2020 has not been set by SNTP yet.
pub fn time_status() -> TimeStatus {
    let now = Utc::now();
    let synced = now.year() >= 2020;
    TimeStatus {
        synced,
        time: synced.then(|| now.format("%Y-%m-%d %H:%M:%S").to_string()),
        now_epoch: now.timestamp(),
    }
}

pub fn connectivity_error_status(err: &ConnectivityError) -> u16 {
    match err {
        ConnectivityError::InvalidCredentials(_) => 400,
        _ => 500,
    }
}

pub fn update_error_status(err: &UpdateError) -> u16 {
    match err {
        UpdateError::Busy | UpdateError::NotStarted | UpdateError::NotInProgress => 409,
        UpdateError::InvalidSize { .. } | UpdateError::InvalidDigest => 400,
        UpdateError::NoTargetRegion | UpdateError::WriteError(_) | UpdateError::CommitError(_) => {
            500
        }
    }
}

/// Lengths beyond `u32` saturate so `begin` reports them as oversized.
pub fn parse_content_length(value: Option<&str>) -> Option<u32> {
    let len = value?.trim().parse::<u64>().ok()?;
    Some(u32::try_from(len).unwrap_or(u32::MAX))
}
