use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Mutex,
};

use serde::Serialize;

/// Discrete indicator signals emitted by the connectivity and update managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    NetworkOff,
    NetworkConnected,
    UpdateInProgress,
    RecoveryNeeded,
}

impl SystemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkOff => "NETWORK_OFF",
            Self::NetworkConnected => "NETWORK_CONNECTED",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::RecoveryNeeded => "RECOVERY_NEEDED",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::NetworkOff => 0,
            Self::NetworkConnected => 1,
            Self::UpdateInProgress => 2,
            Self::RecoveryNeeded => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::NetworkConnected,
            2 => Self::UpdateInProgress,
            3 => Self::RecoveryNeeded,
            _ => Self::NetworkOff,
        }
    }

    pub fn pattern(self, fast_blink_ms: u64, slow_blink_ms: u64) -> IndicatorPattern {
        match self {
            Self::NetworkOff => IndicatorPattern::Off,
            Self::NetworkConnected => IndicatorPattern::Solid,
            Self::UpdateInProgress => IndicatorPattern::Blink {
                period_ms: fast_blink_ms,
            },
            Self::RecoveryNeeded => IndicatorPattern::Blink {
                period_ms: slow_blink_ms,
            },
        }
    }
}

/// Observer of status transitions. Implementations must not call back into the managers.
pub trait StatusSink: Send + Sync {
    fn signal(&self, status: SystemStatus);

    fn access_point(&self, _active: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorPattern {
    Off,
    Solid,
    Blink { period_ms: u64 },
}

impl IndicatorPattern {
    pub fn level_at(self, now_ms: u64) -> bool {
        match self {
            Self::Off => false,
            Self::Solid => true,
            Self::Blink { period_ms } => (now_ms / period_ms.max(1)) % 2 == 0,
        }
    }
}

/// Last-signal-wins sink read by the indicator loop.
#[derive(Debug)]
pub struct SharedStatus {
    status: AtomicU8,
    ap_active: AtomicBool,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(SystemStatus::NetworkOff.to_u8()),
            ap_active: AtomicBool::new(false),
        }
    }
}

impl SharedStatus {
    pub fn current(&self) -> SystemStatus {
        SystemStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn ap_active(&self) -> bool {
        self.ap_active.load(Ordering::Acquire)
    }
}

impl StatusSink for SharedStatus {
    fn signal(&self, status: SystemStatus) {
        let previous = self.status.swap(status.to_u8(), Ordering::AcqRel);
        if previous != status.to_u8() {
            log::info!("system status changed to {}", status.as_str());
        }
    }

    fn access_point(&self, active: bool) {
        if self.ap_active.swap(active, Ordering::AcqRel) != active {
            log::info!("AP mode {}", if active { "ACTIVE" } else { "INACTIVE" });
        }
    }
}

/// Sink that keeps every signal, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    signals: Mutex<Vec<SystemStatus>>,
}

impl RecordingSink {
    pub fn signals(&self) -> Vec<SystemStatus> {
        self.signals
            .lock()
            .map(|signals| signals.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, status: SystemStatus) -> usize {
        self.signals().iter().filter(|s| **s == status).count()
    }
}

impl StatusSink for RecordingSink {
    fn signal(&self, status: SystemStatus) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(status);
        }
    }
}

/// Fans one signal out to several sinks.
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn StatusSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn StatusSink>>) -> Self {
        Self { sinks }
    }
}

impl StatusSink for FanoutSink {
    fn signal(&self, status: SystemStatus) {
        for sink in &self.sinks {
            sink.signal(status);
        }
    }

    fn access_point(&self, active: bool) {
        for sink in &self.sinks {
            sink.access_point(active);
        }
    }
}
