use std::{
    fmt::Write as _,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard,
    },
};

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::{
    config::UpdateConfig,
    error::{StorageError, UpdateError},
    status::{StatusSink, SystemStatus},
    storage::{FirmwareStorage, RegionWriter},
    types::{
        progress_pct, SessionSnapshot, SessionStatus, SessionSummary, StorageRegion,
        UpdateEvent, UpdateInfo,
    },
    FIRMWARE_VERSION,
};

struct ActiveSession {
    id: u64,
    region: StorageRegion,
    expected: u32,
    written: u32,
    status: SessionStatus,
    writer: Option<Box<dyn RegionWriter>>,
    hasher: Sha256,
    expected_sha256: Option<String>,
    last_decile: u8,
}

impl ActiveSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            region: self.region.clone(),
            bytes_expected: self.expected,
            bytes_written: self.written,
            status: self.status,
        }
    }
}

/// Single-session firmware writer over two-slot storage.
///
/// The boot pointer moves only after a session wrote exactly the declared number
/// of bytes, the optional digest matched and the storage accepted the image.
pub struct UpdatePipeline<F> {
    config: UpdateConfig,
    storage: F,
    sink: Arc<dyn StatusSink>,
    session: Mutex<Option<ActiveSession>>,
    last: Mutex<Option<SessionSummary>>,
    subscribers: Mutex<Vec<Sender<UpdateEvent>>>,
    next_id: AtomicU64,
}

impl<F: FirmwareStorage> UpdatePipeline<F> {
    pub fn new(config: UpdateConfig, storage: F, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            config,
            storage,
            sink,
            session: Mutex::new(None),
            last: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn storage(&self) -> &F {
        &self.storage
    }

    pub fn begin(&self, total_size: u32) -> Result<SessionSnapshot, UpdateError> {
        self.begin_session(total_size, None)
    }

    /// Like `begin`, but `end` also requires the image SHA-256 to equal `sha256_hex`.
    pub fn begin_verified(
        &self,
        total_size: u32,
        sha256_hex: &str,
    ) -> Result<SessionSnapshot, UpdateError> {
        let normalized = normalize_digest(sha256_hex).ok_or(UpdateError::InvalidDigest)?;
        self.begin_session(total_size, Some(normalized))
    }

    fn begin_session(
        &self,
        total_size: u32,
        expected_sha256: Option<String>,
    ) -> Result<SessionSnapshot, UpdateError> {
        let mut session = self.lock_session()?;
        if session.is_some() {
            return Err(UpdateError::Busy);
        }
        if self.config.require_sha256 && expected_sha256.is_none() {
            return Err(UpdateError::InvalidDigest);
        }

        let region = self
            .storage
            .inactive_region()
            .ok_or(UpdateError::NoTargetRegion)?;
        if total_size == 0 || total_size > region.size {
            return Err(UpdateError::InvalidSize {
                size: total_size,
                capacity: region.size,
            });
        }

        self.restore_boot_region()?;
        let writer = self
            .storage
            .open(&region, total_size)
            .map_err(UpdateError::WriteError)?;

        info!(
            "writing {} byte image to partition {} at 0x{:x}",
            total_size, region.label, region.address
        );

        let active = ActiveSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            region,
            expected: total_size,
            written: 0,
            status: SessionStatus::Receiving,
            writer: Some(writer),
            hasher: Sha256::new(),
            expected_sha256,
            last_decile: 0,
        };
        let snapshot = active.snapshot();
        *session = Some(active);

        self.sink.signal(SystemStatus::UpdateInProgress);
        Ok(snapshot)
    }

    /// Appends `data` to the open session. Any failure aborts the session.
    pub fn write(&self, data: &[u8]) -> Result<u32, UpdateError> {
        let mut guard = self.lock_session()?;
        let Some(active) = guard.as_mut() else {
            return Err(UpdateError::NotStarted);
        };
        if data.is_empty() {
            return Ok(active.written);
        }

        let next = u64::from(active.written) + data.len() as u64;
        if next > u64::from(active.expected) {
            let err = StorageError::Validation(format!(
                "image exceeds declared size of {} bytes",
                active.expected
            ));
            if let Some(active) = guard.take() {
                self.abandon(active, err.to_string());
            }
            return Err(UpdateError::WriteError(err));
        }

        let result = match active.writer.as_mut() {
            Some(writer) => writer.write(data),
            None => Err(StorageError::Flash("region writer already closed".to_string())),
        };
        if let Err(err) = result {
            warn!(
                "flash write failed at offset {} of {}: {err}",
                active.written, active.expected
            );
            if let Some(active) = guard.take() {
                self.abandon(active, err.to_string());
            }
            return Err(UpdateError::WriteError(err));
        }

        active.hasher.update(data);
        active.written = next as u32;

        if let Some(decile) = crossed_decile(active.last_decile, active.written, active.expected)
        {
            active.last_decile = decile;
            info!(
                "OTA progress: {}% ({}/{} bytes)",
                decile, active.written, active.expected
            );
        }

        let event = UpdateEvent::Progress {
            written: active.written,
            expected: active.expected,
        };
        let written = active.written;
        drop(guard);

        self.publish(event);
        Ok(written)
    }

    /// Verifies and commits the open session, switching the boot region on success.
    pub fn end(&self) -> Result<SessionSummary, UpdateError> {
        let mut guard = self.lock_session()?;
        let Some(mut active) = guard.take() else {
            return Err(UpdateError::NotInProgress);
        };
        active.status = SessionStatus::Committing;

        if active.written != active.expected {
            let reason = format!(
                "incomplete image: {} of {} bytes received",
                active.written, active.expected
            );
            self.abandon(active, reason.clone());
            return Err(UpdateError::CommitError(reason));
        }

        let digest_hex = hex_digest(&active.hasher.clone().finalize());
        if let Some(expected) = active.expected_sha256.as_deref() {
            if expected != digest_hex {
                let reason = format!("sha256 mismatch (expected {expected}, got {digest_hex})");
                self.abandon(active, reason.clone());
                return Err(UpdateError::CommitError(reason));
            }
        }

        if let Some(writer) = active.writer.take() {
            if let Err(err) = writer.finalize() {
                let reason = format!("image validation failed: {err}");
                self.abandon(active, reason.clone());
                return Err(UpdateError::CommitError(reason));
            }
        }

        if let Err(err) = self.storage.set_boot_region(&active.region) {
            let reason = format!("failed to set boot partition: {err}");
            self.abandon(active, reason.clone());
            return Err(UpdateError::CommitError(reason));
        }

        active.status = SessionStatus::Complete;
        let summary = SessionSummary {
            region_label: active.region.label.clone(),
            bytes_expected: active.expected,
            bytes_written: active.written,
            status: SessionStatus::Complete,
            error: None,
            sha256: Some(digest_hex),
            finished_epoch: chrono::Utc::now().timestamp(),
        };
        self.record(summary.clone());
        drop(guard);

        info!(
            "OTA update complete: {} bytes written to {}, boot partition switched",
            summary.bytes_written, summary.region_label
        );
        self.publish(UpdateEvent::Completed {
            written: summary.bytes_written,
        });
        Ok(summary)
    }

    /// Cancels the open session. A no-op when nothing is in flight.
    pub fn abort(&self) {
        let Ok(mut guard) = self.lock_session() else {
            return;
        };
        if let Some(active) = guard.take() {
            self.abandon(active, "aborted".to_string());
        }
    }

    /// Cancels session `id` only if it is still the open one.
    pub fn abort_session(&self, id: u64) {
        let Ok(mut guard) = self.lock_session() else {
            return;
        };
        if guard.as_ref().is_some_and(|active| active.id == id) {
            if let Some(active) = guard.take() {
                self.abandon(active, "aborted".to_string());
            }
        }
    }

    pub fn firmware_version(&self) -> &'static str {
        FIRMWARE_VERSION
    }

    pub fn booted_region_label(&self) -> Option<String> {
        self.storage.booted_region().map(|region| region.label)
    }

    pub fn boot_region_label(&self) -> Option<String> {
        self.storage.boot_region().map(|region| region.label)
    }

    pub fn inactive_region(&self) -> Option<StorageRegion> {
        self.storage.inactive_region()
    }

    pub fn session(&self) -> Option<SessionSnapshot> {
        self.lock_session()
            .ok()
            .and_then(|session| session.as_ref().map(ActiveSession::snapshot))
    }

    pub fn last_session(&self) -> Option<SessionSummary> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    pub fn in_progress(&self) -> bool {
        self.session().is_some()
    }

    pub fn info(&self) -> UpdateInfo {
        let session = self.session();
        let last = self.last_session();

        UpdateInfo {
            version: self.firmware_version(),
            partition: self.booted_region_label(),
            boot_partition: self.boot_region_label(),
            free_space: self.inactive_region().map(|region| region.size),
            in_progress: session.is_some(),
            bytes_written: session
                .as_ref()
                .map(|s| s.bytes_written)
                .or_else(|| last.as_ref().map(|l| l.bytes_written))
                .unwrap_or(0),
            total_bytes: session
                .as_ref()
                .map(|s| s.bytes_expected)
                .or_else(|| last.as_ref().map(|l| l.bytes_expected)),
            progress_pct: session
                .as_ref()
                .map(SessionSnapshot::progress_pct)
                .or_else(|| {
                    last.as_ref()
                        .map(|l| progress_pct(l.bytes_written, l.bytes_expected))
                }),
            last_status: last.as_ref().map(|l| l.status.as_str()),
            last_error: last.as_ref().and_then(|l| l.error.clone()),
            last_sha256: last.as_ref().and_then(|l| l.sha256.clone()),
            last_completed_epoch: last.as_ref().map(|l| l.finished_epoch),
        }
    }

    pub fn subscribe(&self) -> Receiver<UpdateEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// A committed but not yet booted image lives in the region about to be
    /// erased, so the boot pointer goes back to the running image first.
    fn restore_boot_region(&self) -> Result<(), UpdateError> {
        let (Some(booted), Some(boot)) = (self.storage.booted_region(), self.storage.boot_region())
        else {
            return Ok(());
        };
        if booted.label == boot.label {
            return Ok(());
        }

        info!(
            "boot partition {} is about to be rewritten; pointing boot back at {}",
            boot.label, booted.label
        );
        self.storage
            .set_boot_region(&booted)
            .map_err(UpdateError::WriteError)
    }

    /// Tears down a session that will not be committed. Callers have already
    /// removed it from the slot, so this runs at most once per session.
    fn abandon(&self, mut active: ActiveSession, reason: String) {
        if let Some(writer) = active.writer.take() {
            writer.abort();
        }

        warn!(
            "OTA session on {} aborted after {}/{} bytes: {reason}",
            active.region.label, active.written, active.expected
        );

        self.record(SessionSummary {
            region_label: active.region.label.clone(),
            bytes_expected: active.expected,
            bytes_written: active.written,
            status: SessionStatus::Aborted,
            error: Some(reason),
            sha256: None,
            finished_epoch: chrono::Utc::now().timestamp(),
        });
        self.sink.signal(SystemStatus::RecoveryNeeded);
        self.publish(UpdateEvent::Aborted {
            written: active.written,
        });
    }

    fn record(&self, summary: SessionSummary) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(summary);
        }
    }

    fn publish(&self, event: UpdateEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event).is_ok());
        }
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, Option<ActiveSession>>, UpdateError> {
        self.session
            .lock()
            .map_err(|_| UpdateError::CommitError("update session lock poisoned".to_string()))
    }
}

/// Returns the new decile boundary (10, 20, ... 100) when `written` crossed one.
pub(crate) fn crossed_decile(last_decile: u8, written: u32, expected: u32) -> Option<u8> {
    let decile = progress_pct(written, expected) / 10 * 10;
    (decile > last_decile).then_some(decile)
}

fn normalize_digest(value: &str) -> Option<String> {
    let value = value.trim();
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(value.to_ascii_lowercase())
}

pub fn hex_digest(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
