//! In-memory stand-ins for the radio, the flash and the restart hook.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    config::AccessPointConfig,
    connectivity::{LinkEventHandler, NetworkDriver, Restarter},
    error::{ConnectivityError, StorageError},
    storage::{FirmwareStorage, RegionWriter},
    types::{Credentials, LinkEvent, StorageRegion},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Initialize,
    StartAccessPoint { ssid: String },
    StartDual { ssid: String },
    RequestConnect,
}

/// Scripted driver: records every call and delivers events only when `inject` is called.
#[derive(Default)]
pub struct SimulatedDriver {
    handler: Mutex<Option<LinkEventHandler>>,
    calls: Mutex<Vec<DriverCall>>,
    init_count: AtomicUsize,
    fail_access_point: AtomicBool,
    fail_dual: AtomicBool,
}

impl SimulatedDriver {
    /// Delivers `event` to the registered handler. Returns false before `initialize`.
    pub fn inject(&self, event: LinkEvent) -> bool {
        let handler = self.handler.lock().ok().and_then(|handler| handler.clone());
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    pub fn set_fail_access_point(&self, fail: bool) {
        self.fail_access_point.store(fail, Ordering::Release);
    }

    pub fn set_fail_dual(&self, fail: bool) {
        self.fail_dual.store(fail, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn connect_requests(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == DriverCall::RequestConnect)
            .count()
    }

    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::Acquire)
    }

    fn record(&self, call: DriverCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl NetworkDriver for SimulatedDriver {
    fn initialize(&self, handler: LinkEventHandler) -> Result<(), ConnectivityError> {
        let mut slot = self
            .handler
            .lock()
            .map_err(|_| ConnectivityError::Driver("handler lock poisoned".to_string()))?;
        *slot = Some(handler);
        self.init_count.fetch_add(1, Ordering::AcqRel);
        self.record(DriverCall::Initialize);
        Ok(())
    }

    fn start_access_point(&self, ap: &AccessPointConfig) -> Result<(), ConnectivityError> {
        self.record(DriverCall::StartAccessPoint {
            ssid: ap.ssid.clone(),
        });
        if self.fail_access_point.load(Ordering::Acquire) {
            return Err(ConnectivityError::Driver("access point start failed".to_string()));
        }
        Ok(())
    }

    fn start_dual(
        &self,
        _ap: &AccessPointConfig,
        credentials: &Credentials,
    ) -> Result<(), ConnectivityError> {
        self.record(DriverCall::StartDual {
            ssid: credentials.ssid().to_string(),
        });
        if self.fail_dual.load(Ordering::Acquire) {
            return Err(ConnectivityError::Driver("wifi start failed".to_string()));
        }
        Ok(())
    }

    fn request_connect(&self) -> Result<(), ConnectivityError> {
        self.record(DriverCall::RequestConnect);
        Ok(())
    }
}

/// Records restart requests instead of restarting.
#[derive(Debug, Default)]
pub struct RecordingRestarter {
    requests: Mutex<Vec<Duration>>,
}

impl RecordingRestarter {
    pub fn requests(&self) -> Vec<Duration> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Restarter for RecordingRestarter {
    fn schedule_restart(&self, after: Duration) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(after);
        }
    }
}

const SIM_FLASH_BASE: u32 = 0x10000;

struct SimRegion {
    label: &'static str,
    address: u32,
    data: Vec<u8>,
}

struct FlashState {
    regions: [SimRegion; 2],
    booted: usize,
    boot: usize,
    fault_at: Option<u32>,
    fail_boot_pointer: bool,
}

impl FlashState {
    fn region(&self, index: usize) -> StorageRegion {
        let region = &self.regions[index];
        StorageRegion {
            label: region.label.to_string(),
            address: region.address,
            size: region.data.len() as u32,
            is_booted: index == self.booted,
        }
    }

    fn index_of(&self, label: &str) -> Option<usize> {
        self.regions.iter().position(|region| region.label == label)
    }
}

/// Two-slot flash held in memory. Clones share the same contents.
#[derive(Clone)]
pub struct SimulatedFlash {
    state: Arc<Mutex<FlashState>>,
}

impl SimulatedFlash {
    /// Both regions are `region_size` bytes; the device boots from `ota_0`.
    pub fn new(region_size: u32) -> Self {
        let region = |label, index: u32| SimRegion {
            label,
            address: SIM_FLASH_BASE + index * region_size,
            data: vec![0xFF; region_size as usize],
        };

        Self {
            state: Arc::new(Mutex::new(FlashState {
                regions: [region("ota_0", 0), region("ota_1", 1)],
                booted: 0,
                boot: 0,
                fault_at: None,
                fail_boot_pointer: false,
            })),
        }
    }

    /// Writes that would touch `offset` or beyond fail with a flash fault.
    pub fn inject_fault_at(&self, offset: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fault_at = Some(offset);
        }
    }

    pub fn fail_boot_pointer(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_boot_pointer = fail;
        }
    }

    /// Simulated restart: the boot pointer becomes the booted region.
    pub fn reboot(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.booted = state.boot;
        }
    }

    pub fn region_data(&self, label: &str) -> Vec<u8> {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .index_of(label)
                    .map(|index| state.regions[index].data.clone())
            })
            .unwrap_or_default()
    }
}

impl FirmwareStorage for SimulatedFlash {
    fn booted_region(&self) -> Option<StorageRegion> {
        let state = self.state.lock().ok()?;
        Some(state.region(state.booted))
    }

    fn boot_region(&self) -> Option<StorageRegion> {
        let state = self.state.lock().ok()?;
        Some(state.region(state.boot))
    }

    fn inactive_region(&self) -> Option<StorageRegion> {
        let state = self.state.lock().ok()?;
        Some(state.region(1 - state.booted))
    }

    fn open(
        &self,
        region: &StorageRegion,
        size: u32,
    ) -> Result<Box<dyn RegionWriter>, StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::Flash("flash lock poisoned".to_string()))?;
        let index = state
            .index_of(&region.label)
            .ok_or_else(|| StorageError::Flash(format!("unknown region `{}`", region.label)))?;
        if index == state.booted {
            return Err(StorageError::Flash(format!(
                "refusing to erase running region `{}`",
                region.label
            )));
        }

        let capacity = state.regions[index].data.len() as u32;
        if size > capacity {
            return Err(StorageError::RegionExhausted {
                label: region.label.clone(),
                capacity,
            });
        }
        state.regions[index].data[..size as usize].fill(0xFF);

        Ok(Box::new(SimWriter {
            state: self.state.clone(),
            index,
            offset: 0,
        }))
    }

    fn set_boot_region(&self, region: &StorageRegion) -> Result<(), StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::BootPointer("flash lock poisoned".to_string()))?;
        if state.fail_boot_pointer {
            return Err(StorageError::BootPointer(
                "simulated otadata write failure".to_string(),
            ));
        }
        let index = state
            .index_of(&region.label)
            .ok_or_else(|| StorageError::BootPointer(format!("unknown region `{}`", region.label)))?;
        state.boot = index;
        Ok(())
    }
}

struct SimWriter {
    state: Arc<Mutex<FlashState>>,
    index: usize,
    offset: u32,
}

impl RegionWriter for SimWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::Flash("flash lock poisoned".to_string()))?;

        let end = self.offset as usize + data.len();
        if let Some(fault_at) = state.fault_at {
            if end > fault_at as usize {
                return Err(StorageError::Flash(format!(
                    "simulated flash fault at offset {fault_at}"
                )));
            }
        }

        let region = &mut state.regions[self.index];
        if end > region.data.len() {
            return Err(StorageError::RegionExhausted {
                label: region.label.to_string(),
                capacity: region.data.len() as u32,
            });
        }
        region.data[self.offset as usize..end].copy_from_slice(data);
        self.offset = end as u32;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<(), StorageError> {
        if self.offset == 0 {
            return Err(StorageError::Validation("image is empty".to_string()));
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
