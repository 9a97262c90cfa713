use core::ffi::c_void;
use std::{
    ffi::CString,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::{EspOta, EspOtaUpdate, EspOtaUpdateFinished},
    sntp::EspSntp,
    sys,
    wifi::EspWifi,
};
use log::{info, warn};
use serde::Serialize;

use netota_common::{
    AccessPointConfig, ConnectionState, ConnectivityError, ConnectivityManager, CredentialStore,
    Credentials, FirmwareStorage, IndicatorConfig, LinkEvent, LinkEventHandler, NetworkDriver,
    RegionWriter, Restarter, RuntimeConfig, SharedStatus, StationInfo, StatusSink, StorageError,
    StorageRegion, StoreError, SystemStatus, UpdatePipeline,
};

use crate::{
    api::{
        connectivity_error_status, parse_content_length, time_status, update_error_status,
        SaveResponse, UpdateResponse, WifiSaveRequest, FIRMWARE_SHA256_HEADER,
        WIFI_SAVED_MESSAGE,
    },
    portal::PORTAL_HTML,
};

const CONFIG_NAMESPACE: &str = "netota";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const CREDENTIAL_NAMESPACE: &str = "wifi_config";
const CREDENTIAL_SSID_KEY: &str = "ssid";
const CREDENTIAL_PASSWORD_KEY: &str = "password";
const MAX_HTTP_BODY: usize = 512;
const LED_TICK_MS: u64 = 50;

type DeviceConnectivity = ConnectivityManager<NvsStore, EspRadio>;
type DeviceUpdates = UpdatePipeline<EspFlash>;

#[derive(Clone)]
struct SharedState {
    connectivity: Arc<DeviceConnectivity>,
    updates: Arc<DeviceUpdates>,
    status: Arc<SharedStatus>,
    restarter: Arc<EspRestarter>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let flash = EspFlash::open().context("failed to open OTA slots")?;

    let status = Arc::new(SharedStatus::default());
    spawn_indicator_loop(status.clone(), runtime.indicator.clone());

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
    wifi.swap_netif_ap(build_ap_netif(&runtime.connectivity.access_point)?)
        .context("failed to apply AP netif configuration")?;

    let restarter = Arc::new(EspRestarter);
    let connectivity = ConnectivityManager::new(
        runtime.connectivity.clone(),
        nvs_store,
        EspRadio::new(wifi),
        status.clone(),
        restarter.clone(),
    );
    let mode = connectivity.start().context("wifi startup failed")?;
    info!("wifi startup mode: {mode:?}");

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;

    let updates = Arc::new(UpdatePipeline::new(
        runtime.update.clone(),
        flash,
        status.clone(),
    ));
    info!(
        "firmware {} running from partition {}",
        updates.firmware_version(),
        updates
            .booted_region_label()
            .unwrap_or_else(|| "unknown".to_string())
    );

    spawn_status_log(
        connectivity.clone(),
        Duration::from_millis(runtime.connectivity.status_log_interval_ms),
    );

    let server = create_http_server(SharedState {
        connectivity,
        updates,
        status,
        restarter,
    })?;

    // Keep services alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn build_ap_netif(ap: &AccessPointConfig) -> anyhow::Result<EspNetif> {
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway: ap.ip_addr(),
                mask: Mask(24),
            },
            dhcp_enabled: true,
            dns: Some(ap.ip_addr()),
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    };

    Ok(EspNetif::new_with_conf(&conf)?)
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in ["/", "/ota"] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?.write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_json(req, &state.connectivity.status())
        })?;
    }

    server.fn_handler("/api/time", Method::Get, move |req| {
        write_json(req, &time_status())
    })?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/wifi/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: WifiSaveRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(_) => return write_error(req, 400, "Invalid JSON"),
            };

            match state
                .connectivity
                .submit_credentials(&request.ssid, &request.password)
            {
                Ok(()) => write_json(
                    req,
                    &SaveResponse {
                        success: true,
                        message: WIFI_SAVED_MESSAGE,
                    },
                ),
                Err(err) => {
                    warn!("wifi credential submission rejected: {err}");
                    write_error(req, connectivity_error_status(&err), &err.to_string())
                }
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/ota/info", Method::Get, move |req| {
            write_json(req, &state.updates.info())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/ota/update", Method::Post, move |mut req| {
        let Some(total) = parse_content_length(req.header("Content-Length")) else {
            return write_error(req, 411, "Content-Length header is required");
        };
        let digest = req.header(FIRMWARE_SHA256_HEADER).map(str::to_string);

        let begun = match digest.as_deref() {
            Some(digest) => state.updates.begin_verified(total, digest),
            None => state.updates.begin(total),
        };
        if let Err(err) = begun {
            warn!("firmware update refused: {err}");
            return write_error(req, update_error_status(&err), &err.to_string());
        }

        let mut chunk = vec![0_u8; state.updates.config().chunk_size];
        let mut received = 0_u32;
        while received < total {
            let want = chunk.len().min((total - received) as usize);
            let read = match req.read(&mut chunk[..want]) {
                Ok(0) => {
                    state.updates.abort();
                    return write_error(req, 400, "Connection closed before image was complete");
                }
                Ok(read) => read,
                Err(err) => {
                    warn!("firmware upload receive failed: {err:?}");
                    state.updates.abort();
                    return write_error(req, 500, "Failed to receive firmware data");
                }
            };

            if let Err(err) = state.updates.write(&chunk[..read]) {
                warn!("firmware write failed: {err}");
                return write_error(req, update_error_status(&err), &err.to_string());
            }
            received += read as u32;
        }

        match state.updates.end() {
            Ok(summary) => {
                let network =
                    if state.connectivity.state() == ConnectionState::StationConnected {
                        SystemStatus::NetworkConnected
                    } else {
                        SystemStatus::NetworkOff
                    };
                state.status.signal(network);
                state.restarter.schedule_restart(Duration::from_millis(
                    state.updates.config().restart_grace_ms,
                ));
                write_json(req, &UpdateResponse::from(summary))
            }
            Err(err) => write_error(req, update_error_status(&err), &err.to_string()),
        }
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn spawn_status_log(connectivity: Arc<DeviceConnectivity>, period: Duration) {
    let spawned = thread::Builder::new()
        .name("status-log".into())
        .stack_size(4 * 1024)
        .spawn(move || loop {
            thread::sleep(period);
            let status = connectivity.status();
            match status.ip.as_deref() {
                Some(ip) => info!("STA IP: {ip}, AP IP: {}", status.ap_ip),
                None => info!(
                    "STA {} (retry {}), AP IP: {}",
                    status.state, status.retry_count, status.ap_ip
                ),
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn status log thread: {err}");
    }
}

fn spawn_indicator_loop(status: Arc<SharedStatus>, indicator: IndicatorConfig) {
    let spawned = thread::Builder::new()
        .name("status-led".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let mut status_led = init_led(indicator.status_pin);
            let mut ap_led = init_led(indicator.ap_pin);
            let started = Instant::now();

            loop {
                let now_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
                let pattern = status
                    .current()
                    .pattern(indicator.fast_blink_ms, indicator.slow_blink_ms);
                drive_led(&mut status_led, pattern.level_at(now_ms));
                drive_led(&mut ap_led, status.ap_active());
                thread::sleep(Duration::from_millis(LED_TICK_MS));
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn status LED thread: {err}");
    }
}

fn init_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn drive_led(led: &mut Option<StatusLed>, desired_on: bool) {
    let Some(led) = led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive LED: {err}");
    } else {
        led.lit = desired_on;
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), CONFIG_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl CredentialStore for NvsStore {
    fn load(&self) -> Result<Option<Credentials>, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Io("nvs lock poisoned".to_string()))?;
        let nvs = EspNvs::new(self.partition.clone(), CREDENTIAL_NAMESPACE, true)
            .map_err(|err| StoreError::Io(format!("{err:?}")))?;

        let mut ssid_buf = [0_u8; 33];
        let mut password_buf = [0_u8; 65];
        let ssid = nvs
            .get_str(CREDENTIAL_SSID_KEY, &mut ssid_buf)
            .map_err(|err| StoreError::Io(format!("{err:?}")))?;
        let Some(ssid) = ssid.filter(|ssid| !ssid.is_empty()) else {
            return Ok(None);
        };
        let password = nvs
            .get_str(CREDENTIAL_PASSWORD_KEY, &mut password_buf)
            .map_err(|err| StoreError::Io(format!("{err:?}")))?
            .unwrap_or_default();

        Credentials::new(ssid, password)
            .map(Some)
            .map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Io("nvs lock poisoned".to_string()))?;
        let mut nvs = EspNvs::new(self.partition.clone(), CREDENTIAL_NAMESPACE, true)
            .map_err(|err| StoreError::Io(format!("{err:?}")))?;

        nvs.set_str(CREDENTIAL_SSID_KEY, credentials.ssid())
            .map_err(|err| StoreError::Io(format!("{err:?}")))?;
        nvs.set_str(CREDENTIAL_PASSWORD_KEY, credentials.password())
            .map_err(|err| StoreError::Io(format!("{err:?}")))?;
        Ok(())
    }
}

struct EspRadio {
    wifi: Mutex<EspWifi<'static>>,
}

impl EspRadio {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi: Mutex::new(wifi),
        }
    }

    fn apply(&self, configuration: &Configuration) -> Result<(), ConnectivityError> {
        let mut wifi = self
            .wifi
            .lock()
            .map_err(|_| ConnectivityError::Driver("wifi lock poisoned".to_string()))?;
        wifi.set_configuration(configuration)
            .map_err(|err| ConnectivityError::Driver(format!("{err:?}")))?;
        wifi.start()
            .map_err(|err| ConnectivityError::Driver(format!("{err:?}")))
    }
}

impl NetworkDriver for EspRadio {
    fn initialize(&self, handler: LinkEventHandler) -> Result<(), ConnectivityError> {
        // Lives for the rest of the program; the event loop keeps the pointer.
        let context = Box::into_raw(Box::new(handler)) as *mut c_void;

        for base in unsafe { [sys::WIFI_EVENT, sys::IP_EVENT] } {
            let rc = unsafe {
                sys::esp_event_handler_instance_register(
                    base,
                    sys::ESP_EVENT_ANY_ID,
                    Some(on_system_event),
                    context,
                    core::ptr::null_mut(),
                )
            };
            if rc != sys::ESP_OK {
                return Err(ConnectivityError::Driver(format!(
                    "esp_event_handler_instance_register failed with code {rc}"
                )));
            }
        }
        Ok(())
    }

    fn start_access_point(&self, ap: &AccessPointConfig) -> Result<(), ConnectivityError> {
        self.apply(&Configuration::AccessPoint(ap_configuration(ap)?))
    }

    fn start_dual(
        &self,
        ap: &AccessPointConfig,
        credentials: &Credentials,
    ) -> Result<(), ConnectivityError> {
        self.apply(&Configuration::Mixed(
            client_configuration(credentials)?,
            ap_configuration(ap)?,
        ))
    }

    /// Runs on the event task, so it calls the driver directly instead of
    /// waiting on the `EspWifi` lock held by a mode start.
    fn request_connect(&self) -> Result<(), ConnectivityError> {
        let rc = unsafe { sys::esp_wifi_connect() };
        if rc == sys::ESP_OK {
            return Ok(());
        }
        Err(ConnectivityError::Driver(format!(
            "esp_wifi_connect failed with code {rc}"
        )))
    }
}

fn ap_configuration(ap: &AccessPointConfig) -> Result<AccessPointConfiguration, ConnectivityError> {
    Ok(AccessPointConfiguration {
        ssid: ap
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| ConnectivityError::Driver("AP ssid too long".to_string()))?,
        password: ap
            .password
            .as_str()
            .try_into()
            .map_err(|_| ConnectivityError::Driver("AP password too long".to_string()))?,
        auth_method: if ap.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        channel: ap.channel,
        max_connections: u16::from(ap.max_connections),
        ..Default::default()
    })
}

fn client_configuration(
    credentials: &Credentials,
) -> Result<ClientConfiguration, ConnectivityError> {
    Ok(ClientConfiguration {
        ssid: credentials
            .ssid()
            .try_into()
            .map_err(|_| ConnectivityError::Driver("wifi ssid too long".to_string()))?,
        password: credentials
            .password()
            .try_into()
            .map_err(|_| ConnectivityError::Driver("wifi password too long".to_string()))?,
        auth_method: if credentials.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        ..Default::default()
    })
}

unsafe extern "C" fn on_system_event(
    arg: *mut c_void,
    base: sys::esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let handler = &*(arg as *const LinkEventHandler);
    if let Some(event) = decode_system_event(base, id, data) {
        handler(event);
    }
}

unsafe fn decode_system_event(
    base: sys::esp_event_base_t,
    id: i32,
    data: *mut c_void,
) -> Option<LinkEvent> {
    if base == sys::WIFI_EVENT {
        match id as sys::wifi_event_t {
            sys::wifi_event_t_WIFI_EVENT_STA_START => Some(LinkEvent::StationStarted),
            sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
                let info = &*(data as *const sys::wifi_event_sta_disconnected_t);
                Some(LinkEvent::StationDisconnected {
                    reason: info.reason.into(),
                })
            }
            sys::wifi_event_t_WIFI_EVENT_AP_STACONNECTED => {
                let info = &*(data as *const sys::wifi_event_ap_staconnected_t);
                Some(LinkEvent::PeerJoined {
                    mac: info.mac,
                    aid: info.aid.into(),
                })
            }
            sys::wifi_event_t_WIFI_EVENT_AP_STADISCONNECTED => {
                let info = &*(data as *const sys::wifi_event_ap_stadisconnected_t);
                Some(LinkEvent::PeerLeft {
                    mac: info.mac,
                    aid: info.aid.into(),
                })
            }
            _ => None,
        }
    } else if base == sys::IP_EVENT && id as sys::ip_event_t == sys::ip_event_t_IP_EVENT_STA_GOT_IP
    {
        let info = &*(data as *const sys::ip_event_got_ip_t);
        Some(LinkEvent::AddressAcquired(StationInfo {
            ip: ipv4_from_esp(info.ip_info.ip),
            netmask: ipv4_from_esp(info.ip_info.netmask),
            gateway: ipv4_from_esp(info.ip_info.gw),
        }))
    } else {
        None
    }
}

// lwIP keeps addresses in network byte order.
fn ipv4_from_esp(addr: sys::esp_ip4_addr_t) -> Ipv4Addr {
    Ipv4Addr::from(addr.addr.to_le_bytes())
}

struct EspRestarter;

impl Restarter for EspRestarter {
    fn schedule_restart(&self, after: Duration) {
        let spawned = thread::Builder::new()
            .name("restart".into())
            .spawn(move || {
                thread::sleep(after);
                unsafe { sys::esp_restart() };
            });
        if let Err(err) = spawned {
            warn!("failed to spawn restart thread ({err}); restarting now");
            unsafe { sys::esp_restart() };
        }
    }
}

/// OTA slots driven through `EspOta`. The running and update slots cannot
/// change before a restart, so they are read once when the flash is opened.
struct EspFlash {
    ota: *mut EspOta,
    running: StorageRegion,
    update: StorageRegion,
    boot_label: Mutex<String>,
    finished: Arc<Mutex<Option<EspOtaUpdateFinished<'static>>>>,
}

// `ota` points at a leaked `EspOta`; the update pipeline holds its session lock
// around every call that borrows it mutably.
unsafe impl Send for EspFlash {}
unsafe impl Sync for EspFlash {}

impl EspFlash {
    fn open() -> anyhow::Result<Self> {
        let ota: &'static mut EspOta = Box::leak(Box::new(
            EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?,
        ));
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }

        let running = ota
            .get_running_slot()
            .map_err(|err| anyhow!("failed to query running slot: {err:?}"))?;
        let boot = ota
            .get_boot_slot()
            .map_err(|err| anyhow!("failed to query boot slot: {err:?}"))?;
        let update = ota
            .get_update_slot()
            .map_err(|err| anyhow!("failed to query update slot: {err:?}"))?;

        Ok(Self {
            running: slot_region(running.label.as_str(), true)?,
            update: slot_region(update.label.as_str(), false)?,
            boot_label: Mutex::new(boot.label.as_str().to_string()),
            finished: Arc::new(Mutex::new(None)),
            ota: ota as *mut EspOta,
        })
    }

    fn set_boot_label(&self, label: &str) {
        if let Ok(mut boot) = self.boot_label.lock() {
            *boot = label.to_string();
        }
    }
}

impl FirmwareStorage for EspFlash {
    fn booted_region(&self) -> Option<StorageRegion> {
        Some(self.running.clone())
    }

    fn boot_region(&self) -> Option<StorageRegion> {
        let boot = self.boot_label.lock().ok()?;
        [&self.running, &self.update]
            .into_iter()
            .find(|region| region.label == *boot)
            .cloned()
    }

    fn inactive_region(&self) -> Option<StorageRegion> {
        Some(self.update.clone())
    }

    fn open(
        &self,
        region: &StorageRegion,
        _size: u32,
    ) -> Result<Box<dyn RegionWriter>, StorageError> {
        if region.label != self.update.label {
            return Err(StorageError::Flash(format!(
                "partition {} is not the OTA update slot",
                region.label
            )));
        }

        let mut finished = self
            .finished
            .lock()
            .map_err(|_| StorageError::Flash("OTA lock poisoned".to_string()))?;
        // Releases the previous borrow of `ota` before taking a new one.
        finished.take();

        let ota: &'static mut EspOta = unsafe { &mut *self.ota };
        let update = ota.initiate_update().map_err(|err| {
            StorageError::Flash(format!("failed to initiate OTA update: {err:?}"))
        })?;

        Ok(Box::new(EspRegionWriter {
            update,
            label: region.label.clone(),
            finished: self.finished.clone(),
        }))
    }

    fn set_boot_region(&self, region: &StorageRegion) -> Result<(), StorageError> {
        if region.label == self.running.label {
            // `EspOta` can only activate a fresh image, not re-select the running one.
            let rc = unsafe {
                sys::esp_ota_set_boot_partition(sys::esp_ota_get_running_partition())
            };
            if rc != sys::ESP_OK {
                return Err(StorageError::BootPointer(format!(
                    "failed to select running partition for boot (code {rc})"
                )));
            }
            self.set_boot_label(&region.label);
            return Ok(());
        }

        let finished = self
            .finished
            .lock()
            .map_err(|_| StorageError::BootPointer("OTA lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| {
                StorageError::BootPointer(format!("no finished image in {}", region.label))
            })?;
        finished.activate().map_err(|err| {
            StorageError::BootPointer(format!("failed to activate {}: {err:?}", region.label))
        })?;
        self.set_boot_label(&region.label);
        Ok(())
    }
}

/// Address and size come from the partition table; `EspOta` slots only carry labels.
fn slot_region(label: &str, is_booted: bool) -> anyhow::Result<StorageRegion> {
    let c_label = CString::new(label).map_err(|_| anyhow!("invalid partition label `{label}`"))?;
    let partition = unsafe {
        sys::esp_partition_find_first(
            sys::esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            c_label.as_ptr(),
        )
    };
    if partition.is_null() {
        return Err(anyhow!("partition `{label}` not found"));
    }
    let partition = unsafe { &*partition };

    Ok(StorageRegion {
        label: label.to_string(),
        address: partition.address,
        size: partition.size,
        is_booted,
    })
}

struct EspRegionWriter {
    update: EspOtaUpdate<'static>,
    label: String,
    finished: Arc<Mutex<Option<EspOtaUpdateFinished<'static>>>>,
}

// Owned by the single open update session.
unsafe impl Send for EspRegionWriter {}

impl RegionWriter for EspRegionWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.update.write(data).map(|_| ()).map_err(|err| {
            StorageError::Flash(format!("failed writing OTA data to {}: {err:?}", self.label))
        })
    }

    fn finalize(self: Box<Self>) -> Result<(), StorageError> {
        let Self {
            update,
            label,
            finished,
        } = *self;

        let done = update.finish().map_err(|err| {
            if err.code() == sys::ESP_ERR_OTA_VALIDATE_FAILED as sys::esp_err_t {
                StorageError::Validation(format!("image in {label} failed validation"))
            } else {
                StorageError::Flash(format!("failed finalizing OTA image in {label}: {err:?}"))
            }
        })?;

        let mut slot = finished
            .lock()
            .map_err(|_| StorageError::Flash("OTA lock poisoned".to_string()))?;
        *slot = Some(done);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let Self { update, label, .. } = *self;
        if let Err(err) = update.abort() {
            warn!("failed to abort OTA update in {label}: {err:?}");
        }
    }
}
