use std::{
    fs::{self, File},
    io::{BufWriter, ErrorKind, Write as _},
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, runtime::Handle, sync::Notify, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use netota_common::{
    AccessPointConfig, ConnectionState, ConnectivityError, ConnectivityManager, CredentialStore,
    Credentials, FirmwareStorage, LinkEvent, LinkEventHandler, NetworkDriver, RegionWriter,
    Restarter, RuntimeConfig, SharedStatus, StationInfo, StatusSink, StorageError, StorageRegion,
    StoreError, SystemStatus, UpdateError, UpdatePipeline,
};

use crate::{
    api::{
        connectivity_error_status, parse_content_length, time_status, update_error_status,
        SaveResponse, UpdateResponse, WifiSaveRequest, FIRMWARE_SHA256_HEADER,
        WIFI_SAVED_MESSAGE,
    },
    portal::PORTAL_HTML,
};

const HOST_REGION_SIZE: u32 = 0x1E_0000;
const FLASH_BASE_ADDRESS: u32 = 0x1_0000;
const REGION_LABELS: [&str; 2] = ["ota_0", "ota_1"];
const SIM_LINK_LATENCY_MS: u64 = 300;
// Reason code the radio reports when the configured network cannot be found.
const SIM_REASON_NO_AP_FOUND: u16 = 201;

type HostConnectivity = ConnectivityManager<FileCredentialStore, SimulatedRadio>;
type HostUpdates = UpdatePipeline<FileFlash>;

#[derive(Clone)]
struct AppState {
    connectivity: Arc<HostConnectivity>,
    updates: Arc<HostUpdates>,
    status: Arc<SharedStatus>,
    restarter: Arc<HostRestarter>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

enum Shutdown {
    Restart,
    Exit,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("NETOTA_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.netota"));

    let mut boot_count = 0_u32;
    loop {
        boot_count += 1;
        info!(
            "booting simulated device #{boot_count} from {}",
            data_dir.display()
        );

        match boot(&data_dir).await? {
            Shutdown::Restart => info!("restarting..."),
            Shutdown::Exit => return Ok(()),
        }
    }
}

async fn boot(data_dir: &Path) -> anyhow::Result<Shutdown> {
    let mut runtime = load_runtime_config(&data_dir.join("config.json"))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}");
            RuntimeConfig::default()
        });
    runtime.sanitize();

    let status = Arc::new(SharedStatus::default());
    let restarter = Arc::new(HostRestarter::new(Handle::current()));

    let fail_station = std::env::var("NETOTA_SIM_FAIL_STATION")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if fail_station {
        warn!("simulated station will fail every connection attempt");
    }

    let connectivity = ConnectivityManager::new(
        runtime.connectivity.clone(),
        FileCredentialStore::new(data_dir.join("credentials.json")),
        SimulatedRadio::new(fail_station),
        status.clone(),
        restarter.clone(),
    );
    let mode = connectivity.start().context("connectivity startup failed")?;
    info!("network startup mode: {mode:?}");

    let flash = FileFlash::open(data_dir, HOST_REGION_SIZE)
        .context("failed to open firmware storage")?;
    let updates = Arc::new(UpdatePipeline::new(
        runtime.update.clone(),
        flash,
        status.clone(),
    ));
    info!(
        "firmware {} running from {}",
        updates.firmware_version(),
        updates
            .booted_region_label()
            .unwrap_or_else(|| "unknown".to_string())
    );

    let app_state = AppState {
        connectivity,
        updates,
        status,
        restarter: restarter.clone(),
    };
    let status_log = spawn_status_log(
        app_state.clone(),
        Duration::from_millis(runtime.connectivity.status_log_interval_ms),
    );

    let app = Router::new()
        .route("/", get(handle_portal))
        .route("/ota", get(handle_portal))
        .route("/api/status", get(handle_get_status))
        .route("/api/time", get(handle_get_time))
        .route("/api/wifi/save", post(handle_wifi_save))
        .route("/api/ota/info", get(handle_ota_info))
        .route("/api/ota/update", post(handle_ota_update))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("NETOTA_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind portal server at {addr}"))?;
    info!("portal listening on http://{addr}");

    let restart_requested = Arc::new(AtomicBool::new(false));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(restarter, restart_requested.clone()))
        .await?;
    status_log.abort();

    if restart_requested.load(Ordering::Acquire) {
        Ok(Shutdown::Restart)
    } else {
        Ok(Shutdown::Exit)
    }
}

async fn shutdown_signal(restarter: Arc<HostRestarter>, restart_requested: Arc<AtomicBool>) {
    tokio::select! {
        _ = restarter.requested() => {
            restart_requested.store(true, Ordering::Release);
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("failed to listen for ctrl-c: {err}");
            }
            info!("shutdown requested");
        }
    }
}

fn spawn_status_log(app_state: AppState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;

            let status = app_state.connectivity.status();
            match status.ip.as_deref() {
                Some(ip) => info!("STA IP: {ip}, AP IP: {}", status.ap_ip),
                None => info!(
                    "STA {} (retry {}), AP IP: {}",
                    status.state, status.retry_count, status.ap_ip
                ),
            }
            if let Some(session) = app_state.updates.session() {
                info!(
                    "OTA {} {}% of {} bytes",
                    session.status.as_str(),
                    session.progress_pct(),
                    session.bytes_expected
                );
            }
        }
    })
}

async fn handle_portal() -> impl IntoResponse {
    Html(PORTAL_HTML)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.connectivity.status())
}

async fn handle_get_time() -> impl IntoResponse {
    Json(time_status())
}

async fn handle_wifi_save(
    State(state): State<AppState>,
    Json(request): Json<WifiSaveRequest>,
) -> axum::response::Response {
    let connectivity = state.connectivity.clone();
    let result = tokio::task::spawn_blocking(move || {
        connectivity.submit_credentials(&request.ssid, &request.password)
    })
    .await;

    match result {
        Ok(Ok(())) => Json(SaveResponse {
            success: true,
            message: WIFI_SAVED_MESSAGE,
        })
        .into_response(),
        Ok(Err(err)) => {
            warn!("wifi credential submission rejected: {err}");
            error_response(status_code(connectivity_error_status(&err)), &err.to_string())
        }
        Err(err) => {
            warn!("wifi credential task failed: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to save credentials",
            )
        }
    }
}

async fn handle_ota_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.updates.info())
}

async fn handle_ota_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> axum::response::Response {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok());
    let Some(total) = parse_content_length(content_length) else {
        return error_response(
            StatusCode::LENGTH_REQUIRED,
            "Content-Length header is required",
        );
    };
    let digest = headers
        .get(FIRMWARE_SHA256_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let updates = state.updates.clone();
    let begun = tokio::task::spawn_blocking(move || match digest.as_deref() {
        Some(digest) => updates.begin_verified(total, digest),
        None => updates.begin(total),
    })
    .await;
    let session = match begun {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => return update_error_response(&err),
        Err(err) => return join_error_response(err),
    };
    info!(
        "OTA upload started: {total} bytes into {}",
        session.region.label
    );

    // Aborts the session if the client goes away mid-upload and this future is dropped.
    let mut guard = AbortOnDrop::new(state.updates.clone(), session.id);
    let chunk_size = state.updates.config().chunk_size;
    let mut body = body;

    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                let updates = state.updates.clone();
                let written = tokio::task::spawn_blocking(move || {
                    let mut written = 0;
                    for chunk in data.chunks(chunk_size) {
                        written = updates.write(chunk)?;
                    }
                    Ok::<u32, UpdateError>(written)
                })
                .await;

                match written {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => return update_error_response(&err),
                    Err(err) => return join_error_response(err),
                }
            }
            Some(Err(err)) => {
                warn!("firmware upload receive failed: {err}");
                return error_response(StatusCode::BAD_REQUEST, "Failed to receive firmware data");
            }
            None => break,
        }
    }

    let updates = state.updates.clone();
    let ended = tokio::task::spawn_blocking(move || updates.end()).await;
    guard.disarm();

    match ended {
        Ok(Ok(summary)) => {
            let network = if state.connectivity.state() == ConnectionState::StationConnected {
                SystemStatus::NetworkConnected
            } else {
                SystemStatus::NetworkOff
            };
            state.status.signal(network);

            let grace = Duration::from_millis(state.updates.config().restart_grace_ms);
            info!("restarting in {} ms to boot the new image", grace.as_millis());
            state.restarter.schedule_restart(grace);
            Json(UpdateResponse::from(summary)).into_response()
        }
        Ok(Err(err)) => update_error_response(&err),
        Err(err) => {
            state.updates.abort_session(session.id);
            join_error_response(err)
        }
    }
}

struct AbortOnDrop {
    updates: Arc<HostUpdates>,
    session_id: u64,
    armed: bool,
}

impl AbortOnDrop {
    fn new(updates: Arc<HostUpdates>, session_id: u64) -> Self {
        Self {
            updates,
            session_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.updates.abort_session(self.session_id);
        }
    }
}

fn update_error_response(err: &UpdateError) -> axum::response::Response {
    warn!("firmware update failed: {err}");
    error_response(status_code(update_error_status(err)), &err.to_string())
}

fn join_error_response(err: tokio::task::JoinError) -> axum::response::Response {
    warn!("blocking task failed: {err}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("tmp");
    fs::write(&staging, payload)?;
    fs::rename(staging, path)
}

struct HostRestarter {
    runtime: Handle,
    notify: Arc<Notify>,
}

impl HostRestarter {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            notify: Arc::new(Notify::new()),
        }
    }

    async fn requested(&self) {
        self.notify.notified().await;
    }
}

impl Restarter for HostRestarter {
    fn schedule_restart(&self, after: Duration) {
        let notify = self.notify.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            notify.notify_one();
        });
    }
}

/// Stand-in for the WiFi radio. Events are delivered from short-lived threads
/// after a fixed latency, the way the real stack posts them from its own task.
struct SimulatedRadio {
    handler: Mutex<Option<LinkEventHandler>>,
    fail_station: bool,
    latency: Duration,
    lease: StationInfo,
}

impl SimulatedRadio {
    fn new(fail_station: bool) -> Self {
        Self {
            handler: Mutex::new(None),
            fail_station,
            latency: Duration::from_millis(SIM_LINK_LATENCY_MS),
            lease: StationInfo {
                ip: Ipv4Addr::new(192, 168, 1, 50),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(192, 168, 1, 1),
            },
        }
    }

    fn deliver(&self, event: LinkEvent) {
        let Some(handler) = self.handler.lock().ok().and_then(|handler| handler.clone()) else {
            warn!("dropping {event:?}: radio not initialized");
            return;
        };

        let latency = self.latency;
        let spawned = thread::Builder::new()
            .name("sim-radio".into())
            .spawn(move || {
                thread::sleep(latency);
                handler(event);
            });
        if let Err(err) = spawned {
            warn!("failed to spawn radio event thread: {err}");
        }
    }
}

impl NetworkDriver for SimulatedRadio {
    fn initialize(&self, handler: LinkEventHandler) -> Result<(), ConnectivityError> {
        let mut slot = self
            .handler
            .lock()
            .map_err(|_| ConnectivityError::Driver("radio lock poisoned".to_string()))?;
        *slot = Some(handler);
        Ok(())
    }

    fn start_access_point(&self, ap: &AccessPointConfig) -> Result<(), ConnectivityError> {
        info!(
            "simulated AP `{}` up ({})",
            ap.ssid,
            if ap.is_open() { "open" } else { "WPA2" }
        );
        Ok(())
    }

    fn start_dual(
        &self,
        ap: &AccessPointConfig,
        credentials: &Credentials,
    ) -> Result<(), ConnectivityError> {
        info!(
            "simulated AP `{}` up, station joining `{}`",
            ap.ssid,
            credentials.ssid()
        );
        self.deliver(LinkEvent::StationStarted);
        Ok(())
    }

    fn request_connect(&self) -> Result<(), ConnectivityError> {
        if self.fail_station {
            self.deliver(LinkEvent::StationDisconnected {
                reason: SIM_REASON_NO_AP_FOUND,
            });
        } else {
            self.deliver(LinkEvent::AddressAcquired(self.lease));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialRecord {
    ssid: String,
    password: String,
}

/// Credential record kept as a JSON file, replaced atomically on save.
struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credentials>, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Io("credential file lock poisoned".to_string()))?;

        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };
        let record: CredentialRecord =
            serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        Credentials::new(&record.ssid, &record.password)
            .map(Some)
            .map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Io("credential file lock poisoned".to_string()))?;

        let record = CredentialRecord {
            ssid: credentials.ssid().to_string(),
            password: credentials.password().to_string(),
        };
        let payload =
            serde_json::to_vec_pretty(&record).map_err(|err| StoreError::Io(err.to_string()))?;
        write_atomic(&self.path, &payload).map_err(|err| StoreError::Io(err.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OtaData {
    boot: String,
}

/// Two firmware slots as `ota_0.bin` / `ota_1.bin` with the boot pointer in
/// `otadata.json`. The booted slot is fixed when the storage is opened.
struct FileFlash {
    dir: PathBuf,
    region_size: u32,
    booted: usize,
    boot: Mutex<usize>,
}

impl FileFlash {
    fn open(dir: &Path, region_size: u32) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let boot = match fs::read(dir.join("otadata.json")) {
            Ok(raw) => {
                let otadata: OtaData =
                    serde_json::from_slice(&raw).context("otadata.json is corrupt")?;
                region_index(&otadata.boot).unwrap_or_else(|| {
                    warn!("unknown boot partition `{}`, using ota_0", otadata.boot);
                    0
                })
            }
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err).context("failed to read otadata.json"),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            region_size,
            booted: boot,
            boot: Mutex::new(boot),
        })
    }

    fn region(&self, index: usize) -> StorageRegion {
        StorageRegion {
            label: REGION_LABELS[index].to_string(),
            address: FLASH_BASE_ADDRESS + index as u32 * self.region_size,
            size: self.region_size,
            is_booted: index == self.booted,
        }
    }

    fn image_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.bin"))
    }
}

fn region_index(label: &str) -> Option<usize> {
    REGION_LABELS.iter().position(|candidate| *candidate == label)
}

impl FirmwareStorage for FileFlash {
    fn booted_region(&self) -> Option<StorageRegion> {
        Some(self.region(self.booted))
    }

    fn boot_region(&self) -> Option<StorageRegion> {
        let boot = *self.boot.lock().ok()?;
        Some(self.region(boot))
    }

    fn inactive_region(&self) -> Option<StorageRegion> {
        Some(self.region(1 - self.booted))
    }

    fn open(
        &self,
        region: &StorageRegion,
        size: u32,
    ) -> Result<Box<dyn RegionWriter>, StorageError> {
        let index = region_index(&region.label)
            .ok_or_else(|| StorageError::Flash(format!("unknown region `{}`", region.label)))?;
        if index == self.booted {
            return Err(StorageError::Flash(format!(
                "refusing to overwrite running region `{}`",
                region.label
            )));
        }
        if size > self.region_size {
            return Err(StorageError::RegionExhausted {
                label: region.label.clone(),
                capacity: self.region_size,
            });
        }

        let path = self.image_path(&region.label);
        let file = File::create(&path)
            .map_err(|err| StorageError::Flash(format!("{}: {err}", path.display())))?;
        Ok(Box::new(FileRegionWriter {
            file: BufWriter::new(file),
            path,
            written: 0,
        }))
    }

    fn set_boot_region(&self, region: &StorageRegion) -> Result<(), StorageError> {
        let index = region_index(&region.label).ok_or_else(|| {
            StorageError::BootPointer(format!("unknown region `{}`", region.label))
        })?;
        let mut boot = self
            .boot
            .lock()
            .map_err(|_| StorageError::BootPointer("boot pointer lock poisoned".to_string()))?;

        let payload = serde_json::to_vec_pretty(&OtaData {
            boot: region.label.clone(),
        })
        .map_err(|err| StorageError::BootPointer(err.to_string()))?;
        write_atomic(&self.dir.join("otadata.json"), &payload)
            .map_err(|err| StorageError::BootPointer(err.to_string()))?;

        *boot = index;
        Ok(())
    }
}

struct FileRegionWriter {
    file: BufWriter<File>,
    path: PathBuf,
    written: u64,
}

impl RegionWriter for FileRegionWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(data)
            .map_err(|err| StorageError::Flash(format!("{}: {err}", self.path.display())))?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<(), StorageError> {
        if self.written == 0 {
            return Err(StorageError::Validation("image is empty".to_string()));
        }
        let path = self.path;
        let file = self
            .file
            .into_inner()
            .map_err(|err| StorageError::Flash(format!("{}: {err}", path.display())))?;
        file.sync_all()
            .map_err(|err| StorageError::Flash(format!("{}: {err}", path.display())))
    }

    fn abort(self: Box<Self>) {
        let path = self.path;
        let (file, _unflushed) = self.file.into_parts();
        if let Err(err) = file.set_len(0) {
            warn!("failed to discard partial image {}: {err}", path.display());
        }
    }
}
