use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::{Duration, Instant},
};

use log::{info, warn};

use crate::{
    config::{AccessPointConfig, ConnectivityConfig},
    credentials::{CredentialCache, CredentialStore},
    error::ConnectivityError,
    link::{LinkAction, LinkStateMachine},
    status::StatusSink,
    types::{
        ConnectionState, ConnectivityEvent, Credentials, LinkEvent, NetworkStatus, StartupMode,
        StationInfo,
    },
};

pub type LinkEventHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// The radio/network stack beneath the manager.
///
/// Implementations deliver `LinkEvent`s through the handler passed to
/// `initialize`, from whatever context the stack runs on. They must not invoke
/// the handler synchronously from inside `request_connect`.
pub trait NetworkDriver: Send + Sync {
    fn initialize(&self, handler: LinkEventHandler) -> Result<(), ConnectivityError>;
    fn start_access_point(&self, ap: &AccessPointConfig) -> Result<(), ConnectivityError>;
    fn start_dual(
        &self,
        ap: &AccessPointConfig,
        credentials: &Credentials,
    ) -> Result<(), ConnectivityError>;
    fn request_connect(&self) -> Result<(), ConnectivityError>;
}

/// Deferred device restart, injected so tests never reboot anything.
pub trait Restarter: Send + Sync {
    fn schedule_restart(&self, after: Duration);
}

pub struct ConnectivityManager<S, D> {
    config: ConnectivityConfig,
    driver: D,
    credentials: CredentialCache<S>,
    sink: Arc<dyn StatusSink>,
    restarter: Arc<dyn Restarter>,
    machine: Mutex<LinkStateMachine>,
    state: AtomicU8,
    initialized: Mutex<bool>,
    subscribers: Mutex<Vec<Sender<ConnectivityEvent>>>,
}

impl<S, D> ConnectivityManager<S, D>
where
    S: CredentialStore + 'static,
    D: NetworkDriver + 'static,
{
    pub fn new(
        config: ConnectivityConfig,
        store: S,
        driver: D,
        sink: Arc<dyn StatusSink>,
        restarter: Arc<dyn Restarter>,
    ) -> Arc<Self> {
        let machine = LinkStateMachine::new(config.max_retry);
        Arc::new(Self {
            config,
            driver,
            credentials: CredentialCache::new(store),
            sink,
            restarter,
            state: AtomicU8::new(machine.state().to_u8()),
            machine: Mutex::new(machine),
            initialized: Mutex::new(false),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn credentials(&self) -> &CredentialCache<S> {
        &self.credentials
    }

    /// Registers the link-event listener with the driver. Safe to call repeatedly.
    pub fn initialize(self: &Arc<Self>) -> Result<(), ConnectivityError> {
        let mut initialized = self
            .initialized
            .lock()
            .map_err(|_| ConnectivityError::Driver("init lock poisoned".to_string()))?;
        if *initialized {
            return Ok(());
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let handler: LinkEventHandler = Arc::new(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.on_link_event(event);
            }
        });
        self.driver.initialize(handler)?;
        *initialized = true;

        info!(
            "connectivity manager initialized (max retry {})",
            self.config.max_retry
        );
        Ok(())
    }

    /// Boot-time mode selection: dual mode with stored credentials, AP only otherwise.
    pub fn start(self: &Arc<Self>) -> Result<StartupMode, ConnectivityError> {
        self.initialize()?;

        match self.credentials.get() {
            Ok(Some(credentials)) => {
                info!("wifi credentials found, starting dual mode");
                match self.start_dual_mode(credentials) {
                    Ok(()) => Ok(StartupMode::Dual),
                    Err(err) => {
                        warn!("dual mode start failed ({err}); starting access point only");
                        self.start_access_point_only()?;
                        Ok(StartupMode::AccessPointOnly)
                    }
                }
            }
            Ok(None) => {
                info!("no wifi credentials, starting access point only");
                self.start_access_point_only()?;
                Ok(StartupMode::AccessPointOnly)
            }
            Err(err) => {
                warn!("failed to read stored credentials ({err}); starting access point only");
                self.start_access_point_only()?;
                Ok(StartupMode::AccessPointOnly)
            }
        }
    }

    pub fn start_access_point_only(&self) -> Result<(), ConnectivityError> {
        self.ensure_initialized()?;

        // Committed before the driver call so events raised while the radio
        // starts already see the new mode.
        let (previous, actions) = {
            let mut machine = self.lock_machine()?;
            let previous = machine.clone();
            let actions = machine.start_access_point()?;
            self.mirror_state(&machine);
            (previous, actions)
        };

        let ap = &self.config.access_point;
        if let Err(err) = self.driver.start_access_point(ap) {
            self.roll_back(previous);
            return Err(err);
        }
        info!(
            "access point `{}` started on {} (channel {}, max {} peers)",
            ap.ssid,
            ap.ip_addr(),
            ap.channel,
            ap.max_connections
        );

        self.execute(actions);
        Ok(())
    }

    pub fn start_dual_mode(&self, credentials: Credentials) -> Result<(), ConnectivityError> {
        self.ensure_initialized()?;

        let (previous, actions) = {
            let mut machine = self.lock_machine()?;
            let previous = machine.clone();
            let actions = machine.start_dual()?;
            self.mirror_state(&machine);
            (previous, actions)
        };

        let ap = &self.config.access_point;
        if let Err(err) = self.driver.start_dual(ap, &credentials) {
            self.roll_back(previous);
            return Err(err);
        }
        info!(
            "dual mode started: AP `{}` on {}, station connecting to `{}`",
            ap.ssid,
            ap.ip_addr(),
            credentials.ssid()
        );

        self.execute(actions);
        Ok(())
    }

    /// Validates and persists new credentials, then schedules a restart so the
    /// network stack comes back up from a clean state.
    pub fn submit_credentials(&self, ssid: &str, password: &str) -> Result<(), ConnectivityError> {
        let credentials = Credentials::new(ssid, password)?;
        self.credentials.put(&credentials)?;
        info!("wifi credentials saved for `{}`", credentials.ssid());

        let grace = Duration::from_millis(self.config.restart_grace_ms);
        info!("restarting in {} ms to apply new credentials", grace.as_millis());
        self.restarter.schedule_restart(grace);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn retry_count(&self) -> u8 {
        self.lock_machine()
            .map(|machine| machine.retry_count())
            .unwrap_or_default()
    }

    pub fn access_point_active(&self) -> bool {
        self.lock_machine()
            .map(|machine| machine.access_point_active())
            .unwrap_or(false)
    }

    pub fn station(&self) -> Option<StationInfo> {
        self.lock_machine().ok().and_then(|machine| machine.station())
    }

    pub fn status(&self) -> NetworkStatus {
        let (state, station, ap_active, ap_peers, retry_count) = match self.lock_machine() {
            Ok(machine) => (
                machine.state(),
                machine.station(),
                machine.access_point_active(),
                machine.ap_peers(),
                machine.retry_count(),
            ),
            Err(_) => (self.state(), None, false, 0, 0),
        };

        let connected = state == ConnectionState::StationConnected;
        let ssid = if connected {
            self.credentials
                .get()
                .ok()
                .flatten()
                .map(|credentials| credentials.ssid().to_string())
        } else {
            None
        };

        NetworkStatus {
            state: state.as_str(),
            connected,
            ssid,
            ip: station.map(|info| info.ip.to_string()),
            subnet: station.map(|info| info.netmask.to_string()),
            gateway: station.map(|info| info.gateway.to_string()),
            ap_ip: self.config.access_point.ip_addr().to_string(),
            ap_ssid: self.config.access_point.ssid.clone(),
            ap_active,
            ap_peers,
            retry_count,
        }
    }

    pub fn subscribe(&self) -> Receiver<ConnectivityEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Blocks until the station has an address, the retry budget is spent, or `timeout` elapses.
    pub fn wait_for_station(&self, timeout: Duration) -> Result<StationInfo, ConnectivityError> {
        let events = self.subscribe();

        match self.state() {
            ConnectionState::StationConnected => {
                if let Some(info) = self.station() {
                    return Ok(info);
                }
            }
            ConnectionState::StationFailed => {
                return Err(ConnectivityError::ConnectRetriesExhausted)
            }
            _ => {}
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(ConnectivityEvent::Connected(info)) => return Ok(info),
                Ok(ConnectivityEvent::ConnectionFailed { .. }) => {
                    return Err(ConnectivityError::ConnectRetriesExhausted)
                }
                Err(RecvTimeoutError::Timeout) => return Err(ConnectivityError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ConnectivityError::Driver(
                        "connectivity event channel closed".to_string(),
                    ))
                }
            }
        }
    }

    /// Sole mutator of connection state and retry counter.
    pub fn on_link_event(&self, event: LinkEvent) {
        match &event {
            LinkEvent::StationStarted => info!("wifi station started, connecting..."),
            LinkEvent::StationDisconnected { reason } => {
                info!("wifi disconnected (reason {reason})")
            }
            LinkEvent::AddressAcquired(station) => info!("got IP address {}", station.ip),
            LinkEvent::PeerJoined { mac, aid } => {
                info!("station {} joined, AID={aid}", format_mac(mac))
            }
            LinkEvent::PeerLeft { mac, aid } => {
                info!("station {} left, AID={aid}", format_mac(mac))
            }
        }

        let actions = match self.lock_machine() {
            Ok(mut machine) => {
                let before = machine.state();
                let actions = machine.handle(&event);
                let after = machine.state();
                self.mirror_state(&machine);

                if before != after {
                    info!("wifi state {} -> {}", before.as_str(), after.as_str());
                }
                match after {
                    ConnectionState::StationDisconnected if before != after || !actions.is_empty() => {
                        info!(
                            "retry connecting to wifi ({}/{})",
                            machine.retry_count(),
                            machine.max_retry()
                        );
                    }
                    ConnectionState::StationFailed if before != after => {
                        warn!(
                            "failed to connect to wifi after {} retries; access point stays up",
                            machine.retry_count()
                        );
                    }
                    _ => {}
                }
                actions
            }
            Err(err) => {
                warn!("dropping link event {event:?}: {err}");
                return;
            }
        };

        self.execute(actions);
    }

    fn execute(&self, actions: Vec<LinkAction>) {
        for action in actions {
            match action {
                LinkAction::RequestConnect => {
                    if let Err(err) = self.driver.request_connect() {
                        warn!("wifi connect request failed: {err}");
                    }
                }
                LinkAction::AccessPoint(active) => self.sink.access_point(active),
                LinkAction::Notify(event) => self.publish(event),
                LinkAction::Signal(status) => self.sink.signal(status),
            }
        }
    }

    fn publish(&self, event: ConnectivityEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Restores the machine as it was before a mode start the driver refused.
    fn roll_back(&self, previous: LinkStateMachine) {
        match self.lock_machine() {
            Ok(mut machine) => {
                warn!(
                    "network mode start failed, staying in {}",
                    previous.state().as_str()
                );
                *machine = previous;
                self.mirror_state(&machine);
            }
            Err(err) => warn!("cannot restore link state: {err}"),
        }
    }

    fn ensure_initialized(&self) -> Result<(), ConnectivityError> {
        match self.initialized.lock() {
            Ok(initialized) if *initialized => Ok(()),
            _ => Err(ConnectivityError::NotInitialized),
        }
    }

    fn lock_machine(&self) -> Result<MutexGuard<'_, LinkStateMachine>, ConnectivityError> {
        self.machine
            .lock()
            .map_err(|_| ConnectivityError::Driver("link state lock poisoned".to_string()))
    }

    fn mirror_state(&self, machine: &LinkStateMachine) {
        self.state.store(machine.state().to_u8(), Ordering::Release);
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        credentials::MemoryCredentialStore,
        sim::{DriverCall, RecordingRestarter, SimulatedDriver},
        status::{RecordingSink, SystemStatus},
    };

    type TestManager = ConnectivityManager<MemoryCredentialStore, SimulatedDriver>;

    struct Harness {
        manager: Arc<TestManager>,
        sink: Arc<RecordingSink>,
        restarter: Arc<RecordingRestarter>,
    }

    fn harness(store: MemoryCredentialStore) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let restarter = Arc::new(RecordingRestarter::default());
        let manager = ConnectivityManager::new(
            ConnectivityConfig::default(),
            store,
            SimulatedDriver::default(),
            sink.clone(),
            restarter.clone(),
        );
        Harness {
            manager,
            sink,
            restarter,
        }
    }

    fn station_info() -> StationInfo {
        StationInfo {
            ip: Ipv4Addr::new(10, 0, 0, 23),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
        }
    }

    #[test]
    fn mode_start_requires_initialize() {
        let h = harness(MemoryCredentialStore::default());

        assert!(matches!(
            h.manager.start_access_point_only(),
            Err(ConnectivityError::NotInitialized)
        ));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn initialize_is_idempotent() {
        let h = harness(MemoryCredentialStore::default());
        h.manager.initialize().unwrap();
        h.manager.initialize().unwrap();

        assert_eq!(h.manager.driver().init_count(), 1);
    }

    #[test]
    fn boots_into_access_point_without_credentials() {
        let h = harness(MemoryCredentialStore::default());

        assert_eq!(h.manager.start().unwrap(), StartupMode::AccessPointOnly);
        assert_eq!(h.manager.state(), ConnectionState::AccessPointActive);
        assert!(h.manager.access_point_active());
        assert_eq!(h.sink.signals(), vec![SystemStatus::NetworkOff]);
    }

    #[test]
    fn submit_credentials_persists_and_schedules_restart() {
        let h = harness(MemoryCredentialStore::default());
        h.manager.start().unwrap();

        h.manager.submit_credentials("home", "pw123").unwrap();

        let stored = h.manager.credentials().store().load().unwrap().unwrap();
        assert_eq!((stored.ssid(), stored.password()), ("home", "pw123"));
        assert_eq!(h.restarter.requests(), vec![Duration::from_millis(3_000)]);
    }

    #[test]
    fn rejected_submission_has_no_side_effects() {
        let h = harness(MemoryCredentialStore::with_record(
            Credentials::new("office", "secret-1").unwrap(),
        ));

        assert!(matches!(
            h.manager.submit_credentials("", "pw"),
            Err(ConnectivityError::InvalidCredentials(_))
        ));
        assert_eq!(
            h.manager.credentials().get().unwrap().unwrap().ssid(),
            "office"
        );
        assert!(h.restarter.requests().is_empty());
    }

    #[test]
    fn store_failure_is_reported_without_restart() {
        let h = harness(MemoryCredentialStore::default());
        h.manager.credentials().store().set_fail_saves(true);

        assert!(matches!(
            h.manager.submit_credentials("home", "pw123"),
            Err(ConnectivityError::Store(_))
        ));
        assert!(h.restarter.requests().is_empty());
    }

    #[test]
    fn provisioning_then_reboot_reaches_connected() {
        let store = MemoryCredentialStore::default();
        let first = harness(store);
        first.manager.start().unwrap();
        first.manager.submit_credentials("home", "pw123").unwrap();
        assert_eq!(first.restarter.requests().len(), 1);

        // Simulated restart: a fresh manager over the same persisted record.
        let persisted = first.manager.credentials().store().load().unwrap().unwrap();
        let second = harness(MemoryCredentialStore::with_record(persisted));
        let events = second.manager.subscribe();

        assert_eq!(second.manager.start().unwrap(), StartupMode::Dual);
        assert_eq!(second.manager.state(), ConnectionState::DualActive);

        let driver = second.manager.driver();
        assert!(driver.inject(LinkEvent::StationStarted));
        assert_eq!(second.manager.state(), ConnectionState::StationConnecting);
        assert!(driver.inject(LinkEvent::AddressAcquired(station_info())));

        assert_eq!(second.manager.state(), ConnectionState::StationConnected);
        assert_eq!(
            events.try_recv().unwrap(),
            ConnectivityEvent::Connected(station_info())
        );
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Initialize,
                DriverCall::StartDual {
                    ssid: "home".to_string()
                },
                DriverCall::RequestConnect,
            ]
        );

        let status = second.manager.status();
        assert!(status.connected);
        assert_eq!(status.ssid.as_deref(), Some("home"));
        assert_eq!(status.ip.as_deref(), Some("10.0.0.23"));
        assert_eq!(status.gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(status.ap_ip, "192.168.4.1");
        assert_eq!(
            second.sink.signals().last(),
            Some(&SystemStatus::NetworkConnected)
        );
    }

    #[test]
    fn five_disconnects_fail_but_keep_access_point() {
        let h = harness(MemoryCredentialStore::with_record(
            Credentials::new("home", "pw123").unwrap(),
        ));
        let events = h.manager.subscribe();
        h.manager.start().unwrap();
        h.manager.driver().inject(LinkEvent::StationStarted);

        for _ in 0..5 {
            h.manager
                .driver()
                .inject(LinkEvent::StationDisconnected { reason: 15 });
        }

        assert_eq!(h.manager.state(), ConnectionState::StationFailed);
        assert_eq!(h.manager.retry_count(), 5);
        assert!(h.manager.access_point_active());
        assert_eq!(
            events.try_recv().unwrap(),
            ConnectivityEvent::ConnectionFailed { attempts: 5 }
        );
        // One connect on station start plus four retries.
        assert_eq!(h.manager.driver().connect_requests(), 5);
        assert_eq!(h.sink.count(SystemStatus::NetworkOff), 1);
        assert!(matches!(
            h.manager.wait_for_station(Duration::from_millis(10)),
            Err(ConnectivityError::ConnectRetriesExhausted)
        ));

        h.manager
            .driver()
            .inject(LinkEvent::StationDisconnected { reason: 15 });
        assert_eq!(h.manager.driver().connect_requests(), 5);
    }

    #[test]
    fn resubmitting_after_failure_allows_new_dual_start() {
        let h = harness(MemoryCredentialStore::with_record(
            Credentials::new("home", "wrong").unwrap(),
        ));
        h.manager.start().unwrap();
        h.manager.driver().inject(LinkEvent::StationStarted);
        for _ in 0..5 {
            h.manager
                .driver()
                .inject(LinkEvent::StationDisconnected { reason: 15 });
        }

        h.manager
            .start_dual_mode(Credentials::new("home", "right").unwrap())
            .unwrap();

        assert_eq!(h.manager.state(), ConnectionState::DualActive);
        assert_eq!(h.manager.retry_count(), 0);
    }

    #[test]
    fn wait_for_station_returns_acquired_address() {
        let h = harness(MemoryCredentialStore::with_record(
            Credentials::new("home", "pw123").unwrap(),
        ));
        h.manager.start().unwrap();
        h.manager.driver().inject(LinkEvent::StationStarted);

        let manager = h.manager.clone();
        let waiter =
            std::thread::spawn(move || manager.wait_for_station(Duration::from_secs(5)));
        while h.manager.subscriber_count() < 1 {
            std::thread::yield_now();
        }
        h.manager
            .driver()
            .inject(LinkEvent::AddressAcquired(station_info()));

        assert_eq!(waiter.join().unwrap().unwrap(), station_info());
    }

    #[test]
    fn wait_for_station_times_out() {
        let h = harness(MemoryCredentialStore::with_record(
            Credentials::new("home", "pw123").unwrap(),
        ));
        h.manager.start().unwrap();

        assert!(matches!(
            h.manager.wait_for_station(Duration::from_millis(20)),
            Err(ConnectivityError::Timeout)
        ));
    }

    #[test]
    fn dual_start_failure_falls_back_to_access_point() {
        let h = harness(MemoryCredentialStore::with_record(
            Credentials::new("home", "pw123").unwrap(),
        ));
        h.manager.driver().set_fail_dual(true);

        assert_eq!(h.manager.start().unwrap(), StartupMode::AccessPointOnly);
        assert_eq!(h.manager.state(), ConnectionState::AccessPointActive);
        assert!(h.manager.access_point_active());
        assert_eq!(h.sink.signals(), vec![SystemStatus::NetworkOff]);
        assert_eq!(
            h.manager.driver().calls(),
            vec![
                DriverCall::Initialize,
                DriverCall::StartDual {
                    ssid: "home".to_string()
                },
                DriverCall::StartAccessPoint {
                    ssid: "NetOta-Setup".to_string()
                },
            ]
        );
    }

    #[test]
    fn refused_mode_start_leaves_state_untouched() {
        let h = harness(MemoryCredentialStore::default());
        h.manager.driver().set_fail_access_point(true);

        assert!(matches!(
            h.manager.start(),
            Err(ConnectivityError::Driver(_))
        ));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert!(!h.manager.access_point_active());
        assert!(h.sink.signals().is_empty());

        h.manager.driver().set_fail_access_point(false);
        h.manager.start_access_point_only().unwrap();
        assert_eq!(h.manager.state(), ConnectionState::AccessPointActive);
    }

    impl TestManager {
        fn subscriber_count(&self) -> usize {
            self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
        }
    }
}
