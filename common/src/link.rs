use crate::{
    error::ConnectivityError,
    status::SystemStatus,
    types::{ConnectionState, ConnectivityEvent, LinkEvent, StationInfo},
};

/// Side effects requested by the state machine. The caller executes them after
/// releasing whatever lock guards the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    RequestConnect,
    AccessPoint(bool),
    Notify(ConnectivityEvent),
    Signal(SystemStatus),
}

#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    max_retry: u8,
    state: ConnectionState,
    retry_count: u8,
    access_point_active: bool,
    station: Option<StationInfo>,
    ap_peers: u8,
}

impl LinkStateMachine {
    pub fn new(max_retry: u8) -> Self {
        Self {
            max_retry: max_retry.max(1),
            state: ConnectionState::Idle,
            retry_count: 0,
            access_point_active: false,
            station: None,
            ap_peers: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn max_retry(&self) -> u8 {
        self.max_retry
    }

    pub fn access_point_active(&self) -> bool {
        self.access_point_active
    }

    pub fn station(&self) -> Option<StationInfo> {
        self.station
    }

    pub fn ap_peers(&self) -> u8 {
        self.ap_peers
    }

    pub fn start_access_point(&mut self) -> Result<Vec<LinkAction>, ConnectivityError> {
        if self.state != ConnectionState::Idle {
            return Err(ConnectivityError::InvalidTransition { from: self.state });
        }

        self.state = ConnectionState::AccessPointActive;
        self.access_point_active = true;
        Ok(vec![
            LinkAction::AccessPoint(true),
            LinkAction::Signal(SystemStatus::NetworkOff),
        ])
    }

    /// Entering dual mode is the only way out of `StationFailed`.
    pub fn start_dual(&mut self) -> Result<Vec<LinkAction>, ConnectivityError> {
        match self.state {
            ConnectionState::Idle
            | ConnectionState::AccessPointActive
            | ConnectionState::StationFailed => {}
            other => return Err(ConnectivityError::InvalidTransition { from: other }),
        }

        self.state = ConnectionState::DualActive;
        self.retry_count = 0;
        self.station = None;
        self.access_point_active = true;
        Ok(vec![LinkAction::AccessPoint(true)])
    }

    /// Applies one driver event. Events without an edge from the current state
    /// return no actions and leave the machine unchanged.
    pub fn handle(&mut self, event: &LinkEvent) -> Vec<LinkAction> {
        let mut actions = Vec::new();

        match event {
            LinkEvent::StationStarted => {
                if self.state == ConnectionState::DualActive {
                    self.state = ConnectionState::StationConnecting;
                    actions.push(LinkAction::RequestConnect);
                }
            }
            LinkEvent::StationDisconnected { .. } => {
                if self.station_active() {
                    self.on_disconnected(&mut actions);
                }
            }
            LinkEvent::AddressAcquired(info) => {
                if matches!(
                    self.state,
                    ConnectionState::StationConnecting
                        | ConnectionState::StationConnected
                        | ConnectionState::StationDisconnected
                ) {
                    self.retry_count = 0;
                    self.station = Some(*info);
                    self.state = ConnectionState::StationConnected;
                    actions.push(LinkAction::Notify(ConnectivityEvent::Connected(*info)));
                    actions.push(LinkAction::Signal(SystemStatus::NetworkConnected));
                }
            }
            LinkEvent::PeerJoined { .. } => {
                self.ap_peers = self.ap_peers.saturating_add(1);
            }
            LinkEvent::PeerLeft { .. } => {
                self.ap_peers = self.ap_peers.saturating_sub(1);
            }
        }

        actions
    }

    fn station_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::DualActive
                | ConnectionState::StationConnecting
                | ConnectionState::StationConnected
                | ConnectionState::StationDisconnected
        )
    }

    fn on_disconnected(&mut self, actions: &mut Vec<LinkAction>) {
        let was_connected = self.state == ConnectionState::StationConnected;
        self.station = None;
        self.retry_count = self.retry_count.saturating_add(1).min(self.max_retry);

        if self.retry_count < self.max_retry {
            self.state = ConnectionState::StationDisconnected;
            actions.push(LinkAction::RequestConnect);
            if was_connected {
                actions.push(LinkAction::Signal(SystemStatus::NetworkOff));
            }
            return;
        }

        self.state = ConnectionState::StationFailed;
        actions.push(LinkAction::Notify(ConnectivityEvent::ConnectionFailed {
            attempts: self.retry_count,
        }));
        actions.push(LinkAction::Signal(SystemStatus::NetworkOff));
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;

    fn station_info() -> StationInfo {
        StationInfo {
            ip: Ipv4Addr::new(192, 168, 1, 42),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        }
    }

    fn disconnected() -> LinkEvent {
        LinkEvent::StationDisconnected { reason: 201 }
    }

    fn connecting_machine(max_retry: u8) -> LinkStateMachine {
        let mut machine = LinkStateMachine::new(max_retry);
        machine.start_dual().unwrap();
        assert_eq!(
            machine.handle(&LinkEvent::StationStarted),
            vec![LinkAction::RequestConnect]
        );
        machine
    }

    #[test]
    fn access_point_only_from_idle() {
        let mut machine = LinkStateMachine::new(5);
        machine.start_access_point().unwrap();

        assert_eq!(machine.state(), ConnectionState::AccessPointActive);
        assert!(machine.access_point_active());
        assert!(matches!(
            machine.start_access_point(),
            Err(ConnectivityError::InvalidTransition {
                from: ConnectionState::AccessPointActive
            })
        ));
    }

    #[test]
    fn station_events_are_ignored_without_station_mode() {
        let mut machine = LinkStateMachine::new(5);
        machine.start_access_point().unwrap();

        assert!(machine.handle(&LinkEvent::StationStarted).is_empty());
        assert!(machine.handle(&disconnected()).is_empty());
        assert!(machine
            .handle(&LinkEvent::AddressAcquired(station_info()))
            .is_empty());
        assert_eq!(machine.state(), ConnectionState::AccessPointActive);
        assert_eq!(machine.retry_count(), 0);
    }

    #[test]
    fn disconnects_retry_until_bound_then_fail() {
        let mut machine = connecting_machine(5);

        for attempt in 1..5 {
            let actions = machine.handle(&disconnected());
            assert_eq!(actions, vec![LinkAction::RequestConnect]);
            assert_eq!(machine.retry_count(), attempt);
            assert_eq!(machine.state(), ConnectionState::StationDisconnected);
        }

        let actions = machine.handle(&disconnected());
        assert_eq!(
            actions,
            vec![
                LinkAction::Notify(ConnectivityEvent::ConnectionFailed { attempts: 5 }),
                LinkAction::Signal(SystemStatus::NetworkOff),
            ]
        );
        assert_eq!(machine.state(), ConnectionState::StationFailed);
        assert!(machine.access_point_active());
    }

    #[test]
    fn failed_state_is_sticky_and_counter_bounded() {
        let mut machine = connecting_machine(3);
        for _ in 0..10 {
            let _ = machine.handle(&disconnected());
            assert!(machine.retry_count() <= 3);
        }

        assert_eq!(machine.state(), ConnectionState::StationFailed);
        assert!(machine.handle(&LinkEvent::StationStarted).is_empty());
        assert!(machine
            .handle(&LinkEvent::AddressAcquired(station_info()))
            .is_empty());
        assert_eq!(machine.state(), ConnectionState::StationFailed);
        assert_eq!(machine.station(), None);
        assert_eq!(machine.retry_count(), 3);
    }

    #[test]
    fn address_before_station_start_is_ignored() {
        let mut machine = LinkStateMachine::new(5);
        machine.start_dual().unwrap();

        assert!(machine
            .handle(&LinkEvent::AddressAcquired(station_info()))
            .is_empty());
        assert_eq!(machine.state(), ConnectionState::DualActive);
        assert_eq!(machine.station(), None);
    }

    #[test]
    fn address_acquired_resets_counter() {
        let mut machine = connecting_machine(5);
        for _ in 0..4 {
            let _ = machine.handle(&disconnected());
        }
        assert_eq!(machine.retry_count(), 4);

        let actions = machine.handle(&LinkEvent::AddressAcquired(station_info()));

        assert_eq!(machine.retry_count(), 0);
        assert_eq!(machine.state(), ConnectionState::StationConnected);
        assert_eq!(machine.station(), Some(station_info()));
        assert_eq!(
            actions,
            vec![
                LinkAction::Notify(ConnectivityEvent::Connected(station_info())),
                LinkAction::Signal(SystemStatus::NetworkConnected),
            ]
        );
    }

    #[test]
    fn dropping_a_live_link_signals_network_off_and_retries() {
        let mut machine = connecting_machine(5);
        let _ = machine.handle(&LinkEvent::AddressAcquired(station_info()));

        let actions = machine.handle(&disconnected());

        assert_eq!(
            actions,
            vec![
                LinkAction::RequestConnect,
                LinkAction::Signal(SystemStatus::NetworkOff),
            ]
        );
        assert_eq!(machine.station(), None);
        assert_eq!(machine.retry_count(), 1);
    }

    #[test]
    fn explicit_dual_start_leaves_failed_state() {
        let mut machine = connecting_machine(1);
        let _ = machine.handle(&disconnected());
        assert_eq!(machine.state(), ConnectionState::StationFailed);

        machine.start_dual().unwrap();

        assert_eq!(machine.state(), ConnectionState::DualActive);
        assert_eq!(machine.retry_count(), 0);
        assert!(matches!(
            machine.start_dual(),
            Err(ConnectivityError::InvalidTransition {
                from: ConnectionState::DualActive
            })
        ));
    }

    #[test]
    fn peer_events_only_track_count() {
        let mut machine = LinkStateMachine::new(5);
        machine.start_access_point().unwrap();

        let mac = [0x24, 0x6f, 0x28, 0x00, 0x00, 0x01];
        assert!(machine
            .handle(&LinkEvent::PeerJoined { mac, aid: 1 })
            .is_empty());
        assert_eq!(machine.ap_peers(), 1);
        let _ = machine.handle(&LinkEvent::PeerLeft { mac, aid: 1 });
        let _ = machine.handle(&LinkEvent::PeerLeft { mac, aid: 1 });

        assert_eq!(machine.ap_peers(), 0);
        assert_eq!(machine.state(), ConnectionState::AccessPointActive);
    }
}
