//! Connection state machine.
//!
//! All decisions about the connection live here as plain synchronous
//! methods; each returns the [`Effect`]s the owner loop must carry out
//! (open a socket, arm a timer, send a frame). Nothing in this module
//! performs I/O or reads the clock.

use crate::config::ConnectionConfig;
use crate::connection::network::{NetworkPath, NetworkStatus, did_interface_change};
use crate::protocol::{InboundMessage, OutboundMessage};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Observable properties whose updates are coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    LockedSessions,
    Commands,
    CommandHistory,
    Ack,
}

/// Work the owner loop performs on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport,
    CloseTransport,
    ScheduleReconnect(Duration),
    CancelReconnect,
    Send(OutboundMessage),
    /// Publish the snapshot now, flushing any debounced updates.
    PublishNow,
    /// Publish the snapshot once updates go quiet.
    PublishDebounced(Property),
    /// Hand the message to the session sync layer.
    Forward(InboundMessage),
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(16));
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// A shell command running on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandExecution {
    pub command_session_id: String,
    pub shell_command: Option<String>,
    pub output: String,
    pub exit_code: Option<i32>,
    pub finished: bool,
}

/// Point-in-time view of the connection, published to observers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionSnapshot {
    pub phase: ConnectionPhase,
    pub authenticated: bool,
    pub network: NetworkStatus,
    pub network_available: bool,
    pub requires_reauthentication: bool,
    pub reconnect_attempts: u32,
    pub current_error: Option<String>,
    pub locked_sessions: BTreeSet<String>,
    pub running_commands: BTreeMap<String, CommandExecution>,
    pub command_history: Vec<Value>,
    pub last_ack: Option<String>,
}

impl ConnectionSnapshot {
    /// Connected and past the handshake.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase == ConnectionPhase::Connected && self.authenticated
    }
}

/// Connection state owned by a single loop.
#[derive(Debug)]
pub struct ConnectionMachine {
    heartbeat_interval: Duration,
    api_key: Option<String>,
    backoff: Backoff,

    phase: ConnectionPhase,
    authenticated: bool,
    /// Set by `connect`, cleared by `disconnect`; gates automatic reconnects.
    wants_connection: bool,
    requires_reauthentication: bool,
    session_id: Option<Uuid>,

    network: NetworkStatus,
    network_available: bool,
    last_path: Option<NetworkPath>,
    in_foreground: bool,

    heartbeat_monitoring: bool,
    last_heartbeat_received: Option<DateTime<Utc>>,
    reconnect_pending: bool,
    pending_outbound: Vec<OutboundMessage>,

    locked_sessions: BTreeSet<String>,
    running_commands: BTreeMap<String, CommandExecution>,
    command_history: Vec<Value>,
    last_ack: Option<String>,
    current_error: Option<String>,
}

impl ConnectionMachine {
    #[must_use]
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            api_key: config.api_key.clone(),
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_base_delay_ms),
                Duration::from_millis(config.reconnect_max_delay_ms),
            ),
            phase: ConnectionPhase::Disconnected,
            authenticated: false,
            wants_connection: false,
            requires_reauthentication: false,
            session_id: None,
            network: NetworkStatus::Unknown,
            // Until the path monitor reports, assume a connection can be attempted
            network_available: true,
            last_path: None,
            in_foreground: true,
            heartbeat_monitoring: false,
            last_heartbeat_received: None,
            reconnect_pending: false,
            pending_outbound: Vec::new(),
            locked_sessions: BTreeSet::new(),
            running_commands: BTreeMap::new(),
            command_history: Vec::new(),
            last_ack: None,
            current_error: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    #[must_use]
    pub fn is_monitoring_heartbeat(&self) -> bool {
        self.heartbeat_monitoring
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    #[must_use]
    pub fn last_heartbeat_received(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_received
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    #[must_use]
    pub fn is_reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    #[must_use]
    pub fn network_available(&self) -> bool {
        self.network_available
    }

    #[must_use]
    pub fn pending_outbound(&self) -> &[OutboundMessage] {
        &self.pending_outbound
    }

    /// Build the observable view of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            phase: self.phase,
            authenticated: self.authenticated,
            network: self.network,
            network_available: self.network_available,
            requires_reauthentication: self.requires_reauthentication,
            reconnect_attempts: self.backoff.attempts(),
            current_error: self.current_error.clone(),
            locked_sessions: self.locked_sessions.clone(),
            running_commands: self.running_commands.clone(),
            command_history: self.command_history.clone(),
            last_ack: self.last_ack.clone(),
        }
    }

    fn should_auto_reconnect(&self) -> bool {
        self.wants_connection && self.network_available && !self.requires_reauthentication
    }

    /// Clear everything that only makes sense for one transport.
    fn reset_ephemeral(&mut self) {
        self.authenticated = false;
        self.heartbeat_monitoring = false;
        self.last_heartbeat_received = None;
        self.locked_sessions.clear();
        self.running_commands.clear();
    }

    fn begin_connect(&mut self) -> Vec<Effect> {
        self.phase = ConnectionPhase::Connecting;
        self.reconnect_pending = false;
        vec![Effect::CancelReconnect, Effect::OpenTransport, Effect::PublishNow]
    }

    fn schedule_reconnect(&mut self) -> Vec<Effect> {
        if !self.should_auto_reconnect() {
            debug!(
                network_available = self.network_available,
                wants_connection = self.wants_connection,
                "not scheduling reconnect"
            );
            return Vec::new();
        }
        let delay = self.backoff.next_delay();
        self.reconnect_pending = true;
        info!(
            attempt = self.backoff.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        vec![Effect::ScheduleReconnect(delay)]
    }

    /// Ask for a connection, optionally announcing a session in the handshake.
    pub fn connect(&mut self, session_id: Option<Uuid>) -> Vec<Effect> {
        self.wants_connection = true;
        self.requires_reauthentication = false;
        if session_id.is_some() {
            self.session_id = session_id;
        }
        if self.phase != ConnectionPhase::Disconnected {
            return Vec::new();
        }
        info!("connecting");
        self.begin_connect()
    }

    /// Tear down the connection and stop reconnecting. Idempotent.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        if self.phase != ConnectionPhase::Disconnected {
            info!("disconnecting");
        }
        self.wants_connection = false;
        self.phase = ConnectionPhase::Disconnected;
        self.reconnect_pending = false;
        self.pending_outbound.clear();
        self.reset_ephemeral();
        vec![Effect::CancelReconnect, Effect::CloseTransport, Effect::PublishNow]
    }

    /// The transport finished opening; start the handshake.
    pub fn transport_opened(&mut self) -> Vec<Effect> {
        if self.phase != ConnectionPhase::Connecting {
            debug!(phase = ?self.phase, "discarding transport opened after cancellation");
            return vec![Effect::CloseTransport];
        }
        info!("transport open, authenticating");
        self.phase = ConnectionPhase::Connected;
        self.authenticated = false;
        self.current_error = None;
        vec![
            Effect::Send(OutboundMessage::Connect {
                session_id: self.session_id,
                api_key: self.api_key.clone(),
            }),
            Effect::PublishNow,
        ]
    }

    /// The transport failed to open or dropped mid-stream.
    pub fn transport_failed(&mut self, reason: &str) -> Vec<Effect> {
        warn!(reason, "transport failure");
        self.phase = ConnectionPhase::Disconnected;
        self.current_error = Some(reason.to_string());
        self.reset_ephemeral();
        let mut effects = vec![Effect::CloseTransport];
        effects.extend(self.schedule_reconnect());
        effects.push(Effect::PublishNow);
        effects
    }

    /// The reconnect timer elapsed.
    pub fn reconnect_timer_fired(&mut self) -> Vec<Effect> {
        self.reconnect_pending = false;
        if self.phase == ConnectionPhase::Disconnected && self.should_auto_reconnect() {
            self.begin_connect()
        } else {
            Vec::new()
        }
    }

    /// Queue or send an outbound frame.
    ///
    /// Frames that need an authenticated connection are buffered until the
    /// handshake completes; a newer subscription request for a session
    /// replaces a buffered one.
    pub fn send(&mut self, message: OutboundMessage) -> Vec<Effect> {
        if !message.requires_auth() {
            return if self.phase == ConnectionPhase::Connected {
                vec![Effect::Send(message)]
            } else {
                Vec::new()
            };
        }

        if self.phase == ConnectionPhase::Connected && self.authenticated {
            return vec![Effect::Send(message)];
        }

        if let Some(target) = subscription_target(&message) {
            self.pending_outbound
                .retain(|m| subscription_target(m) != Some(target));
        }
        debug!(pending = self.pending_outbound.len() + 1, "buffering outbound until authenticated");
        self.pending_outbound.push(message);
        Vec::new()
    }

    /// Apply an inbound frame.
    pub fn handle_inbound(&mut self, message: InboundMessage, now: DateTime<Utc>) -> Vec<Effect> {
        match message {
            InboundMessage::Connected { .. } => {
                info!(flushing = self.pending_outbound.len(), "authenticated");
                self.authenticated = true;
                self.requires_reauthentication = false;
                self.current_error = None;
                self.backoff.reset();
                self.heartbeat_monitoring = self.in_foreground;
                self.last_heartbeat_received = None;
                let mut effects: Vec<Effect> = self
                    .pending_outbound
                    .drain(..)
                    .map(Effect::Send)
                    .collect();
                effects.push(Effect::PublishNow);
                effects.push(Effect::Forward(message));
                effects
            }
            InboundMessage::AuthError { message } => {
                warn!(%message, "authentication rejected");
                self.phase = ConnectionPhase::Disconnected;
                self.requires_reauthentication = true;
                self.reconnect_pending = false;
                self.current_error = Some(message);
                self.reset_ephemeral();
                vec![Effect::CancelReconnect, Effect::CloseTransport, Effect::PublishNow]
            }
            InboundMessage::Heartbeat { .. } => {
                self.last_heartbeat_received = Some(now);
                Vec::new()
            }
            InboundMessage::Pong => {
                debug!("pong");
                Vec::new()
            }
            InboundMessage::SessionHistory { .. }
            | InboundMessage::SessionCreated { .. }
            | InboundMessage::SessionList { .. } => vec![Effect::Forward(message)],
            InboundMessage::SessionLocked { session_id } => {
                self.locked_sessions.insert(session_id);
                vec![Effect::PublishDebounced(Property::LockedSessions)]
            }
            InboundMessage::TurnComplete { session_id } => {
                self.locked_sessions.remove(&session_id);
                vec![Effect::PublishDebounced(Property::LockedSessions)]
            }
            InboundMessage::CommandStarted {
                command_session_id,
                shell_command,
            } => {
                self.running_commands.insert(
                    command_session_id.clone(),
                    CommandExecution {
                        command_session_id,
                        shell_command,
                        ..Default::default()
                    },
                );
                vec![Effect::PublishDebounced(Property::Commands)]
            }
            InboundMessage::CommandOutput {
                command_session_id,
                text,
                ..
            } => {
                let execution = self.command_entry(command_session_id);
                if !execution.output.is_empty() && !execution.output.ends_with('\n') {
                    execution.output.push('\n');
                }
                execution.output.push_str(&text);
                vec![Effect::PublishDebounced(Property::Commands)]
            }
            InboundMessage::CommandComplete {
                command_session_id,
                exit_code,
            } => {
                let execution = self.command_entry(command_session_id);
                execution.exit_code = exit_code;
                execution.finished = true;
                vec![Effect::PublishDebounced(Property::Commands)]
            }
            InboundMessage::CommandOutputFull {
                command_session_id,
                output,
                exit_code,
            } => {
                let execution = self.command_entry(command_session_id);
                execution.output = output;
                if exit_code.is_some() {
                    execution.exit_code = exit_code;
                    execution.finished = true;
                }
                vec![Effect::PublishDebounced(Property::Commands)]
            }
            InboundMessage::CommandHistory { sessions } => {
                self.command_history = sessions;
                vec![Effect::PublishDebounced(Property::CommandHistory)]
            }
            InboundMessage::ServerError {
                message,
                session_id,
            } => {
                warn!(%message, ?session_id, "server error");
                if let Some(id) = session_id {
                    self.locked_sessions.remove(&id);
                }
                self.current_error = Some(message);
                vec![Effect::PublishNow]
            }
            InboundMessage::Ack { message } => {
                self.last_ack = message;
                vec![Effect::PublishDebounced(Property::Ack)]
            }
            InboundMessage::Unknown => {
                debug!("ignoring unknown message type");
                Vec::new()
            }
        }
    }

    fn command_entry(&mut self, command_session_id: String) -> &mut CommandExecution {
        self.running_commands
            .entry(command_session_id.clone())
            .or_insert_with(|| CommandExecution {
                command_session_id,
                ..Default::default()
            })
    }

    /// Periodic zombie check.
    ///
    /// A connected, authenticated client that has heard no heartbeat for two
    /// intervals drops the transport and resets its backoff. It reconnects
    /// right away when the network allows, otherwise it waits disconnected
    /// until the network returns. A server that never sent a heartbeat is
    /// left alone.
    pub fn check_heartbeat_timeout(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let Some(last) = self.last_heartbeat_received else {
            return Vec::new();
        };
        if self.phase != ConnectionPhase::Connected || !self.authenticated {
            return Vec::new();
        }

        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed <= self.heartbeat_interval.saturating_mul(2) {
            return Vec::new();
        }

        warn!(
            silent_for_secs = elapsed.as_secs(),
            "no heartbeat received, connection is a zombie"
        );
        self.backoff.reset();
        self.reset_ephemeral();

        if !self.should_auto_reconnect() {
            // Drop the dead transport; the network or a new connect brings it back
            debug!("zombie detected but reconnect not possible right now");
            self.phase = ConnectionPhase::Disconnected;
            self.reconnect_pending = false;
            return vec![Effect::CloseTransport, Effect::PublishNow];
        }

        let mut effects = vec![Effect::CloseTransport];
        effects.extend(self.begin_connect());
        effects
    }

    /// A new observation from the network path monitor.
    pub fn network_path_changed(&mut self, path: NetworkPath) -> Vec<Effect> {
        let interface_changed = did_interface_change(self.last_path.as_ref(), &path);
        let status = path.network_status();
        let was_available = self.network_available;
        let available = status.is_available();

        self.network = status;
        self.network_available = available;
        self.last_path = Some(path);

        let mut effects = Vec::new();
        if available && !was_available {
            info!(?status, "network available");
            self.backoff.reset();
            if self.phase == ConnectionPhase::Disconnected && self.should_auto_reconnect() {
                effects.extend(self.begin_connect());
            }
        } else if !available && was_available {
            info!(?status, "network unavailable");
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        } else if available && interface_changed && self.phase == ConnectionPhase::Connected {
            info!("network interface changed, reconnecting");
            self.backoff.reset();
            self.reset_ephemeral();
            effects.push(Effect::CloseTransport);
            effects.extend(self.begin_connect());
        }
        effects.push(Effect::PublishNow);
        effects
    }

    /// The app came back to the foreground.
    pub fn app_foregrounded(&mut self) -> Vec<Effect> {
        self.in_foreground = true;
        if self.phase == ConnectionPhase::Disconnected && self.should_auto_reconnect() {
            info!("foregrounded while disconnected, reconnecting now");
            self.backoff.reset();
            return self.begin_connect();
        }
        if self.phase == ConnectionPhase::Connected && self.authenticated {
            self.heartbeat_monitoring = true;
        }
        Vec::new()
    }

    /// The app moved to the background; timers stop firing there.
    pub fn app_backgrounded(&mut self) -> Vec<Effect> {
        self.in_foreground = false;
        self.heartbeat_monitoring = false;
        Vec::new()
    }
}

/// Session a subscribe/unsubscribe frame refers to.
fn subscription_target(message: &OutboundMessage) -> Option<Uuid> {
    match message {
        OutboundMessage::Subscribe { session_id, .. }
        | OutboundMessage::Unsubscribe { session_id } => Some(*session_id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::network::InterfaceType;
    use chrono::Duration as ChronoDuration;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(&ConnectionConfig::default())
    }

    fn connected() -> ConnectionMachine {
        let mut m = machine();
        m.connect(None);
        m.transport_opened();
        m.handle_inbound(
            InboundMessage::Connected {
                message: None,
                session_id: None,
            },
            Utc::now(),
        );
        m
    }

    fn subscribe(id: Uuid, cursor: Option<Uuid>) -> OutboundMessage {
        OutboundMessage::Subscribe {
            session_id: id,
            last_message_id: cursor,
        }
    }

    #[test]
    fn connect_opens_transport_then_handshakes() {
        let mut m = machine();
        let effects = m.connect(None);
        assert!(effects.contains(&Effect::OpenTransport));
        assert_eq!(m.phase(), ConnectionPhase::Connecting);

        let effects = m.transport_opened();
        assert_eq!(m.phase(), ConnectionPhase::Connected);
        assert!(!m.is_authenticated());
        assert!(matches!(
            effects[0],
            Effect::Send(OutboundMessage::Connect { .. })
        ));
    }

    #[test]
    fn connect_while_connecting_is_noop() {
        let mut m = machine();
        m.connect(None);
        assert!(m.connect(None).is_empty());
    }

    #[test]
    fn authentication_starts_monitoring_and_flushes_pending() {
        let mut m = machine();
        m.connect(None);
        m.transport_opened();
        let id = Uuid::new_v4();
        assert!(m.send(subscribe(id, None)).is_empty());
        assert_eq!(m.pending_outbound().len(), 1);

        let effects = m.handle_inbound(
            InboundMessage::Connected {
                message: None,
                session_id: None,
            },
            Utc::now(),
        );

        assert!(m.is_authenticated());
        assert!(m.is_monitoring_heartbeat());
        assert_eq!(effects[0], Effect::Send(subscribe(id, None)));
        assert!(m.pending_outbound().is_empty());
    }

    #[test]
    fn newer_subscribe_replaces_buffered_one() {
        let mut m = machine();
        let id = Uuid::new_v4();
        let cursor = Uuid::new_v4();
        m.send(subscribe(id, None));
        m.send(subscribe(id, Some(cursor)));

        assert_eq!(m.pending_outbound(), [subscribe(id, Some(cursor))]);
    }

    #[test]
    fn ping_is_dropped_while_disconnected() {
        let mut m = machine();
        assert!(m.send(OutboundMessage::Ping).is_empty());
        assert!(m.pending_outbound().is_empty());
    }

    #[test]
    fn disconnect_clears_ephemeral_state() {
        let mut m = connected();
        m.handle_inbound(
            InboundMessage::SessionLocked {
                session_id: "s1".to_string(),
            },
            Utc::now(),
        );
        m.handle_inbound(
            InboundMessage::CommandStarted {
                command_session_id: "c1".to_string(),
                shell_command: Some("make".to_string()),
            },
            Utc::now(),
        );
        m.handle_inbound(InboundMessage::Heartbeat { timestamp: None }, Utc::now());

        let effects = m.disconnect();

        assert!(effects.contains(&Effect::CloseTransport));
        assert!(effects.contains(&Effect::CancelReconnect));
        let snapshot = m.snapshot();
        assert_eq!(snapshot.phase, ConnectionPhase::Disconnected);
        assert!(snapshot.locked_sessions.is_empty());
        assert!(snapshot.running_commands.is_empty());
        assert!(m.last_heartbeat_received().is_none());
        assert!(!m.is_monitoring_heartbeat());

        // Idempotent
        m.disconnect();
        assert_eq!(m.snapshot(), snapshot);
    }

    #[test]
    fn heartbeat_timeout_detects_zombie() {
        let mut m = connected();
        m.backoff.attempts = 4;
        let now = Utc::now();
        m.last_heartbeat_received = Some(now - ChronoDuration::seconds(100));

        let effects = m.check_heartbeat_timeout(now);

        assert_eq!(m.reconnect_attempts(), 0);
        assert!(!m.is_monitoring_heartbeat());
        assert!(effects.contains(&Effect::CloseTransport));
        assert!(effects.contains(&Effect::OpenTransport));
        assert_eq!(m.phase(), ConnectionPhase::Connecting);
    }

    #[test]
    fn heartbeat_within_window_is_healthy() {
        let mut m = connected();
        m.backoff.attempts = 4;
        let now = Utc::now();
        m.last_heartbeat_received = Some(now - ChronoDuration::seconds(89));

        assert!(m.check_heartbeat_timeout(now).is_empty());
        assert_eq!(m.reconnect_attempts(), 4);
        assert!(m.is_monitoring_heartbeat());
    }

    #[test]
    fn missing_heartbeat_support_is_tolerated() {
        let mut m = connected();
        m.backoff.attempts = 2;

        assert!(m.last_heartbeat_received().is_none());
        assert!(m.check_heartbeat_timeout(Utc::now()).is_empty());
        assert_eq!(m.reconnect_attempts(), 2);
        assert!(m.is_monitoring_heartbeat());
        assert!(m.snapshot().is_ready());
    }

    #[test]
    fn zombie_without_network_resets_but_does_not_reconnect() {
        let mut m = connected();
        m.network_available = false;
        m.backoff.attempts = 3;
        let now = Utc::now();
        m.last_heartbeat_received = Some(now - ChronoDuration::seconds(100));

        let effects = m.check_heartbeat_timeout(now);

        assert_eq!(effects, [Effect::CloseTransport, Effect::PublishNow]);
        assert_eq!(m.reconnect_attempts(), 0);
        assert!(!m.is_monitoring_heartbeat());
        assert_eq!(m.phase(), ConnectionPhase::Disconnected);
        assert!(!m.is_authenticated());
    }

    #[test]
    fn zombie_found_offline_reconnects_when_network_returns() {
        let mut m = connected();
        m.network_path_changed(NetworkPath::satisfied(InterfaceType::Wifi));
        let now = Utc::now();
        m.handle_inbound(InboundMessage::Heartbeat { timestamp: None }, now);

        m.network_path_changed(NetworkPath::unsatisfied());
        let effects = m.check_heartbeat_timeout(now + ChronoDuration::seconds(100));
        assert!(effects.contains(&Effect::CloseTransport));
        assert!(!effects.contains(&Effect::OpenTransport));
        assert!(!m.snapshot().is_ready());

        let effects = m.network_path_changed(NetworkPath::satisfied(InterfaceType::Wifi));

        assert!(effects.contains(&Effect::OpenTransport));
        assert_eq!(m.phase(), ConnectionPhase::Connecting);
    }

    #[test]
    fn zombie_pending_reauth_does_not_reconnect() {
        let mut m = connected();
        m.requires_reauthentication = true;
        let now = Utc::now();
        m.last_heartbeat_received = Some(now - ChronoDuration::seconds(100));

        let effects = m.check_heartbeat_timeout(now);

        assert!(!effects.contains(&Effect::OpenTransport));
        assert!(!m.is_monitoring_heartbeat());
        assert_eq!(m.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn huge_heartbeat_interval_does_not_overflow() {
        let mut m = ConnectionMachine::new(&ConnectionConfig {
            heartbeat_interval_seconds: u64::MAX,
            ..ConnectionConfig::default()
        });
        m.connect(None);
        m.transport_opened();
        let now = Utc::now();
        m.handle_inbound(
            InboundMessage::Connected {
                message: None,
                session_id: None,
            },
            now,
        );
        m.handle_inbound(InboundMessage::Heartbeat { timestamp: None }, now);

        assert!(m.check_heartbeat_timeout(now + ChronoDuration::seconds(1)).is_empty());
        assert!(m.snapshot().is_ready());
    }

    #[test]
    fn heartbeat_check_requires_authentication() {
        let mut m = machine();
        m.connect(None);
        m.transport_opened();
        let now = Utc::now();
        m.last_heartbeat_received = Some(now - ChronoDuration::seconds(500));

        assert!(m.check_heartbeat_timeout(now).is_empty());
    }

    #[test]
    fn transport_failure_schedules_growing_backoff() {
        let mut m = machine();
        m.connect(None);

        let first = m.transport_failed("refused");
        assert!(first.contains(&Effect::ScheduleReconnect(Duration::from_secs(1))));
        assert_eq!(m.snapshot().current_error.as_deref(), Some("refused"));

        m.reconnect_timer_fired();
        let second = m.transport_failed("refused");
        assert!(second.contains(&Effect::ScheduleReconnect(Duration::from_secs(2))));
        assert_eq!(m.reconnect_attempts(), 2);
    }

    #[test]
    fn backoff_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn no_reconnect_scheduled_without_network() {
        let mut m = machine();
        m.connect(None);
        m.network_path_changed(NetworkPath::unsatisfied());

        let effects = m.transport_failed("offline");

        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleReconnect(_))));
        assert!(!m.is_reconnect_pending());
    }

    #[test]
    fn network_loss_cancels_pending_reconnect() {
        let mut m = machine();
        m.connect(None);
        m.transport_failed("dropped");
        assert!(m.is_reconnect_pending());

        let effects = m.network_path_changed(NetworkPath::unsatisfied());

        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(!m.is_reconnect_pending());
    }

    #[test]
    fn network_restore_resets_backoff_and_reconnects() {
        let mut m = machine();
        m.connect(None);
        m.transport_failed("dropped");
        m.network_path_changed(NetworkPath::unsatisfied());
        assert_eq!(m.reconnect_attempts(), 1);

        let effects = m.network_path_changed(NetworkPath::satisfied(InterfaceType::Wifi));

        assert_eq!(m.reconnect_attempts(), 0);
        assert!(effects.contains(&Effect::OpenTransport));
    }

    #[test]
    fn interface_change_while_connected_reconnects() {
        let mut m = connected();
        m.network_path_changed(NetworkPath::satisfied(InterfaceType::Wifi));

        let effects = m.network_path_changed(NetworkPath::satisfied(InterfaceType::Cellular));

        assert!(effects.contains(&Effect::CloseTransport));
        assert!(effects.contains(&Effect::OpenTransport));
        assert!(!m.is_authenticated());
    }

    #[test]
    fn constrained_toggle_keeps_connection() {
        let mut m = connected();
        m.network_path_changed(NetworkPath::satisfied(InterfaceType::Wifi));

        let effects =
            m.network_path_changed(NetworkPath::satisfied(InterfaceType::Wifi).constrained());

        assert_eq!(effects, [Effect::PublishNow]);
        assert!(m.is_authenticated());
        assert_eq!(m.snapshot().network, NetworkStatus::Constrained);
    }

    #[test]
    fn foreground_reconnects_immediately() {
        let mut m = machine();
        m.connect(None);
        m.transport_failed("dropped");
        m.app_backgrounded();

        let effects = m.app_foregrounded();

        assert_eq!(m.reconnect_attempts(), 0);
        assert!(effects.contains(&Effect::OpenTransport));
    }

    #[test]
    fn background_stops_heartbeat_monitoring() {
        let mut m = connected();
        m.app_backgrounded();
        assert!(!m.is_monitoring_heartbeat());

        m.app_foregrounded();
        assert!(m.is_monitoring_heartbeat());
    }

    #[test]
    fn auth_error_blocks_automatic_reconnect() {
        let mut m = machine();
        m.connect(None);
        m.transport_opened();

        let effects = m.handle_inbound(
            InboundMessage::AuthError {
                message: "bad key".to_string(),
            },
            Utc::now(),
        );

        assert!(effects.contains(&Effect::CloseTransport));
        assert!(m.snapshot().requires_reauthentication);
        assert!(m.reconnect_timer_fired().is_empty());
        assert!(m.app_foregrounded().is_empty());

        // An explicit connect retries
        assert!(m.connect(None).contains(&Effect::OpenTransport));
    }

    #[test]
    fn property_updates_are_debounced() {
        let mut m = connected();
        let locked = m.handle_inbound(
            InboundMessage::SessionLocked {
                session_id: "s1".to_string(),
            },
            Utc::now(),
        );
        assert_eq!(locked, [Effect::PublishDebounced(Property::LockedSessions)]);

        let output = m.handle_inbound(
            InboundMessage::CommandOutput {
                command_session_id: "c1".to_string(),
                stream: None,
                text: "line".to_string(),
            },
            Utc::now(),
        );
        assert_eq!(output, [Effect::PublishDebounced(Property::Commands)]);
    }

    #[test]
    fn server_error_publishes_immediately_and_unlocks() {
        let mut m = connected();
        m.handle_inbound(
            InboundMessage::SessionLocked {
                session_id: "s1".to_string(),
            },
            Utc::now(),
        );

        let effects = m.handle_inbound(
            InboundMessage::ServerError {
                message: "boom".to_string(),
                session_id: Some("s1".to_string()),
            },
            Utc::now(),
        );

        assert_eq!(effects, [Effect::PublishNow]);
        let snapshot = m.snapshot();
        assert!(snapshot.locked_sessions.is_empty());
        assert_eq!(snapshot.current_error.as_deref(), Some("boom"));
    }

    #[test]
    fn command_output_accumulates_and_full_output_replaces() {
        let mut m = connected();
        let now = Utc::now();
        for text in ["one", "two"] {
            m.handle_inbound(
                InboundMessage::CommandOutput {
                    command_session_id: "c1".to_string(),
                    stream: Some("stdout".to_string()),
                    text: text.to_string(),
                },
                now,
            );
        }
        assert_eq!(m.snapshot().running_commands["c1"].output, "one\ntwo");

        m.handle_inbound(
            InboundMessage::CommandOutputFull {
                command_session_id: "c1".to_string(),
                output: "complete".to_string(),
                exit_code: Some(0),
            },
            now,
        );
        let snapshot = m.snapshot();
        let command = &snapshot.running_commands["c1"];
        assert_eq!(command.output, "complete");
        assert!(command.finished);
        assert_eq!(command.exit_code, Some(0));
    }

    #[test]
    fn sync_messages_are_forwarded() {
        let mut m = connected();
        let message = InboundMessage::SessionHistory {
            session_id: "s".to_string(),
            messages: vec![],
        };
        assert_eq!(
            m.handle_inbound(message.clone(), Utc::now()),
            [Effect::Forward(message)]
        );
    }
}
