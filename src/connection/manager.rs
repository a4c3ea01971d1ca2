//! Async owner of the websocket transport.
//!
//! A single task owns the socket, the timers and the [`ConnectionMachine`].
//! Callers talk to it through a [`ConnectionHandle`]; the current state is
//! published on a watch channel and sync traffic is forwarded on an
//! unbounded channel.

use crate::config::ConnectionConfig;
use crate::connection::debounce::Debouncer;
use crate::connection::network::NetworkPath;
use crate::connection::state::{ConnectionMachine, ConnectionSnapshot, Effect, Property};
use crate::error::{Error, Result};
use crate::protocol::{self, InboundMessage, OutboundMessage};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Floor for the zombie check period so a zero interval cannot spin the loop.
const MIN_HEARTBEAT_CHECK: Duration = Duration::from_secs(1);

/// Foreground/background transitions reported by the host app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Requests accepted by the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCommand {
    Connect { session_id: Option<Uuid> },
    Disconnect,
    Send(OutboundMessage),
    NetworkPathChanged(NetworkPath),
    Lifecycle(AppLifecycle),
    Shutdown,
}

/// Owning handle to a running connection task.
///
/// The task stops once every `ConnectionHandle` is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionHandle {
    /// A handle wired to a bare command receiver instead of a live task.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (_, snapshot) = watch::channel(ConnectionSnapshot::default());
        (Self { commands, snapshot }, rx)
    }

    fn command(&self, command: ConnectionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Disconnected)
    }

    /// Start connecting; reconnects automatically until [`Self::disconnect`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection task has stopped.
    pub fn connect(&self, session_id: Option<Uuid>) -> Result<()> {
        self.command(ConnectionCommand::Connect { session_id })
    }

    /// Close the transport and stop reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection task has stopped.
    pub fn disconnect(&self) -> Result<()> {
        self.command(ConnectionCommand::Disconnect)
    }

    /// Send a frame, buffering it until the connection is authenticated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection task has stopped.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.command(ConnectionCommand::Send(message))
    }

    /// Report a network path observation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection task has stopped.
    pub fn network_path_changed(&self, path: NetworkPath) -> Result<()> {
        self.command(ConnectionCommand::NetworkPathChanged(path))
    }

    /// Report a foreground/background transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection task has stopped.
    pub fn lifecycle(&self, event: AppLifecycle) -> Result<()> {
        self.command(ConnectionCommand::Lifecycle(event))
    }

    /// Stop the connection task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection task has already stopped.
    pub fn shutdown(&self) -> Result<()> {
        self.command(ConnectionCommand::Shutdown)
    }

    /// Latest published state.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published state.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// A handle that does not keep the connection task alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnectionHandle {
        WeakConnectionHandle {
            commands: self.commands.downgrade(),
        }
    }
}

/// Non-owning handle used by the sync layer to send frames.
#[derive(Debug, Clone)]
pub struct WeakConnectionHandle {
    commands: mpsc::WeakUnboundedSender<ConnectionCommand>,
}

impl WeakConnectionHandle {
    /// Send a frame if the connection task is still around.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if every owning handle was dropped or
    /// the task has stopped.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        let commands = self.commands.upgrade().ok_or(Error::Disconnected)?;
        commands
            .send(ConnectionCommand::Send(message))
            .map_err(|_| Error::Disconnected)
    }

    /// Whether an owning handle still exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.commands.upgrade().is_some()
    }
}

/// The connection task.
pub struct ConnectionManager {
    url: Url,
    connect_timeout: Duration,
    machine: ConnectionMachine,
    debouncer: Debouncer<Property>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    socket: Option<Socket>,
    connecting: Option<JoinHandle<Result<Socket>>>,
    reconnect_at: Option<Instant>,
    heartbeat_check_at: Option<Instant>,
}

impl ConnectionManager {
    /// Spawn the connection task on the current runtime.
    ///
    /// Returns the owning handle, the receiver of forwarded sync messages,
    /// and the task's join handle. Nothing connects until
    /// [`ConnectionHandle::connect`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured URL cannot be parsed.
    pub fn spawn(
        config: &ConnectionConfig,
    ) -> Result<(
        ConnectionHandle,
        mpsc::UnboundedReceiver<InboundMessage>,
        JoinHandle<()>,
    )> {
        let url = Url::parse(&config.url)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let machine = ConnectionMachine::new(config);
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());

        let manager = Self {
            url,
            connect_timeout: config.connect_timeout(),
            machine,
            debouncer: Debouncer::new(config.debounce_window()),
            snapshot_tx,
            inbound_tx,
            socket: None,
            connecting: None,
            reconnect_at: None,
            heartbeat_check_at: None,
        };
        let task = tokio::spawn(manager.run(commands_rx));

        let handle = ConnectionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        Ok((handle, inbound_rx, task))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ConnectionCommand>) {
        debug!(url = %self.url, "connection task started");
        loop {
            let reconnect_at = self.reconnect_at;
            let heartbeat_check_at = self.heartbeat_check_at;
            let publish_at = self.debouncer.deadline();

            let effects = tokio::select! {
                command = commands.recv() => match command {
                    Some(ConnectionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                frame = next_frame(&mut self.socket) => self.handle_frame(frame),
                opened = finish_connect(&mut self.connecting) => {
                    self.connecting = None;
                    match opened {
                        Ok(socket) => {
                            self.socket = Some(socket);
                            self.machine.transport_opened()
                        }
                        Err(e) => self.machine.transport_failed(&e.to_string()),
                    }
                }
                () = sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    self.machine.reconnect_timer_fired()
                }
                () = sleep_until(heartbeat_check_at) => {
                    self.heartbeat_check_at = None;
                    self.machine.check_heartbeat_timeout(Utc::now())
                }
                () = sleep_until(publish_at) => {
                    if self.debouncer.take_due(Instant::now()).is_some() {
                        self.publish();
                    }
                    Vec::new()
                }
            };
            self.apply(effects).await;
        }

        let effects = self.machine.disconnect();
        self.apply(effects).await;
        debug!("connection task stopped");
    }

    fn handle_command(&mut self, command: ConnectionCommand) -> Vec<Effect> {
        match command {
            ConnectionCommand::Connect { session_id } => self.machine.connect(session_id),
            ConnectionCommand::Disconnect => self.machine.disconnect(),
            ConnectionCommand::Send(message) => self.machine.send(message),
            ConnectionCommand::NetworkPathChanged(path) => self.machine.network_path_changed(path),
            ConnectionCommand::Lifecycle(AppLifecycle::Foreground) => {
                self.machine.app_foregrounded()
            }
            ConnectionCommand::Lifecycle(AppLifecycle::Background) => {
                self.machine.app_backgrounded()
            }
            ConnectionCommand::Shutdown => Vec::new(),
        }
    }

    fn handle_frame(&mut self, frame: Option<tungstenite::Result<Message>>) -> Vec<Effect> {
        match frame {
            Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                Ok(message) => self.machine.handle_inbound(message, Utc::now()),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    Vec::new()
                }
            },
            Some(Ok(Message::Close(frame))) => {
                self.socket = None;
                let reason = frame.map_or_else(
                    || "closed by server".to_string(),
                    |f| format!("closed by server: {}", f.reason),
                );
                self.machine.transport_failed(&reason)
            }
            // Control frames are answered by tungstenite itself
            Some(Ok(_)) => Vec::new(),
            Some(Err(e)) => {
                self.socket = None;
                self.machine.transport_failed(&e.to_string())
            }
            None => {
                self.socket = None;
                self.machine.transport_failed("stream ended")
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::OpenTransport => self.open_transport(),
                Effect::CloseTransport => self.close_transport().await,
                Effect::ScheduleReconnect(delay) => {
                    self.reconnect_at = Instant::now().checked_add(delay);
                }
                Effect::CancelReconnect => self.reconnect_at = None,
                Effect::Send(message) => {
                    let Some(socket) = self.socket.as_mut() else {
                        debug!(?message, "no transport, dropping frame");
                        continue;
                    };
                    if let Err(e) = write_frame(socket, &message).await {
                        self.socket = None;
                        queue.extend(self.machine.transport_failed(&e.to_string()));
                    }
                }
                Effect::PublishNow => {
                    self.debouncer.flush();
                    self.publish();
                }
                Effect::PublishDebounced(property) => {
                    self.debouncer.push(property, Instant::now());
                }
                Effect::Forward(message) => {
                    if self.inbound_tx.send(message).is_err() {
                        debug!("no sync consumer, dropping forwarded message");
                    }
                }
            }
        }
        self.arm_heartbeat_check();
    }

    fn arm_heartbeat_check(&mut self) {
        if !self.machine.is_monitoring_heartbeat() {
            self.heartbeat_check_at = None;
        } else if self.heartbeat_check_at.is_none() {
            let interval = self.machine.heartbeat_interval().max(MIN_HEARTBEAT_CHECK);
            // An interval past the clock's range never fires
            self.heartbeat_check_at = Instant::now().checked_add(interval);
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.machine.snapshot());
    }

    fn open_transport(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        info!(url = %self.url, "opening transport");
        self.connecting = Some(tokio::spawn(open_socket(
            self.url.to_string(),
            self.connect_timeout,
        )));
    }

    async fn close_transport(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!(error = %e, "error while closing transport");
            }
        }
    }
}

async fn open_socket(url: String, timeout: Duration) -> Result<Socket> {
    let (socket, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(socket)
}

async fn write_frame(socket: &mut Socket, message: &OutboundMessage) -> Result<()> {
    let text = message.encode()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<tungstenite::Result<Message>> {
    match socket {
        Some(socket) => socket.next().await,
        None => future::pending().await,
    }
}

async fn finish_connect(task: &mut Option<JoinHandle<Result<Socket>>>) -> Result<Socket> {
    match task {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::InvalidState(format!("connect task failed: {e}"))),
        },
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
