//! The single shared event-stream connection.
//!
//! [`ConnectionManager`] is created once at startup and cloned into every
//! dependent. The first [`ConnectionManager::ensure_connected`] spawns a driver
//! task that owns the transport, walks the transport fallback order, retries
//! with a fixed delay up to a bounded count, and re-announces the local user
//! and joined conversation after every reconnection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};

use crate::api::events::{ChannelEvent, EventKind, OutboundEvent};
use crate::api::models::{ConversationId, Identity, User, UserId};
use crate::app::ConnectionSettings;
use crate::error::{ChatError, Result};
use crate::sync::subscription::{Listeners, Subscription};
use crate::sync::transport::{Connector, Transport, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Preferred transport first.
    pub transports: Vec<TransportKind>,
    /// Retry rounds after the first one before giving up.
    pub max_attempts: u32,
    pub delay: Duration,
    pub connect_timeout: Duration,
    pub outbox_capacity: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ReconnectPolicy {
    fn from(settings: &ConnectionSettings) -> Self {
        let transports = if settings.transports.is_empty() {
            vec![TransportKind::WebSocket, TransportKind::Polling]
        } else {
            settings.transports.clone()
        };
        Self {
            transports,
            max_attempts: settings.reconnection_attempts,
            delay: settings.reconnection_delay(),
            connect_timeout: settings.timeout(),
            outbox_capacity: settings.outbox_capacity.max(1),
        }
    }
}

enum Command {
    Emit(OutboundEvent),
    Retry,
    Shutdown,
}

struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    user: UserId,
}

struct Shared {
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    listeners: Listeners,
    state: Arc<watch::Sender<ConnectionState>>,
    driver: Mutex<Option<DriverHandle>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                policy,
                connector,
                listeners: Listeners::new(),
                state: Arc::new(state),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Start the shared transport if it is not running. Safe to call on every
    /// user action: it announces a changed identity and, after the retry
    /// budget ran out, asks the driver for another round.
    pub fn ensure_connected(&self, identity: &Identity) {
        let mut driver = self.shared.driver.lock();
        if let Some(handle) = driver.as_mut() {
            if !handle.task.is_finished() {
                if handle.user != identity.user.id {
                    log::info!("identity changed to {}; re-sending setup", identity.user.id);
                    handle.user = identity.user.id.clone();
                    let _ = handle
                        .commands
                        .send(Command::Emit(OutboundEvent::Setup(identity.user.clone())));
                }
                if self.state() == ConnectionState::Disconnected {
                    let _ = handle.commands.send(Command::Retry);
                }
                return;
            }
            log::warn!("connection driver exited; starting a new one");
        }

        let (commands, rx) = mpsc::unbounded_channel();
        self.shared.state.send_replace(ConnectionState::Connecting);
        let task = tokio::spawn(
            Driver {
                policy: self.shared.policy.clone(),
                connector: Arc::clone(&self.shared.connector),
                listeners: self.shared.listeners.clone(),
                state: Arc::clone(&self.shared.state),
                commands: rx,
                user: Some(identity.user.clone()),
                joined: None,
                order: self.shared.policy.transports.clone(),
                outbox: VecDeque::new(),
            }
            .run(),
        );
        *driver = Some(DriverHandle {
            commands,
            task,
            user: identity.user.id.clone(),
        });
    }

    /// Announce the local user. Repeated after every reconnection.
    pub fn send_setup(&self, user: &User) {
        self.emit(OutboundEvent::Setup(user.clone()));
    }

    /// Subscribe the connection to a conversation's inbound channel.
    pub fn join(&self, conversation: &ConversationId) {
        self.emit(OutboundEvent::JoinChat(conversation.clone()));
    }

    pub fn emit(&self, event: OutboundEvent) {
        let driver = self.shared.driver.lock();
        match driver.as_ref() {
            Some(handle) => {
                if handle.commands.send(Command::Emit(event)).is_err() {
                    log::warn!("connection driver is gone; dropping outbound event");
                }
            }
            None => log::debug!("not connected yet; dropping {:?}", event),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        tx: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Subscription {
        self.shared.listeners.subscribe(kind, tx)
    }

    pub fn subscribe_all(
        &self,
        kinds: &[EventKind],
        tx: &mpsc::UnboundedSender<ChannelEvent>,
    ) -> Vec<Subscription> {
        self.shared.listeners.subscribe_all(kinds, tx)
    }

    /// Close the transport and stop the driver. Only done at application exit.
    pub async fn shutdown(&self) {
        let handle = self.shared.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.commands.send(Command::Shutdown);
            if let Err(e) = handle.task.await {
                log::warn!("connection driver ended abnormally: {}", e);
            }
        }
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }
}

enum Flow<T> {
    Continue(T),
    Shutdown,
}

enum Established {
    Open(Box<dyn Transport>),
    GaveUp(ChatError),
    Shutdown,
}

enum Served {
    Dropped(String),
    Shutdown,
}

struct Driver {
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    listeners: Listeners,
    state: Arc<watch::Sender<ConnectionState>>,
    commands: mpsc::UnboundedReceiver<Command>,
    user: Option<User>,
    joined: Option<ConversationId>,
    order: Vec<TransportKind>,
    outbox: VecDeque<OutboundEvent>,
}

impl Driver {
    async fn run(mut self) {
        self.set_state(ConnectionState::Connecting);
        loop {
            let transport = match self.establish().await {
                Established::Open(transport) => transport,
                Established::Shutdown => break,
                Established::GaveUp(err) => {
                    log::warn!("giving up on the chat service: {}", err);
                    self.set_state(ConnectionState::Disconnected);
                    self.listeners.dispatch(ChannelEvent::Disconnected {
                        reason: err.to_string(),
                        will_retry: false,
                    });
                    match self.wait_for_retry().await {
                        Flow::Continue(()) => {
                            self.set_state(ConnectionState::Connecting);
                            continue;
                        }
                        Flow::Shutdown => break,
                    }
                }
            };

            log::info!("connected via {}", transport.kind());
            self.set_state(ConnectionState::Connected);
            match self.serve(transport).await {
                Served::Shutdown => break,
                Served::Dropped(reason) => {
                    log::warn!("connection dropped: {}", reason);
                    self.set_state(ConnectionState::Reconnecting);
                    self.listeners.dispatch(ChannelEvent::Disconnected {
                        reason,
                        will_retry: true,
                    });
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        log::info!("connection driver stopped");
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("connection state {:?} -> {:?}", previous, next);
        }
    }

    async fn establish(&mut self) -> Established {
        let mut round: u32 = 0;
        loop {
            round += 1;
            let mut last_error = None;
            for kind in self.order.clone() {
                log::debug!("connecting via {} (round {})", kind, round);
                let outcome = timeout(self.policy.connect_timeout, self.connector.connect(kind)).await;
                let err = match outcome {
                    Ok(Ok(transport)) => return Established::Open(transport),
                    Ok(Err(e)) => e,
                    Err(_) => ChatError::Connection(format!("{kind} connect timed out")),
                };
                log::warn!("{} connect failed: {}", kind, err);
                self.listeners.dispatch(ChannelEvent::ConnectError {
                    reason: err.to_string(),
                });
                last_error = Some(err);
                if let Flow::Shutdown = self.drain_commands() {
                    return Established::Shutdown;
                }
            }

            // next round prefers the transport that was tried last
            self.order.reverse();

            match last_error {
                Some(err) if !err.is_transient() => return Established::GaveUp(err),
                last if round > self.policy.max_attempts => {
                    if let Some(err) = last {
                        log::debug!("last connect error: {}", err);
                    }
                    return Established::GaveUp(ChatError::RetriesExhausted { attempts: round });
                }
                _ => {}
            }
            self.set_state(ConnectionState::Reconnecting);
            if let Flow::Shutdown = self.idle_for(self.policy.delay).await {
                return Established::Shutdown;
            }
        }
    }

    async fn serve(&mut self, mut transport: Box<dyn Transport>) -> Served {
        if let Err(e) = self.announce(transport.as_mut()).await {
            return Served::Dropped(e.to_string());
        }
        loop {
            tokio::select! {
                inbound = transport.recv() => match inbound {
                    Some(Ok(event)) => {
                        self.listeners.dispatch(event.into());
                    }
                    Some(Err(e)) => return Served::Dropped(e.to_string()),
                    None => return Served::Dropped("closed by remote".into()),
                },
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        transport.close().await;
                        return Served::Shutdown;
                    }
                    Some(Command::Retry) => {}
                    Some(Command::Emit(event)) => {
                        self.remember(&event);
                        if let Err(e) = transport.send(&event).await {
                            self.queue(event);
                            return Served::Dropped(e.to_string());
                        }
                    }
                },
            }
        }
    }

    /// Setup, join, then whatever piled up while offline.
    async fn announce(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if let Some(user) = self.user.clone() {
            transport.send(&OutboundEvent::Setup(user)).await?;
        }
        if let Some(conversation) = self.joined.clone() {
            transport.send(&OutboundEvent::JoinChat(conversation)).await?;
        }
        while let Some(event) = self.outbox.pop_front() {
            if let Err(e) = transport.send(&event).await {
                self.outbox.push_front(event);
                return Err(e);
            }
        }
        Ok(())
    }

    fn remember(&mut self, event: &OutboundEvent) {
        match event {
            OutboundEvent::Setup(user) => self.user = Some(user.clone()),
            OutboundEvent::JoinChat(conversation) => self.joined = Some(conversation.clone()),
            _ => {}
        }
    }

    fn queue(&mut self, event: OutboundEvent) {
        self.remember(&event);
        match event {
            OutboundEvent::Setup(_) | OutboundEvent::JoinChat(_) => {}
            event if event.is_presence() => log::debug!("dropping {:?} while offline", event),
            event => {
                if self.outbox.len() >= self.policy.outbox_capacity {
                    log::warn!("offline outbox full; dropping oldest frame");
                    self.outbox.pop_front();
                }
                self.outbox.push_back(event);
            }
        }
    }

    /// Handle a command while no transport is open. `Continue(true)` asks for
    /// a new connection round.
    fn offline(&mut self, command: Option<Command>) -> Flow<bool> {
        match command {
            None | Some(Command::Shutdown) => Flow::Shutdown,
            Some(Command::Retry) => Flow::Continue(true),
            Some(Command::Emit(event)) => {
                self.queue(event);
                Flow::Continue(false)
            }
        }
    }

    fn drain_commands(&mut self) -> Flow<()> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if let Flow::Shutdown = self.offline(Some(command)) {
                        return Flow::Shutdown;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Flow::Continue(()),
                Err(mpsc::error::TryRecvError::Disconnected) => return Flow::Shutdown,
            }
        }
    }

    async fn idle_for(&mut self, delay: Duration) -> Flow<()> {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Flow::Continue(()),
                command = self.commands.recv() => {
                    if let Flow::Shutdown = self.offline(command) {
                        return Flow::Shutdown;
                    }
                }
            }
        }
    }

    async fn wait_for_retry(&mut self) -> Flow<()> {
        loop {
            let command = self.commands.recv().await;
            match self.offline(command) {
                Flow::Continue(true) => return Flow::Continue(()),
                Flow::Continue(false) => {}
                Flow::Shutdown => return Flow::Shutdown,
            }
        }
    }
}
