//! The client session: one task that owns the timeline, typing state, pending
//! schedule and notification feed, and reacts to user commands, channel
//! events and completed REST calls in arrival order.
//!
//! REST calls run on spawned tasks and report back through a completion
//! channel. A completion is only applied if the conversation (and for history,
//! the load generation) it was started for is still the active one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use crate::api::client::RemoteApi;
use crate::api::events::{ChannelEvent, EventKind, OutboundEvent};
use crate::api::models::{ConversationId, Identity, LocalId, Message, SendRequest};
use crate::app::AppConfig;
use crate::error::{ChatError, Notice, NoticeLevel, Result};
use crate::sync::connection::{ConnectionManager, ConnectionState};
use crate::sync::notifications::NotificationRouter;
use crate::sync::scheduler::{PendingSchedule, SchedulerQueue};
use crate::sync::subscription::Subscription;
use crate::sync::timeline::{PendingMessage, PendingState, Timeline, TimelineEntry};
use crate::sync::typing::{TypingCoordinator, TypingSignal};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub quiet_interval: Duration,
    pub remote_timeout: Duration,
    pub notification_capacity: usize,
}

impl From<&AppConfig> for SessionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            quiet_interval: config.typing.quiet_interval(),
            remote_timeout: config.typing.remote_timeout(),
            notification_capacity: config.notifications.capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SwitchConversation(ConversationId),
    Leave,
    Keystroke,
    /// Sends immediately, or submits the pending schedule if there is one.
    Send(String),
    Schedule {
        body: String,
        when: DateTime<Utc>,
    },
    CancelSchedule,
    Refresh,
    Resend(LocalId),
    Shutdown,
}

/// Everything the front end renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub conversation: Option<ConversationId>,
    pub entries: Vec<TimelineEntry>,
    pub loading: bool,
    pub remote_typing: bool,
    pub connection: ConnectionState,
    /// Most recent first.
    pub notifications: Vec<Message>,
    pub unread: HashMap<ConversationId, usize>,
    pub pending_schedule: Option<PendingSchedule>,
    pub list_revision: u64,
}

impl SessionSnapshot {
    fn empty(connection: ConnectionState) -> Self {
        Self {
            conversation: None,
            entries: Vec::new(),
            loading: false,
            remote_typing: false,
            connection,
            notifications: Vec::new(),
            unread: HashMap::new(),
            pending_schedule: None,
            list_revision: 0,
        }
    }

    pub fn unread_count(&self, conversation: &ConversationId) -> usize {
        self.unread.get(conversation).copied().unwrap_or(0)
    }
}

enum Completion {
    HistoryLoaded {
        conversation: ConversationId,
        generation: u64,
        result: Result<Vec<Message>>,
    },
    SendFinished {
        conversation: ConversationId,
        local_id: LocalId,
        scheduled_for: Option<DateTime<Utc>>,
        result: Result<Message>,
    },
}

/// Cloneable front-end side of a running [`ChatSession`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ChatError::Closed)
    }

    pub fn switch_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.command(Command::SwitchConversation(conversation))
    }

    pub fn leave(&self) -> Result<()> {
        self.command(Command::Leave)
    }

    pub fn keystroke(&self) -> Result<()> {
        self.command(Command::Keystroke)
    }

    pub fn send_message(&self, body: impl Into<String>) -> Result<()> {
        self.command(Command::Send(body.into()))
    }

    pub fn schedule(&self, body: impl Into<String>, when: DateTime<Utc>) -> Result<()> {
        self.command(Command::Schedule {
            body: body.into(),
            when,
        })
    }

    pub fn cancel_schedule(&self) -> Result<()> {
        self.command(Command::CancelSchedule)
    }

    pub fn refresh(&self) -> Result<()> {
        self.command(Command::Refresh)
    }

    pub fn resend(&self, local_id: LocalId) -> Result<()> {
        self.command(Command::Resend(local_id))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

pub struct ChatSession {
    identity: Identity,
    api: Arc<dyn RemoteApi>,
    connection: ConnectionManager,
    connection_state: watch::Receiver<ConnectionState>,

    active: Option<ConversationId>,
    generation: u64,
    loading: bool,
    timeline: Timeline,
    typing: TypingCoordinator,
    scheduler: SchedulerQueue,
    router: NotificationRouter,
    degraded: bool,
    gave_up: bool,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    _lifecycle: Vec<Subscription>,
    _inbound: Subscription,
    presence: Vec<Subscription>,

    snapshot: watch::Sender<SessionSnapshot>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl ChatSession {
    pub fn new(
        identity: Identity,
        api: Arc<dyn RemoteApi>,
        connection: ConnectionManager,
        settings: SessionSettings,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<Notice>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::empty(connection.state()));

        let lifecycle = connection.subscribe_all(
            &[
                EventKind::Connected,
                EventKind::ConnectError,
                EventKind::Disconnected,
            ],
            &events_tx,
        );
        let inbound = connection.subscribe(EventKind::MessageReceived, events_tx.clone());

        let session = Self {
            identity,
            api,
            connection_state: connection.watch_state(),
            connection,
            active: None,
            generation: 0,
            loading: false,
            timeline: Timeline::new(),
            typing: TypingCoordinator::new(settings.quiet_interval, settings.remote_timeout),
            scheduler: SchedulerQueue::new(),
            router: NotificationRouter::new(settings.notification_capacity),
            degraded: false,
            gave_up: false,
            commands,
            events_tx,
            events,
            completions_tx,
            completions,
            _lifecycle: lifecycle,
            _inbound: inbound,
            presence: Vec::new(),
            snapshot,
            notices,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (session, handle, notices_rx)
    }

    pub async fn run(mut self) {
        log::info!("session for {} started", self.identity.user.id);
        self.publish();
        loop {
            let typing_deadline = self.typing.next_deadline();
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(done) = self.completions.recv() => self.handle_completion(done),
                Ok(()) = self.connection_state.changed() => self.on_connection_state(),
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                _ = wait_until(typing_deadline) => self.on_typing_deadline(),
            }
            self.publish();
        }
        self.end_typing();
        log::info!("session for {} stopped", self.identity.user.id);
    }

    fn handle_command(&mut self, command: Command) {
        // every user action doubles as a manual reconnect trigger
        if self.active.is_some() {
            self.connection.ensure_connected(&self.identity);
        }
        match command {
            Command::SwitchConversation(conversation) => self.switch_to(conversation),
            Command::Leave => self.leave(),
            Command::Keystroke => self.keystroke(),
            Command::Send(body) => self.send(body),
            Command::Schedule { body, when } => self.schedule(body, when),
            Command::CancelSchedule => self.cancel_schedule(),
            Command::Refresh => self.load_history(),
            Command::Resend(local_id) => self.resend(local_id),
            Command::Shutdown => {}
        }
    }

    fn switch_to(&mut self, conversation: ConversationId) {
        if self.active.as_ref() == Some(&conversation) {
            log::debug!("{} is already open", conversation);
            return;
        }
        self.connection.ensure_connected(&self.identity);
        self.close_conversation();

        log::info!("opening conversation {}", conversation);
        self.active = Some(conversation.clone());
        self.timeline.reset(Some(conversation.clone()));
        self.router.dismiss_conversation(&conversation);

        // registering replaces the previous handlers before the old handles drop
        self.presence = self
            .connection
            .subscribe_all(&[EventKind::Typing, EventKind::StopTyping], &self.events_tx);
        self._inbound = self
            .connection
            .subscribe(EventKind::MessageReceived, self.events_tx.clone());

        self.connection.join(&conversation);
        self.load_history();
    }

    fn leave(&mut self) {
        let Some(conversation) = self.active.clone() else {
            return;
        };
        log::info!("leaving conversation {}", conversation);
        self.close_conversation();
        self.active = None;
        self.generation += 1;
        self.loading = false;
        self.timeline.reset(None);
        self.presence.clear();
    }

    /// Tear down state scoped to the conversation being left.
    fn close_conversation(&mut self) {
        self.end_typing();
        if let Some(schedule) = self.scheduler.cancel() {
            log::info!("dropping unsent schedule {}", schedule.local_id);
            self.timeline.remove_pending(schedule.local_id);
        }
        self.typing.clear_remote();
    }

    fn load_history(&mut self) {
        let Some(conversation) = self.active.clone() else {
            return;
        };
        self.generation += 1;
        self.loading = true;
        let generation = self.generation;
        let api = Arc::clone(&self.api);
        let done = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.history(&conversation).await;
            let _ = done.send(Completion::HistoryLoaded {
                conversation,
                generation,
                result,
            });
        });
    }

    fn keystroke(&mut self) {
        let Some(conversation) = self.active.clone() else {
            return;
        };
        let connected = self.connection.state() == ConnectionState::Connected;
        for signal in self
            .typing
            .on_local_keystroke(&conversation, Instant::now(), connected)
        {
            self.emit_typing(signal);
        }
    }

    fn send(&mut self, body: String) {
        let Some(conversation) = self.active.clone() else {
            self.no_conversation();
            return;
        };
        if self.scheduler.pending().is_some() {
            self.materialize(body);
            return;
        }
        if body.trim().is_empty() {
            log::debug!("ignoring empty message");
            return;
        }
        self.end_typing();

        let pending = PendingMessage {
            local_id: LocalId::new(),
            conversation_id: conversation,
            sender: self.identity.user.clone(),
            content: body,
            created_at: Utc::now(),
            scheduled_for: None,
            state: PendingState::Sending,
        };
        self.timeline.append_optimistic(pending.clone());
        self.submit(&pending);
    }

    fn materialize(&mut self, body: String) {
        let schedule = match self.scheduler.materialize(&body) {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return,
            Err(e) => {
                log::debug!("not submitting schedule: {}", e);
                self.notify(
                    Notice::new(NoticeLevel::Warning, "Message is empty")
                        .with_description("Type a message before sending the schedule."),
                );
                return;
            }
        };
        self.end_typing();

        let mut pending = schedule.placeholder(&self.identity.user, Utc::now());
        pending.state = PendingState::Sending;
        if self.timeline.mark_sending(schedule.local_id) {
            self.timeline.revise(schedule.local_id, schedule.body.clone());
        } else {
            self.timeline.append_optimistic(pending.clone());
        }
        self.submit(&pending);
    }

    fn submit(&self, pending: &PendingMessage) {
        let request = SendRequest {
            content: pending.content.clone(),
            conversation_id: pending.conversation_id.clone(),
            scheduled_for: pending.scheduled_for,
            client_id: pending.local_id,
        };
        let local_id = pending.local_id;
        let api = Arc::clone(&self.api);
        let done = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.send(&request).await;
            let _ = done.send(Completion::SendFinished {
                conversation: request.conversation_id,
                local_id,
                scheduled_for: request.scheduled_for,
                result,
            });
        });
    }

    fn schedule(&mut self, body: String, when: DateTime<Utc>) {
        let Some(conversation) = self.active.clone() else {
            self.no_conversation();
            return;
        };
        let now = Utc::now();
        match self.scheduler.schedule(conversation, body, when, now) {
            Err(e) => {
                log::debug!("schedule rejected: {}", e);
                self.notify(
                    Notice::new(NoticeLevel::Warning, "Invalid schedule time")
                        .with_description("Please select a future date and time."),
                );
            }
            Ok((schedule, displaced)) => {
                if let Some(old) = displaced {
                    self.timeline.remove_pending(old.local_id);
                }
                self.timeline
                    .append_optimistic(schedule.placeholder(&self.identity.user, now));
                self.notify(
                    Notice::new(NoticeLevel::Info, "Message Scheduled").with_description(format!(
                        "Your message will be scheduled for {}",
                        format_instant(when)
                    )),
                );
            }
        }
    }

    fn cancel_schedule(&mut self) {
        if let Some(schedule) = self.scheduler.cancel() {
            log::info!("schedule {} cancelled", schedule.local_id);
            self.timeline.remove_pending(schedule.local_id);
        }
    }

    fn resend(&mut self, local_id: LocalId) {
        let Some(pending) = self.timeline.pending(local_id).cloned() else {
            log::debug!("nothing to resend for {}", local_id);
            return;
        };
        if !matches!(pending.state, PendingState::Failed { .. }) {
            log::debug!("{} has not failed; not resending", local_id);
            return;
        }
        self.timeline.mark_sending(local_id);
        self.submit(&pending);
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::HistoryLoaded {
                conversation,
                generation,
                result,
            } => self.on_history(conversation, generation, result),
            Completion::SendFinished {
                conversation,
                local_id,
                scheduled_for,
                result,
            } => self.on_sent(conversation, local_id, scheduled_for, result),
        }
    }

    fn on_history(
        &mut self,
        conversation: ConversationId,
        generation: u64,
        result: Result<Vec<Message>>,
    ) {
        if self.active.as_ref() != Some(&conversation) || generation != self.generation {
            log::debug!("discarding stale history for {}", conversation);
            return;
        }
        self.loading = false;
        match result {
            Ok(messages) => {
                log::info!("loaded {} messages for {}", messages.len(), conversation);
                self.timeline.replace_history(conversation.clone(), messages);
                self.connection.join(&conversation);
            }
            Err(e) => {
                let err = ChatError::HistoryLoad {
                    conversation,
                    reason: e.to_string(),
                };
                log::warn!("{}", err);
                self.notify(
                    Notice::new(NoticeLevel::Error, "Failed to Load the Messages")
                        .with_description(err.to_string()),
                );
            }
        }
    }

    fn on_sent(
        &mut self,
        conversation: ConversationId,
        local_id: LocalId,
        scheduled_for: Option<DateTime<Utc>>,
        result: Result<Message>,
    ) {
        let active = self.active.as_ref() == Some(&conversation);
        match result {
            Ok(message) => match scheduled_for {
                Some(when) => {
                    if active {
                        self.timeline.remove_pending(local_id);
                    }
                    self.notify(
                        Notice::new(NoticeLevel::Success, "Message Scheduled").with_description(
                            format!("Your message will be sent at {}", format_instant(when)),
                        ),
                    );
                }
                None => {
                    self.connection.emit(OutboundEvent::NewMessage(message.clone()));
                    if active {
                        self.timeline.confirm(local_id, message);
                    } else {
                        log::debug!("send for {} confirmed after leaving it", conversation);
                    }
                }
            },
            Err(e) => {
                let err = ChatError::Send(e.to_string());
                log::warn!("{}", err);
                if active {
                    self.timeline.mark_failed(local_id, e.to_string());
                }
                self.notify(
                    Notice::new(NoticeLevel::Error, "Failed to send the Message")
                        .with_description("Please try again."),
                );
            }
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => log::info!("chat service acknowledged setup"),
            ChannelEvent::ConnectError { reason } => self.degrade(&reason),
            ChannelEvent::Disconnected {
                reason,
                will_retry: true,
            } => self.degrade(&reason),
            ChannelEvent::Disconnected {
                reason,
                will_retry: false,
            } => {
                log::warn!("chat service unavailable: {}", reason);
                if !self.gave_up {
                    self.gave_up = true;
                    self.notify(
                        Notice::new(NoticeLevel::Error, "Chat service unavailable")
                            .with_description("Will try again on your next action."),
                    );
                }
            }
            ChannelEvent::Typing(conversation) => {
                self.typing.on_remote_typing(conversation, Instant::now());
            }
            ChannelEvent::StopTyping(conversation) => {
                self.typing.on_remote_stop_typing(&conversation);
            }
            ChannelEvent::MessageReceived(message) => {
                self.router
                    .route(message, self.active.as_ref(), &mut self.timeline);
            }
        }
    }

    fn degrade(&mut self, reason: &str) {
        log::debug!("connection degraded: {}", reason);
        if self.degraded {
            return;
        }
        self.degraded = true;
        self.notify(
            Notice::new(NoticeLevel::Warning, "Connection Error")
                .with_description("Trying to reconnect to chat service..."),
        );
    }

    fn on_connection_state(&mut self) {
        let state = *self.connection_state.borrow_and_update();
        if state != ConnectionState::Connected {
            return;
        }
        self.gave_up = false;
        if self.degraded {
            self.degraded = false;
            self.notify(Notice::new(NoticeLevel::Success, "Reconnected to chat service"));
        }
    }

    fn on_typing_deadline(&mut self) {
        let tick = self.typing.poll(Instant::now());
        if let Some(signal) = tick.stop {
            self.emit_typing(signal);
        }
    }

    fn end_typing(&mut self) {
        if let Some(signal) = self.typing.end_episode() {
            self.emit_typing(signal);
        }
    }

    fn emit_typing(&self, signal: TypingSignal) {
        if self.connection.state() != ConnectionState::Connected {
            log::debug!("offline; not sending {:?}", signal);
            return;
        }
        self.connection.emit(signal.into());
    }

    fn no_conversation(&self) {
        log::debug!("{}", ChatError::NoActiveConversation);
        self.notify(Notice::new(NoticeLevel::Warning, "Select a conversation first"));
    }

    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error | NoticeLevel::Warning => log::warn!("notice: {}", notice.title),
            NoticeLevel::Info | NoticeLevel::Success => log::info!("notice: {}", notice.title),
        }
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            conversation: self.active.clone(),
            entries: self.timeline.entries().to_vec(),
            loading: self.loading,
            remote_typing: self
                .active
                .as_ref()
                .is_some_and(|c| self.typing.is_remote_typing(c)),
            connection: self.connection.state(),
            notifications: self.router.feed().items().cloned().collect(),
            unread: self.router.feed().unread_counts(),
            pending_schedule: self.scheduler.pending().cloned(),
            list_revision: self.router.list_revision(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn format_instant(when: DateTime<Utc>) -> String {
    when.format("%Y-%m-%d %H:%M UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::events::InboundEvent;
    use crate::sync::connection::ReconnectPolicy;
    use crate::sync::testing::{FakeApi, MemoryConnector, ServerEnd, identity, message};
    use tokio::task::JoinHandle;

    struct Harness {
        handle: SessionHandle,
        notices: mpsc::UnboundedReceiver<Notice>,
        api: Arc<FakeApi>,
        connector: Arc<MemoryConnector>,
        accepted: mpsc::UnboundedReceiver<ServerEnd>,
        manager: ConnectionManager,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            let api = FakeApi::new();
            let (connector, accepted) = MemoryConnector::new();
            let policy = ReconnectPolicy {
                max_attempts: 2,
                ..ReconnectPolicy::default()
            };
            let manager = ConnectionManager::new(policy, connector.clone());
            let (session, handle, notices) = ChatSession::new(
                identity("u1"),
                api.clone(),
                manager.clone(),
                SessionSettings::default(),
            );
            let task = tokio::spawn(session.run());
            Self {
                handle,
                notices,
                api,
                connector,
                accepted,
                manager,
                task,
            }
        }

        async fn until(&self, mut pred: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
            let mut rx = self.handle.watch();
            let snapshot = rx.wait_for(|s| pred(s)).await.unwrap().clone();
            snapshot
        }

        /// Open `conversation`, wait for its history and a live connection,
        /// and consume the announce frames.
        async fn open(&mut self, conversation: &str) -> ServerEnd {
            self.handle.switch_conversation(conversation.into()).unwrap();
            let mut server = self.accepted.recv().await.unwrap();
            self.until(|s| {
                s.conversation == Some(conversation.into())
                    && !s.loading
                    && s.connection == ConnectionState::Connected
            })
            .await;
            assert!(matches!(server.next_frame().await, OutboundEvent::Setup(_)));
            for _ in 0..2 {
                assert_eq!(
                    server.next_frame().await,
                    OutboundEvent::JoinChat(conversation.into())
                );
            }
            server
        }

        async fn stop(self) {
            self.handle.shutdown().unwrap();
            self.task.await.unwrap();
            self.manager.shutdown().await;
        }
    }

    fn pending_of(snapshot: &SessionSnapshot) -> Option<&PendingMessage> {
        snapshot.entries.iter().find_map(|e| match e {
            TimelineEntry::Pending(p) => Some(p),
            TimelineEntry::Confirmed(_) => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn switching_loads_history_and_joins_twice() {
        let mut h = Harness::start();
        h.api.set_history(
            "c1",
            vec![message("m1", "c1", "hello"), message("m2", "c1", "again")],
        );
        let mut server = h.open("c1").await;
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.entries.len(), 2);
        assert!(server.try_frame().is_none());

        // re-selecting the open conversation does not reload
        h.handle.switch_conversation("c1".into()).unwrap();
        h.handle.refresh().unwrap();
        assert_eq!(
            server.next_frame().await,
            OutboundEvent::JoinChat("c1".into())
        );
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_shows_placeholder_then_confirmed_entry() {
        let mut h = Harness::start();
        let mut server = h.open("c1").await;
        h.api.delay_sends(Duration::from_secs(1));

        h.handle.send_message("hi").unwrap();
        let optimistic = h.until(|s| !s.entries.is_empty()).await;
        let local = pending_of(&optimistic).expect("placeholder shown first");
        assert_eq!(local.state, PendingState::Sending);
        assert_eq!(local.content, "hi");

        let confirmed = h
            .until(|s| s.entries.len() == 1 && !s.entries[0].is_placeholder())
            .await;
        let TimelineEntry::Confirmed(message) = &confirmed.entries[0] else {
            unreachable!();
        };
        assert_eq!(message.client_id, Some(local.local_id));

        assert_eq!(server.next_frame().await, OutboundEvent::NewMessage(message.clone()));
        let sent = h.api.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].client_id, local.local_id);
        assert_eq!(sent[0].scheduled_for, None);

        // the relayed copy of our own message is a no-op
        server.push(InboundEvent::MessageReceived(message.clone()));
        server.push(InboundEvent::Typing("c1".into()));
        let snapshot = h.until(|s| s.remote_typing).await;
        assert_eq!(snapshot.entries.len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_history_is_discarded() {
        let mut h = Harness::start();
        h.api.set_history("c1", vec![message("m1", "c1", "slow")]);
        h.api.set_history("c2", vec![message("m2", "c2", "fast")]);
        h.api.delay_history("c1", Duration::from_secs(5));

        h.handle.switch_conversation("c1".into()).unwrap();
        h.handle.switch_conversation("c2".into()).unwrap();
        let snapshot = h
            .until(|s| s.conversation == Some("c2".into()) && !s.loading)
            .await;
        assert_eq!(snapshot.entries.len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.conversation, Some("c2".into()));
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].content(), "fast");
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn other_conversation_message_becomes_notification() {
        let mut h = Harness::start();
        let server = h.open("a").await;

        let elsewhere = message("m9", "b", "psst");
        server.push(InboundEvent::MessageReceived(elsewhere.clone()));
        let snapshot = h.until(|s| !s.notifications.is_empty()).await;
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.unread_count(&"b".into()), 1);
        assert_eq!(snapshot.list_revision, 1);

        h.api.set_history("b", vec![elsewhere.clone()]);
        h.handle.switch_conversation("b".into()).unwrap();
        let snapshot = h
            .until(|s| s.conversation == Some("b".into()) && !s.loading)
            .await;
        assert_eq!(snapshot.entries.len(), 1);
        assert!(snapshot.notifications.is_empty());

        server.push(InboundEvent::MessageReceived(elsewhere));
        server.push(InboundEvent::Typing("b".into()));
        let snapshot = h.until(|s| s.remote_typing).await;
        assert_eq!(snapshot.entries.len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_rejects_past_and_submits_future() {
        let mut h = Harness::start();
        let mut server = h.open("c1").await;

        h.handle
            .schedule("later", Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        let notice = h.notices.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Warning);
        let snapshot = h.handle.snapshot();
        assert!(snapshot.pending_schedule.is_none());
        assert!(snapshot.entries.is_empty());

        let when = Utc::now() + chrono::Duration::days(1);
        h.handle.schedule("later", when).unwrap();
        let snapshot = h.until(|s| s.pending_schedule.is_some()).await;
        let placeholder = pending_of(&snapshot).unwrap();
        assert_eq!(placeholder.state, PendingState::Queued);
        assert_eq!(placeholder.scheduled_for, Some(when));
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Info);

        h.handle.send_message("").unwrap();
        h.until(|s| s.pending_schedule.is_none() && s.entries.is_empty())
            .await;
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Success);

        let sent = h.api.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "later");
        assert_eq!(sent[0].scheduled_for, Some(when));
        // the service dispatches scheduled messages itself
        assert!(server.try_frame().is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_schedule_leaves_nothing_behind() {
        let mut h = Harness::start();
        let _server = h.open("c1").await;
        h.handle
            .schedule("maybe", Utc::now() + chrono::Duration::hours(2))
            .unwrap();
        h.until(|s| s.pending_schedule.is_some()).await;

        h.handle.cancel_schedule().unwrap();
        let snapshot = h
            .until(|s| s.pending_schedule.is_none() && s.entries.is_empty())
            .await;
        assert!(snapshot.entries.is_empty());
        assert!(h.api.sent().is_empty());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_stays_and_resend_replaces_it() {
        let mut h = Harness::start();
        let _server = h.open("c1").await;
        h.api.fail_sends(true);

        h.handle.send_message("hi").unwrap();
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Error);
        let snapshot = h
            .until(|s| {
                pending_of(s).is_some_and(|p| matches!(p.state, PendingState::Failed { .. }))
            })
            .await;
        let local_id = pending_of(&snapshot).unwrap().local_id;

        h.api.fail_sends(false);
        h.handle.resend(local_id).unwrap();
        let snapshot = h
            .until(|s| s.entries.len() == 1 && !s.entries[0].is_placeholder())
            .await;
        assert_eq!(snapshot.entries.len(), 1);
        let sent = h.api.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|r| r.client_id == local_id));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_emit_one_typing_and_one_stop() {
        let mut h = Harness::start();
        let mut server = h.open("c1").await;

        let started = Instant::now();
        for _ in 0..3 {
            h.handle.keystroke().unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(server.next_frame().await, OutboundEvent::Typing("c1".into()));
        assert_eq!(
            server.next_frame().await,
            OutboundEvent::StopTyping("c1".into())
        );
        // last keystroke at 2s plus the 3s quiet interval
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(server.try_frame().is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sending_ends_the_typing_episode() {
        let mut h = Harness::start();
        let mut server = h.open("c1").await;
        h.handle.keystroke().unwrap();
        h.handle.send_message("done").unwrap();

        assert_eq!(server.next_frame().await, OutboundEvent::Typing("c1".into()));
        assert_eq!(
            server.next_frame().await,
            OutboundEvent::StopTyping("c1".into())
        );
        assert!(matches!(
            server.next_frame().await,
            OutboundEvent::NewMessage(_)
        ));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_typing_clears_without_stop() {
        let mut h = Harness::start();
        let server = h.open("c1").await;
        server.push(InboundEvent::Typing("c1".into()));
        h.until(|s| s.remote_typing).await;
        let started = Instant::now();
        h.until(|s| !s.remote_typing).await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_connection_warns_once() {
        let mut h = Harness::start();
        h.connector.fail_next(4);
        h.handle.switch_conversation("c1".into()).unwrap();
        h.until(|s| s.connection == ConnectionState::Connected).await;

        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Warning);
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Success);
        assert!(h.notices.try_recv().is_err());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_recover_on_next_action() {
        let mut h = Harness::start();
        h.connector.fail_next(6);
        h.handle.switch_conversation("c1".into()).unwrap();

        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Warning);
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Error);
        assert_eq!(h.handle.snapshot().connection, ConnectionState::Disconnected);

        h.handle.keystroke().unwrap();
        let _server = h.accepted.recv().await.unwrap();
        h.until(|s| s.connection == ConnectionState::Connected).await;
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Success);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn message_sent_while_offline_is_relayed_once() {
        let mut h = Harness::start();
        h.connector.fail_next(6);
        h.handle.switch_conversation("c1".into()).unwrap();
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Warning);
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Error);
        assert_eq!(h.connector.attempts().len(), 6);

        h.handle.send_message("hi").unwrap();
        let mut server = h.accepted.recv().await.unwrap();
        let snapshot = h
            .until(|s| {
                s.connection == ConnectionState::Connected
                    && s.entries.len() == 1
                    && !s.entries[0].is_placeholder()
            })
            .await;
        let TimelineEntry::Confirmed(sent) = &snapshot.entries[0] else {
            unreachable!();
        };
        assert_eq!(sent.content, "hi");

        let mut frames = Vec::new();
        loop {
            let frame = server.next_frame().await;
            let relayed = matches!(frame, OutboundEvent::NewMessage(_));
            frames.push(frame);
            if relayed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        while let Some(frame) = server.try_frame() {
            frames.push(frame);
        }
        let relayed: Vec<&OutboundEvent> = frames
            .iter()
            .filter(|f| matches!(f, OutboundEvent::NewMessage(_)))
            .collect();
        assert_eq!(relayed, vec![&OutboundEvent::NewMessage(sent.clone())]);
        assert_eq!(h.api.sent().len(), 1);
        assert_eq!(h.handle.snapshot().entries.len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_offline_send_stays_failed_after_reconnect() {
        let mut h = Harness::start();
        // the give-up round plus the manual retry the send itself triggers
        h.connector.fail_next(12);
        h.handle.switch_conversation("c1".into()).unwrap();
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Warning);
        assert_eq!(h.notices.recv().await.unwrap().level, NoticeLevel::Error);

        h.api.fail_sends(true);
        h.handle.send_message("hi").unwrap();
        let notice = h.notices.recv().await.unwrap();
        assert_eq!(notice.title, "Failed to send the Message");
        h.until(|s| {
            s.connection == ConnectionState::Disconnected && h.connector.attempts().len() == 12
        })
        .await;
        let snapshot = h.handle.snapshot();
        let local = pending_of(&snapshot).expect("failed send stays visible");
        assert!(matches!(local.state, PendingState::Failed { .. }));

        h.handle.keystroke().unwrap();
        let mut server = h.accepted.recv().await.unwrap();
        h.until(|s| s.connection == ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        while let Some(frame) = server.try_frame() {
            assert!(!matches!(frame, OutboundEvent::NewMessage(_)), "{frame:?}");
        }
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.entries.len(), 1);
        assert!(pending_of(&snapshot).is_some_and(|p| matches!(p.state, PendingState::Failed { .. })));
        assert_eq!(h.api.sent().len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn history_failure_notifies_and_refresh_recovers() {
        let mut h = Harness::start();
        h.api.fail_history(true);
        h.handle.switch_conversation("c1".into()).unwrap();
        let notice = h.notices.recv().await.unwrap();
        assert_eq!(notice.title, "Failed to Load the Messages");

        h.api.fail_history(false);
        h.api.set_history("c1", vec![message("m1", "c1", "finally")]);
        h.handle.refresh().unwrap();
        let snapshot = h.until(|s| s.entries.len() == 1 && !s.loading).await;
        assert_eq!(snapshot.entries[0].content(), "finally");
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_clears_conversation_state() {
        let mut h = Harness::start();
        h.api.set_history("c1", vec![message("m1", "c1", "x")]);
        let _server = h.open("c1").await;
        h.handle
            .schedule("later", Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        h.until(|s| s.pending_schedule.is_some()).await;

        h.handle.leave().unwrap();
        let snapshot = h.until(|s| s.conversation.is_none()).await;
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.pending_schedule.is_none());

        h.handle.send_message("nowhere").unwrap();
        let mut notice = h.notices.recv().await.unwrap();
        if notice.level == NoticeLevel::Info {
            notice = h.notices.recv().await.unwrap();
        }
        assert_eq!(notice.title, "Select a conversation first");
        assert!(h.api.sent().is_empty());
        h.stop().await;
    }
}
