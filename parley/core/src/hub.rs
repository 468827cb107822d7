//! Conversation Hub - Routing Client Events
//!
//! The hub is the single entry point a transport talks to. It owns every
//! registry and routes each decoded [`ClientEvent`] to the right place:
//!
//! ```text
//!   transport ──text──▶ ConversationHub::handle_message
//!                           │
//!         ┌─────────────────┼───────────────────┬──────────────────┐
//!         ▼                 ▼                   ▼                  ▼
//!   SessionRegistry   GroupRegistry   ConversationScheduler   PlaybackAcks
//!   (audio, sends)    (membership)     (single / group task)   (playback)
//! ```
//!
//! Conversations run under the group's key when the client is in a group of
//! two or more, otherwise under the client's own key.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::acks::PlaybackAcks;
use crate::config::ParleyConfig;
use crate::error::TransportError;
use crate::events::ClientEvent;
use crate::group_turn::{ActiveGroupStates, GroupTurnCoordinator};
use crate::groups::{Group, GroupRegistry, MembershipChange};
use crate::messages::{Actions, AudioPayload, ControlSignal, DisplayText, ServerMessage};
use crate::providers::{ProviderFactory, ProviderSet};
use crate::scheduler::{ConversationScheduler, StartOutcome, TaskKey};
use crate::session::{ClientId, Session, SessionContext, SessionRegistry};
use crate::turn::{TurnInput, TurnRunner};
use crate::vad::{VadEvent, VoiceActivitySegmenter};

/// Everything needed to serve connected clients
///
/// Cheap to clone; clones share all state.
#[derive(Clone, Debug)]
pub struct ConversationHub {
    config: Arc<ParleyConfig>,
    factory: ProviderFactory,
    sessions: SessionRegistry,
    groups: GroupRegistry,
    scheduler: ConversationScheduler,
    acks: PlaybackAcks,
    group_states: ActiveGroupStates,
    runner: TurnRunner,
}

impl ConversationHub {
    /// Create a hub whose sessions use the backends named in `config`
    #[must_use]
    pub fn new(config: ParleyConfig) -> Self {
        let sessions = SessionRegistry::new();
        let acks = PlaybackAcks::new();
        let runner = TurnRunner::new(
            sessions.clone(),
            acks.clone(),
            config.conversation.playback_ack_timeout(),
        );
        Self {
            factory: ProviderFactory::new(&config),
            config: Arc::new(config),
            sessions,
            groups: GroupRegistry::new(),
            scheduler: ConversationScheduler::new(),
            acks,
            group_states: ActiveGroupStates::new(),
            runner,
        }
    }

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================

    /// Register a client with freshly built providers
    ///
    /// Returns the receiving half of the client's outbound channel, or `None`
    /// if the ID is already connected.
    pub fn open(&self, client: ClientId) -> Option<mpsc::Receiver<ServerMessage>> {
        self.open_with(client, self.factory.build())
    }

    /// Register a client with explicit providers
    pub fn open_with(
        &self,
        client: ClientId,
        providers: ProviderSet,
    ) -> Option<mpsc::Receiver<ServerMessage>> {
        let (tx, rx) = mpsc::channel(self.config.server.channel_capacity);
        let context = SessionContext::new(self.config.character.clone(), providers);
        let vad = VoiceActivitySegmenter::new(self.config.vad.clone(), self.factory.classifier());

        if !self.sessions.register(Session::new(client.clone(), tx, context, vad)) {
            return None;
        }
        self.groups.register(client);
        Some(rx)
    }

    /// Send the connection greeting
    ///
    /// Call once the client's outbound channel is being drained.
    ///
    /// # Errors
    ///
    /// [`TransportError`] if the client is already gone.
    pub async fn greet(&self, client: &ClientId) -> Result<(), TransportError> {
        self.sessions
            .send_to(client, ServerMessage::full_text("Connection established"))
            .await?;
        self.sessions
            .send_to(
                client,
                ServerMessage::SetModelAndConf {
                    client_uid: client.clone(),
                    character_name: self.config.character.name.clone(),
                    avatar: self.config.character.avatar.clone(),
                },
            )
            .await?;
        self.send_group_update(client).await?;
        self.sessions
            .send_to(client, ServerMessage::control(ControlSignal::StartMic))
            .await
    }

    /// Tear down everything belonging to a client
    pub async fn disconnect(&self, client: &ClientId) {
        tracing::info!(client = %client, "Client disconnecting");

        if let Some(group) = self.conversation_group(client) {
            self.scheduler.interrupt(&TaskKey::Group(group.id)).await;
        }
        self.scheduler
            .interrupt(&TaskKey::Client(client.clone()))
            .await;

        if let Some(change) = self.groups.unregister(client) {
            self.notify_departure(client, &change).await;
        }
        self.acks.forget(client);
        self.sessions.unregister(client);
    }

    /// Clean up clients whose outbound channel closed without a disconnect
    ///
    /// Returns the clients removed.
    pub async fn prune_disconnected(&self) -> Vec<ClientId> {
        let closed = self.sessions.cleanup_disconnected();
        for client in &closed {
            self.scheduler
                .interrupt(&TaskKey::Client(client.clone()))
                .await;
            if let Some(change) = self.groups.unregister(client) {
                self.scheduler
                    .interrupt(&TaskKey::Group(change.group_id.clone()))
                    .await;
                self.notify_departure(client, &change).await;
            }
            self.acks.forget(client);
        }
        closed
    }

    /// Interrupt every running conversation
    pub async fn shutdown(&self) {
        self.scheduler.shutdown_all().await;
    }

    // ========================================================================
    // Event Routing
    // ========================================================================

    /// Decode and handle one text frame from a client
    ///
    /// Malformed or unknown messages are logged and dropped.
    pub async fn handle_message(&self, client: &ClientId, text: &str) {
        match ClientEvent::decode(text) {
            Ok(event) => self.handle_event(client, event).await,
            Err(e) => tracing::warn!(client = %client, error = %e, "Ignoring inbound message"),
        }
    }

    /// Handle one decoded event
    pub async fn handle_event(&self, client: &ClientId, event: ClientEvent) {
        tracing::debug!(client = %client, kind = event.kind(), "Client event");

        match event {
            ClientEvent::TextInput { text, images } => {
                self.start_conversation(client, TurnInput::Text { text, images });
            }
            ClientEvent::MicAudioData { audio } => {
                self.sessions.append_audio(client, &audio);
            }
            ClientEvent::RawAudioData { audio } => self.handle_raw_audio(client, &audio).await,
            ClientEvent::MicAudioEnd => {
                let samples = self.sessions.take_audio(client);
                self.start_conversation(client, TurnInput::Audio(samples));
            }
            ClientEvent::AiSpeakSignal => {
                self.start_conversation(client, TurnInput::Proactive);
            }
            ClientEvent::InterruptSignal { text } => self.interrupt(client, &text).await,
            ClientEvent::AddClientToGroup { invitee_uid } => self.invite(client, &invitee_uid).await,
            ClientEvent::RemoveClientFromGroup { target_uid } => {
                self.remove(client, &target_uid).await;
            }
            ClientEvent::RequestGroupInfo => {
                let _ = self.send_group_update(client).await;
            }
            ClientEvent::FrontendPlaybackComplete => {
                self.acks.resolve(client);
            }
            ClientEvent::AudioPlayStart {
                display_text,
                actions,
            } => self.forward_playback(client, display_text, actions).await,
            ClientEvent::Heartbeat => {
                let _ = self.sessions.send_to(client, ServerMessage::HeartbeatAck).await;
            }
        }
    }

    /// Feed samples to the client's segmenter and act on what it detects
    async fn handle_raw_audio(&self, client: &ClientId, samples: &[f32]) {
        for event in self.sessions.feed_raw_audio(client, samples) {
            match event {
                VadEvent::SpeechStart => {
                    tracing::debug!(client = %client, "Speech detected");
                    let _ = self
                        .sessions
                        .send_to(client, ServerMessage::control(ControlSignal::Interrupt))
                        .await;
                }
                VadEvent::SpeechEnd => tracing::debug!(client = %client, "Speech ended"),
                VadEvent::Segment(segment) => {
                    tracing::debug!(client = %client, samples = segment.len(), "Speech segment captured");
                    self.sessions.append_audio(client, &segment);
                    let _ = self
                        .sessions
                        .send_to(client, ServerMessage::control(ControlSignal::MicAudioEnd))
                        .await;
                }
            }
        }
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// The client's group, if it has company
    fn conversation_group(&self, client: &ClientId) -> Option<Group> {
        self.groups.group_of(client).filter(|g| g.len() > 1)
    }

    /// Scheduling key for the client's conversations
    #[must_use]
    pub fn task_key(&self, client: &ClientId) -> TaskKey {
        match self.conversation_group(client) {
            Some(group) => TaskKey::Group(group.id),
            None => TaskKey::Client(client.clone()),
        }
    }

    /// Start a single or group conversation for the client
    pub fn start_conversation(&self, client: &ClientId, input: TurnInput) -> StartOutcome {
        let initiator = client.clone();
        let (key, outcome) = match self.conversation_group(client) {
            Some(group) => {
                let key = TaskKey::Group(group.id.clone());
                let coordinator = GroupTurnCoordinator::new(
                    self.runner.clone(),
                    self.groups.clone(),
                    self.group_states.clone(),
                    self.config.conversation.max_member_failures,
                );
                let outcome = self.scheduler.start(key.clone(), move |task| {
                    coordinator.run(group.id, initiator, input, task)
                });
                (key, outcome)
            }
            None => {
                let key = TaskKey::Client(client.clone());
                let runner = self.runner.clone();
                let outcome = self
                    .scheduler
                    .start(key.clone(), move |task| runner.run_single(initiator, input, task));
                (key, outcome)
            }
        };

        if outcome == StartOutcome::AlreadyRunning {
            tracing::info!(client = %client, task = %key, "Conversation already running, trigger ignored");
        }
        outcome
    }

    /// Stop the client's conversation, telling generators what was heard
    pub async fn interrupt(&self, client: &ClientId, heard_text: &str) {
        match self.conversation_group(client) {
            Some(group) => {
                let speaker = self.group_states.current_speaker(&group.id);
                let stopped = self.scheduler.interrupt(&TaskKey::Group(group.id.clone())).await;
                // A single conversation from before the client joined
                let stopped_single = self
                    .scheduler
                    .interrupt(&TaskKey::Client(client.clone()))
                    .await;
                tracing::info!(
                    group = %group.id,
                    by = %client,
                    speaker = ?speaker,
                    stopped,
                    stopped_single,
                    "Group conversation interrupted"
                );

                let members = group.member_list();
                for member in &members {
                    if let Some(context) = self.sessions.context(member) {
                        context.providers.generator.handle_interrupt(heard_text).await;
                    }
                }
                self.sessions
                    .broadcast(&members, ServerMessage::interrupted(), None)
                    .await;
            }
            None => {
                let stopped = self
                    .scheduler
                    .interrupt(&TaskKey::Client(client.clone()))
                    .await;
                tracing::info!(client = %client, stopped, "Conversation interrupted");
                if let Some(context) = self.sessions.context(client) {
                    context.providers.generator.handle_interrupt(heard_text).await;
                }
            }
        }
    }

    /// Relay a playback start to the rest of the group as a silent payload
    async fn forward_playback(
        &self,
        client: &ClientId,
        display_text: Option<DisplayText>,
        actions: Option<Actions>,
    ) {
        if display_text.is_none() {
            return;
        }
        let members = self.groups.members_of(client);
        if members.len() <= 1 {
            return;
        }
        let payload = AudioPayload::silent(display_text, actions).forwarded();
        self.sessions
            .broadcast(&members, ServerMessage::Audio(payload), Some(client))
            .await;
    }

    // ========================================================================
    // Group Operations
    // ========================================================================

    async fn invite(&self, inviter: &ClientId, invitee: &ClientId) {
        match self.groups.invite(inviter, invitee) {
            Err(e) => self.send_result(inviter, false, e.to_string()).await,
            Ok(change) => {
                self.stop_single_conversation(inviter).await;
                self.stop_single_conversation(invitee).await;
                let _ = self.send_group_update(invitee).await;
                self.send_result(
                    invitee,
                    true,
                    format!("You have been invited to the group by {inviter}"),
                )
                .await;
                self.send_result(
                    inviter,
                    true,
                    format!("Successfully added {invitee} to the group"),
                )
                .await;
                self.notify_members(&change, inviter, invitee, "added to").await;
            }
        }
    }

    async fn remove(&self, remover: &ClientId, target: &ClientId) {
        match self.groups.remove(remover, target) {
            Err(e) => self.send_result(remover, false, e.to_string()).await,
            Ok(change) => {
                if change.dissolved() {
                    self.scheduler
                        .interrupt(&TaskKey::Group(change.group_id.clone()))
                        .await;
                }
                self.send_result(
                    remover,
                    true,
                    format!("Successfully removed {target} from the group"),
                )
                .await;
                let _ = self.send_group_update(target).await;
                if remover != target {
                    self.send_result(target, true, "You have been removed from the group")
                        .await;
                }
                self.notify_members(&change, remover, target, "removed from").await;
            }
        }
    }

    /// Stop a conversation still running under the client's own key
    ///
    /// Once grouped, the client schedules under the group key and could no
    /// longer reach it.
    async fn stop_single_conversation(&self, client: &ClientId) {
        if self
            .scheduler
            .interrupt(&TaskKey::Client(client.clone()))
            .await
        {
            tracing::info!(client = %client, "Single conversation stopped on joining a group");
        }
    }

    /// Update everyone affected by a change made by `initiator` to `target`
    async fn notify_members(
        &self,
        change: &MembershipChange,
        initiator: &ClientId,
        target: &ClientId,
        verb: &str,
    ) {
        for member in change.affected() {
            if member == *target {
                continue;
            }
            let _ = self.send_group_update(&member).await;
            if member != *initiator {
                self.send_result(&member, true, format!("Member {target} was {verb} the group"))
                    .await;
            }
        }
    }

    /// Tell the rest of a group that `client` left
    async fn notify_departure(&self, client: &ClientId, change: &MembershipChange) {
        for member in change.affected() {
            if member == *client {
                continue;
            }
            let _ = self.send_group_update(&member).await;
            self.send_result(&member, true, format!("Member {client} disconnected"))
                .await;
        }
    }

    async fn send_result(&self, client: &ClientId, success: bool, message: impl Into<String>) {
        let _ = self
            .sessions
            .send_to(client, ServerMessage::group_result(success, message))
            .await;
    }

    /// Send the client its current view of its group
    async fn send_group_update(&self, client: &ClientId) -> Result<(), TransportError> {
        let update = ServerMessage::GroupUpdate {
            members: self.groups.members_of(client),
            is_owner: self.groups.is_owner(client),
        };
        self.sessions.send_to(client, update).await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &ParleyConfig {
        &self.config
    }

    /// Connected sessions
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Group membership
    #[must_use]
    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    /// Running conversations
    #[must_use]
    pub fn scheduler(&self) -> &ConversationScheduler {
        &self.scheduler
    }

    /// Running group conversations
    #[must_use]
    pub fn group_states(&self) -> &ActiveGroupStates {
        &self.group_states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::PROACTIVE_NOTICE;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};

    fn hub() -> ConversationHub {
        ConversationHub::new(ParleyConfig::default())
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn results(messages: &[ServerMessage]) -> Vec<(bool, String)> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::GroupOperationResult { success, message } => {
                    Some((*success, message.clone()))
                }
                _ => None,
            })
            .collect()
    }

    // ========================================================================
    // Connection Tests
    // ========================================================================

    #[tokio::test]
    async fn test_greeting_sequence() {
        let hub = hub();
        let id = ClientId::from("a");
        let mut rx = hub.open(id.clone()).unwrap();
        assert_ok!(hub.greet(&id).await);

        let messages = drain(&mut rx);
        assert_eq!(messages[0], ServerMessage::full_text("Connection established"));
        assert_eq!(
            messages[1],
            ServerMessage::SetModelAndConf {
                client_uid: id.clone(),
                character_name: "AI".to_string(),
                avatar: None,
            }
        );
        assert_eq!(
            messages[2],
            ServerMessage::GroupUpdate {
                members: Vec::new(),
                is_owner: false
            }
        );
        assert_eq!(messages[3], ServerMessage::control(ControlSignal::StartMic));
    }

    #[tokio::test]
    async fn test_greeting_unknown_client_fails() {
        let hub = hub();
        assert_err!(hub.greet(&ClientId::from("ghost")).await);
    }

    #[tokio::test]
    async fn test_duplicate_open_rejected() {
        let hub = hub();
        let _rx = hub.open(ClientId::from("a")).unwrap();
        assert!(hub.open(ClientId::from("a")).is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_and_bad_messages() {
        let hub = hub();
        let id = ClientId::from("a");
        let mut rx = hub.open(id.clone()).unwrap();

        hub.handle_message(&id, "not json").await;
        hub.handle_message(&id, r#"{"type": "dance"}"#).await;
        hub.handle_message(&id, r#"{"type": "heartbeat"}"#).await;

        assert_eq!(drain(&mut rx), vec![ServerMessage::HeartbeatAck]);
    }

    #[tokio::test]
    async fn test_mic_audio_is_buffered() {
        let hub = hub();
        let id = ClientId::from("a");
        let _rx = hub.open(id.clone()).unwrap();

        hub.handle_event(&id, ClientEvent::MicAudioData { audio: vec![0.1, 0.2] })
            .await;
        assert_eq!(hub.sessions().take_audio(&id), vec![0.1, 0.2]);
    }

    // ========================================================================
    // Group Operation Tests
    // ========================================================================

    #[tokio::test]
    async fn test_invite_notifications() {
        let hub = hub();
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        let mut rx_a = hub.open(a.clone()).unwrap();
        let mut rx_b = hub.open(b.clone()).unwrap();

        hub.handle_event(&a, ClientEvent::AddClientToGroup { invitee_uid: b.clone() })
            .await;

        let to_a = drain(&mut rx_a);
        assert_eq!(
            results(&to_a),
            vec![(true, "Successfully added b to the group".to_string())]
        );
        assert!(to_a.contains(&ServerMessage::GroupUpdate {
            members: vec![a.clone(), b.clone()],
            is_owner: true,
        }));

        let to_b = drain(&mut rx_b);
        assert_eq!(
            results(&to_b),
            vec![(true, "You have been invited to the group by a".to_string())]
        );
        assert!(to_b.contains(&ServerMessage::GroupUpdate {
            members: vec![a.clone(), b.clone()],
            is_owner: false,
        }));
        assert_eq!(hub.task_key(&a), hub.task_key(&b));
    }

    #[tokio::test]
    async fn test_invite_unknown_client_fails() {
        let hub = hub();
        let a = ClientId::from("a");
        let mut rx_a = hub.open(a.clone()).unwrap();

        hub.handle_event(
            &a,
            ClientEvent::AddClientToGroup {
                invitee_uid: ClientId::from("ghost"),
            },
        )
        .await;

        assert_eq!(
            results(&drain(&mut rx_a)),
            vec![(false, "Invitee ghost does not exist".to_string())]
        );
        assert_eq!(hub.groups().group_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_notifications() {
        let hub = hub();
        let (a, b, c) = (ClientId::from("a"), ClientId::from("b"), ClientId::from("c"));
        let mut rx_a = hub.open(a.clone()).unwrap();
        let mut rx_b = hub.open(b.clone()).unwrap();
        let mut rx_c = hub.open(c.clone()).unwrap();
        hub.handle_event(&a, ClientEvent::AddClientToGroup { invitee_uid: b.clone() })
            .await;
        hub.handle_event(&a, ClientEvent::AddClientToGroup { invitee_uid: c.clone() })
            .await;
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        // Only the owner may remove someone else
        hub.handle_event(&b, ClientEvent::RemoveClientFromGroup { target_uid: c.clone() })
            .await;
        assert_eq!(
            results(&drain(&mut rx_b)),
            vec![(false, "Only group owner or self can remove members".to_string())]
        );

        hub.handle_event(&a, ClientEvent::RemoveClientFromGroup { target_uid: c.clone() })
            .await;
        assert_eq!(
            results(&drain(&mut rx_c)),
            vec![(true, "You have been removed from the group".to_string())]
        );
        assert_eq!(
            results(&drain(&mut rx_b)),
            vec![(true, "Member c was removed from the group".to_string())]
        );
        assert_eq!(
            results(&drain(&mut rx_a)),
            vec![(true, "Successfully removed c from the group".to_string())]
        );
    }

    #[tokio::test]
    async fn test_disconnect_notifies_group() {
        let hub = hub();
        let (a, b, c) = (ClientId::from("a"), ClientId::from("b"), ClientId::from("c"));
        let _rx_a = hub.open(a.clone()).unwrap();
        let mut rx_b = hub.open(b.clone()).unwrap();
        let _rx_c = hub.open(c.clone()).unwrap();
        hub.handle_event(&a, ClientEvent::AddClientToGroup { invitee_uid: b.clone() })
            .await;
        hub.handle_event(&a, ClientEvent::AddClientToGroup { invitee_uid: c.clone() })
            .await;
        drain(&mut rx_b);

        hub.disconnect(&a).await;

        let to_b = drain(&mut rx_b);
        assert!(to_b.contains(&ServerMessage::GroupUpdate {
            members: vec![b.clone(), c.clone()],
            is_owner: true,
        }));
        assert_eq!(
            results(&to_b),
            vec![(true, "Member a disconnected".to_string())]
        );
        assert!(!hub.sessions().contains(&a));
        assert!(!hub.groups().is_registered(&a));
    }

    #[tokio::test]
    async fn test_audio_play_start_forwarded_to_group() {
        let hub = hub();
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        let mut rx_a = hub.open(a.clone()).unwrap();
        let mut rx_b = hub.open(b.clone()).unwrap();
        hub.handle_event(&a, ClientEvent::AddClientToGroup { invitee_uid: b.clone() })
            .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle_message(
            &a,
            r#"{"type": "audio-play-start", "display_text": {"text": "Hi.", "name": "AI"}}"#,
        )
        .await;

        let to_b = drain(&mut rx_b);
        let [ServerMessage::Audio(payload)] = to_b.as_slice() else {
            panic!("expected one forwarded payload, got {to_b:?}");
        };
        assert!(payload.forwarded);
        assert!(payload.is_silent());
        assert_eq!(payload.display_text.as_ref().unwrap().text, "Hi.");
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_audio_play_start_without_text_not_forwarded() {
        let hub = hub();
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        let _rx_a = hub.open(a.clone()).unwrap();
        let mut rx_b = hub.open(b.clone()).unwrap();
        hub.handle_event(&a, ClientEvent::AddClientToGroup { invitee_uid: b.clone() })
            .await;
        drain(&mut rx_b);

        hub.handle_message(&a, r#"{"type": "audio-play-start"}"#).await;

        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_ai_speak_signal_starts_proactive_turn() {
        let hub = hub();
        let a = ClientId::from("a");
        let mut rx = hub.open(a.clone()).unwrap();

        hub.handle_message(&a, r#"{"type": "ai-speak-signal"}"#).await;

        let notice = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(ServerMessage::FullText { text }) if text == PROACTIVE_NOTICE => {
                        return true;
                    }
                    Some(_) => {}
                    None => return false,
                }
            }
        })
        .await;
        assert_eq!(notice, Ok(true));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_playback_complete_resolves_waiter() {
        let hub = hub();
        let a = ClientId::from("a");
        let _rx = hub.open(a.clone()).unwrap();

        let pending = hub.acks.expect(&a);
        hub.handle_event(&a, ClientEvent::FrontendPlaybackComplete).await;
        assert!(pending.wait(std::time::Duration::from_secs(1)).await);
    }
}
