//! Group Turn Coordination
//!
//! A group conversation is a round-robin over the members' AI personas. Each
//! cycle the front member of the queue is shown everything said since its last
//! turn, replies through its own connection, and goes to the back of the queue:
//!
//! ```text
//! transcript: ["Human: hello", "Alice: hi!", "Bob: hey"]
//!                    ▲                            ▲
//!              cursor(Bob)=1 ──── delta ──────────┘
//! ```
//!
//! The rotation has no natural end. It stops when its task is cancelled, or
//! when every member has left it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::TurnError;
use crate::events::ImageInput;
use crate::groups::{GroupId, GroupRegistry};
use crate::messages::ServerMessage;
use crate::providers::ConversationInput;
use crate::scheduler::TaskContext;
use crate::session::ClientId;
use crate::turn::{TurnInput, TurnRunner, PROACTIVE_NOTICE};

// ============================================================================
// Conversation State
// ============================================================================

/// The next member to speak and what it has not heard yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberTurn {
    /// Member whose persona speaks
    pub member: ClientId,
    /// Transcript lines since the member's cursor, joined by newlines
    pub context: String,
    /// Whether the member has not spoken in this conversation yet
    pub first_turn: bool,
}

/// Shared state of one running group conversation
#[derive(Debug)]
pub struct GroupConversationState {
    group_id: GroupId,
    queue: VecDeque<ClientId>,
    transcript: Vec<String>,
    cursors: HashMap<ClientId, usize>,
    failures: HashMap<ClientId, u32>,
    current_speaker: Option<ClientId>,
}

impl GroupConversationState {
    /// Start a conversation whose transcript opens with `opening`
    ///
    /// Every member's cursor starts at 0, so all of them see the opening line.
    /// An empty opening (the AI speaks first) leaves the transcript empty.
    #[must_use]
    pub fn new(group_id: GroupId, members: Vec<ClientId>, opening: String) -> Self {
        let cursors = members.iter().map(|m| (m.clone(), 0)).collect();
        let transcript = if opening.is_empty() {
            Vec::new()
        } else {
            vec![opening]
        };
        Self {
            group_id,
            queue: members.into(),
            transcript,
            cursors,
            failures: HashMap::new(),
            current_speaker: None,
        }
    }

    /// Group this conversation belongs to
    #[must_use]
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Pop the next member and compute its context
    pub fn next_turn(&mut self) -> Option<MemberTurn> {
        let member = self.queue.pop_front()?;
        let cursor = self.cursors.get(&member).copied().unwrap_or(0);
        let context = self.transcript[cursor.min(self.transcript.len())..].join("\n");
        self.current_speaker = Some(member.clone());
        Some(MemberTurn {
            member,
            context,
            first_turn: cursor == 0,
        })
    }

    /// Record a member's reply and put it back in line
    ///
    /// `line` is the transcript entry for the reply, `None` when the member
    /// said nothing.
    pub fn complete_turn(&mut self, member: &ClientId, line: Option<String>) {
        if let Some(line) = line {
            self.transcript.push(line);
        }
        self.failures.remove(member);
        self.end_turn(member, true);
    }

    /// Treat a failed turn as an empty reply
    ///
    /// The member is re-queued until it has failed `max_failures` times in a
    /// row. Returns whether it was re-queued.
    pub fn fail_turn(&mut self, member: &ClientId, max_failures: u32) -> bool {
        let failures = self.failures.entry(member.clone()).or_insert(0);
        *failures += 1;
        let requeue = *failures < max_failures;
        self.end_turn(member, requeue);
        if !requeue {
            self.cursors.remove(member);
            self.failures.remove(member);
        }
        requeue
    }

    /// Take a member out of the rotation
    pub fn remove_member(&mut self, member: &ClientId) {
        self.queue.retain(|m| m != member);
        self.cursors.remove(member);
        self.failures.remove(member);
        if self.current_speaker.as_ref() == Some(member) {
            self.current_speaker = None;
        }
    }

    fn end_turn(&mut self, member: &ClientId, requeue: bool) {
        self.cursors.insert(member.clone(), self.transcript.len());
        if requeue {
            self.queue.push_back(member.clone());
        }
        self.current_speaker = None;
    }

    /// Everything said so far
    #[must_use]
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Transcript index a member has seen up to
    #[must_use]
    pub fn cursor(&self, member: &ClientId) -> Option<usize> {
        self.cursors.get(member).copied()
    }

    /// Members waiting for a turn, front first
    #[must_use]
    pub fn queue(&self) -> Vec<ClientId> {
        self.queue.iter().cloned().collect()
    }

    /// Member currently speaking
    #[must_use]
    pub fn current_speaker(&self) -> Option<&ClientId> {
        self.current_speaker.as_ref()
    }
}

// ============================================================================
// Active States
// ============================================================================

/// Group conversations currently running, by group
///
/// Entries exist exactly while their [`ActiveGroupGuard`] lives.
#[derive(Clone, Debug, Default)]
pub struct ActiveGroupStates {
    states: Arc<DashMap<GroupId, Arc<Mutex<GroupConversationState>>>>,
}

/// Keeps a state registered; removes it when dropped
#[derive(Debug)]
pub struct ActiveGroupGuard {
    states: Arc<DashMap<GroupId, Arc<Mutex<GroupConversationState>>>>,
    group_id: GroupId,
    state: Arc<Mutex<GroupConversationState>>,
}

impl ActiveGroupGuard {
    /// The registered state
    #[must_use]
    pub fn state(&self) -> &Arc<Mutex<GroupConversationState>> {
        &self.state
    }
}

impl Drop for ActiveGroupGuard {
    fn drop(&mut self) {
        self.states
            .remove_if(&self.group_id, |_, s| Arc::ptr_eq(s, &self.state));
        tracing::debug!(group = %self.group_id, "Group conversation state removed");
    }
}

impl ActiveGroupStates {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `state` for its group
    pub fn activate(&self, state: GroupConversationState) -> ActiveGroupGuard {
        let group_id = state.group_id().clone();
        let state = Arc::new(Mutex::new(state));
        self.states.insert(group_id.clone(), Arc::clone(&state));
        ActiveGroupGuard {
            states: Arc::clone(&self.states),
            group_id,
            state,
        }
    }

    /// Whether a conversation is running for the group
    #[must_use]
    pub fn is_active(&self, group_id: &GroupId) -> bool {
        self.states.contains_key(group_id)
    }

    /// Member speaking in the group's conversation
    #[must_use]
    pub fn current_speaker(&self, group_id: &GroupId) -> Option<ClientId> {
        let state = self.states.get(group_id).map(|s| Arc::clone(s.value()))?;
        let speaker = state.lock().current_speaker().cloned();
        speaker
    }

    /// Copy of the group's transcript
    #[must_use]
    pub fn transcript(&self, group_id: &GroupId) -> Option<Vec<String>> {
        let state = self.states.get(group_id).map(|s| Arc::clone(s.value()))?;
        let transcript = state.lock().transcript().to_vec();
        Some(transcript)
    }

    /// Number of running group conversations
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True when no group conversation runs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives the round-robin of one group conversation
#[derive(Clone, Debug)]
pub struct GroupTurnCoordinator {
    runner: TurnRunner,
    groups: GroupRegistry,
    states: ActiveGroupStates,
    max_member_failures: u32,
}

impl GroupTurnCoordinator {
    /// Create a coordinator
    #[must_use]
    pub fn new(
        runner: TurnRunner,
        groups: GroupRegistry,
        states: ActiveGroupStates,
        max_member_failures: u32,
    ) -> Self {
        Self {
            runner,
            groups,
            states,
            max_member_failures: max_member_failures.max(1),
        }
    }

    /// Body of a group conversation started by `initiator`
    ///
    /// Runs until cancelled or until no member is left in the rotation.
    pub async fn run(
        self,
        group_id: GroupId,
        initiator: ClientId,
        input: TurnInput,
        task: TaskContext,
    ) -> Result<(), TurnError> {
        let Some(group) = self.groups.group(&group_id) else {
            tracing::debug!(group = %group_id, "Group vanished before its conversation started");
            return Ok(());
        };
        let members = group.member_list();
        let images = input.images();

        let initiator_context = self.runner.session_context(&initiator)?;
        let human_name = initiator_context.character.human_name.clone();
        if input == TurnInput::Proactive {
            self.runner
                .sessions()
                .send_to(&initiator, ServerMessage::full_text(PROACTIVE_NOTICE))
                .await?;
        }
        let text = match self
            .runner
            .resolve_input(&initiator, &initiator_context, input, &members)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                self.report_error(&members, &e).await;
                return Err(e);
            }
        };

        tracing::info!(group = %group_id, members = members.len(), input = %text, "Group conversation started");
        let opening = if text.is_empty() {
            String::new()
        } else {
            format!("{human_name}: {text}")
        };
        let guard = self.states.activate(GroupConversationState::new(
            group_id.clone(),
            members,
            opening,
        ));

        loop {
            if task.is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            let Some(turn) = guard.state().lock().next_turn() else {
                break;
            };

            let Some(group) = self
                .groups
                .group_of(&turn.member)
                .filter(|g| g.id == group_id)
            else {
                tracing::info!(group = %group_id, member = %turn.member, "Member left the group, dropping from rotation");
                guard.state().lock().remove_member(&turn.member);
                continue;
            };
            let members = group.member_list();

            let images = if turn.first_turn { images.clone() } else { Vec::new() };
            match self.member_turn(&turn, &members, images, &task).await {
                Ok(line) => guard.state().lock().complete_turn(&turn.member, line),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(group = %group_id, member = %turn.member, error = %e, "Group member turn failed");
                    self.report_error(&members, &e).await;
                    let requeued = guard
                        .state()
                        .lock()
                        .fail_turn(&turn.member, self.max_member_failures);
                    if !requeued {
                        tracing::warn!(
                            group = %group_id,
                            member = %turn.member,
                            failures = self.max_member_failures,
                            "Member dropped from rotation after repeated failures"
                        );
                    }
                }
            }
        }

        tracing::info!(group = %group_id, "Group conversation ended, rotation is empty");
        Ok(())
    }

    /// One member's slot: returns the transcript line for its reply
    async fn member_turn(
        &self,
        turn: &MemberTurn,
        members: &[ClientId],
        images: Vec<ImageInput>,
        task: &TaskContext,
    ) -> Result<Option<String>, TurnError> {
        let context = self.runner.session_context(&turn.member)?;
        self.runner.announce(&turn.member, members).await?;

        tracing::debug!(member = %turn.member, character = %context.character.name, context = %turn.context, "Member receiving context");
        let input = ConversationInput {
            text: turn.context.clone(),
            from_name: context.character.human_name.clone(),
            images,
        };
        let (reply, report) = self.runner.speak(&turn.member, &context, input, task).await?;
        self.runner.finalize(&turn.member, members, report).await?;
        self.runner.sessions().advance_history(&turn.member);

        Ok((!reply.is_empty()).then(|| format!("{}: {reply}", context.character.name)))
    }

    async fn report_error(&self, members: &[ClientId], error: &TurnError) {
        self.runner
            .sessions()
            .broadcast(
                members,
                ServerMessage::error(format!("Error in conversation: {error}")),
                None,
            )
            .await;
    }
}
