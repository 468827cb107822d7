//! Ordered Delivery Queue
//!
//! One turn's sentences are synthesized concurrently, but the client must play
//! them in the order they were written. The queue numbers every fragment when it
//! is submitted and a drainer task releases finished payloads strictly by that
//! number:
//!
//! ```text
//!  speak("A.") ─▶ seq 0 ─▶ synth ──────────────┐
//!  speak("B.") ─▶ seq 1 ─▶ synth ──┐           │
//!  speak("  ") ─▶ seq 2 ─▶ silent  │           │
//!                                  ▼           ▼
//!                       drainer: ReorderBuffer { 1, 2 } ─▶ wait for 0 ─▶ 0, 1, 2
//! ```
//!
//! A fragment that needs no synthesis, or whose synthesis fails, still gets a
//! silent payload carrying its display text, so one bad sentence never holds
//! back the ones after it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::TransportError;
use crate::messages::{Actions, AudioPayload, DisplayText, ServerMessage};
use crate::providers::{RenderedAudio, Synthesizer};
use crate::scheduler::TaskContext;
use crate::session::ClientId;
use crate::transport::MessageSink;

/// Characters that carry nothing to say on their own
const SILENT_CHARS: &[char] = &[
    '.', ',', '!', '?', '，', '。', '！', '？', '\'', '"', '』', '」', '）', '】',
];

/// Whether `text` is empty, whitespace, or punctuation only
#[must_use]
pub fn is_silent_text(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_whitespace() || SILENT_CHARS.contains(&c))
}

// ============================================================================
// Reorder Buffer
// ============================================================================

/// Releases items strictly in sequence order, whatever order they arrive in
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeMap<u64, T>,
    next_expected: u64,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_expected: 0,
        }
    }
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer expecting sequence number 0 first
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept item `seq`, returning every item now releasable in order
    ///
    /// Sequence numbers already released are ignored.
    pub fn insert(&mut self, seq: u64, item: T) -> Vec<T> {
        if seq < self.next_expected {
            tracing::warn!(seq, next_expected = self.next_expected, "Duplicate sequence number dropped");
            return Vec::new();
        }
        self.pending.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_expected) {
            ready.push(item);
            self.next_expected += 1;
        }
        ready
    }

    /// The sequence number the buffer is waiting for
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Items held back waiting for an earlier one
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Delivery Queue
// ============================================================================

/// Counts for one drained queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Fragments submitted
    pub submitted: u64,
    /// Payloads sent to the client
    pub delivered: u64,
}

impl DeliveryReport {
    /// Whether anything was queued this turn
    #[must_use]
    pub fn had_work(&self) -> bool {
        self.submitted > 0
    }
}

type Completion = (u64, AudioPayload);

/// Per-turn queue delivering one speaker's payloads to one client in order
pub struct OrderedDeliveryQueue {
    client: ClientId,
    sink: Arc<dyn MessageSink>,
    synthesizer: Arc<dyn Synthesizer>,
    speaker_name: String,
    speaker_avatar: Option<String>,
    /// The owning task's scope
    parent: TaskContext,
    /// This queue's own scope, nested in `parent`
    scope: TaskContext,
    /// Tracks this queue's synthesis tasks only
    fragments: TaskTracker,
    next_seq: u64,
    completions: Option<mpsc::UnboundedSender<Completion>>,
    drainer: Option<JoinHandle<Option<Result<u64, TransportError>>>>,
}

impl OrderedDeliveryQueue {
    /// Create a queue delivering to `client`
    ///
    /// Work spawned by the queue is tracked by `context`, so tearing the owning
    /// task down also stops and awaits the queue.
    #[must_use]
    pub fn new(
        client: ClientId,
        sink: Arc<dyn MessageSink>,
        synthesizer: Arc<dyn Synthesizer>,
        context: &TaskContext,
    ) -> Self {
        Self {
            client,
            sink,
            synthesizer,
            speaker_name: String::new(),
            speaker_avatar: None,
            parent: context.clone(),
            scope: context.child(),
            fragments: TaskTracker::new(),
            next_seq: 0,
            completions: None,
            drainer: None,
        }
    }

    /// Attribute display texts that name no speaker to this one
    #[must_use]
    pub fn with_speaker(mut self, name: impl Into<String>, avatar: Option<String>) -> Self {
        self.speaker_name = name.into();
        self.speaker_avatar = avatar;
        self
    }

    /// Client receiving the payloads
    #[must_use]
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// Fragments submitted since creation or the last [`clear`](Self::clear)
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.next_seq
    }

    /// Queue a sentence for synthesis, returning its sequence number
    pub fn speak(&mut self, display: DisplayText, tts_text: String, actions: Actions) -> u64 {
        let seq = self.next_sequence();
        let display = self.attribute(display);
        let tx = self.sender();

        if is_silent_text(&tts_text) {
            tracing::debug!(client = %self.client, seq, "Nothing to synthesize, sending silent payload");
            let _ = tx.send((seq, AudioPayload::silent(Some(display), Some(actions))));
            return seq;
        }

        let synthesizer = Arc::clone(&self.synthesizer);
        let client = self.client.clone();
        let fragment = async move {
            let payload = match synthesizer.synthesize(&tts_text).await {
                Ok(synthesized) => {
                    let audio = synthesized.audio;
                    let payload = AudioPayload::with_audio(
                        &audio.bytes,
                        audio.volumes,
                        audio.slice_length_ms,
                        Some(display),
                        Some(actions),
                    );
                    synthesizer.release(synthesized.handle).await;
                    payload
                }
                Err(e) => {
                    if e.is_disabled() {
                        tracing::debug!(client = %client, seq, "Synthesis disabled, sending silent payload");
                    } else {
                        tracing::warn!(client = %client, seq, error = %e, "Synthesis failed, sending silent payload");
                    }
                    AudioPayload::silent(Some(display), Some(actions))
                }
            };
            // The drainer is gone only if the queue was cleared
            let _ = tx.send((seq, payload));
        };
        self.scope.spawn(self.fragments.track_future(fragment));
        seq
    }

    /// Queue audio that is already rendered, returning its sequence number
    pub fn push_ready(&mut self, audio: RenderedAudio, display: DisplayText, actions: Actions) -> u64 {
        let seq = self.next_sequence();
        let display = self.attribute(display);
        let payload = AudioPayload::with_audio(
            &audio.bytes,
            audio.volumes,
            audio.slice_length_ms,
            Some(display),
            Some(actions),
        );
        let _ = self.sender().send((seq, payload));
        seq
    }

    /// Wait until every submitted payload has been delivered
    ///
    /// # Errors
    ///
    /// [`TransportError`] if the client went away while payloads were pending.
    pub async fn finish(&mut self) -> Result<DeliveryReport, TransportError> {
        let submitted = self.next_seq;
        // Fragments hold their own senders; the channel closes once they end
        self.completions = None;
        self.fragments.close();
        self.fragments.wait().await;

        let delivered = match self.drainer.take() {
            Some(drainer) => match drainer.await {
                Ok(Some(result)) => result?,
                // Cancelled or aborted together with the turn
                Ok(None) | Err(_) => 0,
            },
            None => 0,
        };

        self.fragments = TaskTracker::new();
        self.next_seq = 0;
        Ok(DeliveryReport {
            submitted,
            delivered,
        })
    }

    /// Stop all synthesis and delivery for this turn and reset the counters
    pub async fn clear(&mut self) {
        self.scope.cancel();
        self.completions = None;
        self.fragments.close();
        self.fragments.wait().await;
        if let Some(drainer) = self.drainer.take() {
            let _ = drainer.await;
        }

        tracing::debug!(client = %self.client, discarded = self.next_seq, "Delivery queue cleared");
        self.scope = self.parent.child();
        self.fragments = TaskTracker::new();
        self.next_seq = 0;
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn attribute(&self, display: DisplayText) -> DisplayText {
        if display.name.is_some() || self.speaker_name.is_empty() {
            return display;
        }
        display.with_speaker(self.speaker_name.clone(), self.speaker_avatar.clone())
    }

    /// Completion sender, starting the drainer on first use
    fn sender(&mut self) -> mpsc::UnboundedSender<Completion> {
        if let Some(tx) = &self.completions {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let drain = drain(self.client.clone(), Arc::clone(&self.sink), rx);
        self.drainer = Some(self.scope.spawn(drain));
        self.completions = Some(tx.clone());
        tx
    }
}

impl std::fmt::Debug for OrderedDeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedDeliveryQueue")
            .field("client", &self.client)
            .field("next_seq", &self.next_seq)
            .field("draining", &self.drainer.is_some())
            .finish_non_exhaustive()
    }
}

/// Send completions to the client in sequence order until the channel closes
async fn drain(
    client: ClientId,
    sink: Arc<dyn MessageSink>,
    mut rx: mpsc::UnboundedReceiver<Completion>,
) -> Result<u64, TransportError> {
    let mut buffer = ReorderBuffer::new();
    let mut delivered = 0;

    while let Some((seq, payload)) = rx.recv().await {
        for payload in buffer.insert(seq, payload) {
            sink.send(&client, ServerMessage::Audio(payload)).await?;
            delivered += 1;
        }
    }

    if buffer.pending() > 0 {
        tracing::warn!(
            client = %client,
            waiting_for = buffer.next_expected(),
            stranded = buffer.pending(),
            "Payloads left undelivered"
        );
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use crate::error::ProviderError;
    use crate::providers::{AudioHandle, SynthesizedAudio};

    /// Records everything sent, per client
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ClientId, ServerMessage)>>,
        closed: bool,
    }

    impl RecordingSink {
        fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(_, msg)| match msg {
                    ServerMessage::Audio(p) => p.display_text.as_ref().map(|d| d.text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn payloads(&self) -> Vec<AudioPayload> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(_, msg)| match msg {
                    ServerMessage::Audio(p) => Some(p.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send(&self, client: &ClientId, message: ServerMessage) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Closed(client.clone()));
            }
            self.sent.lock().push((client.clone(), message));
            Ok(())
        }
    }

    /// Synthesizer with a scripted delay (ms) or failure per text
    #[derive(Default)]
    struct ScriptedSynthesizer {
        delays: HashMap<String, u64>,
        failing: Vec<String>,
        released: Mutex<Vec<AudioHandle>>,
    }

    impl ScriptedSynthesizer {
        fn with_delays(delays: &[(&str, u64)]) -> Self {
            Self {
                delays: delays.iter().map(|(t, d)| ((*t).to_string(), *d)).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Synthesizer for ScriptedSynthesizer {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, ProviderError> {
            let delay = self.delays.get(text).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.failing.iter().any(|f| f == text) {
                return Err(ProviderError::Backend {
                    backend: "scripted",
                    reason: format!("cannot say {text}"),
                });
            }
            Ok(SynthesizedAudio {
                handle: AudioHandle::generate(),
                audio: RenderedAudio {
                    bytes: text.as_bytes().to_vec(),
                    volumes: vec![0.5],
                    slice_length_ms: 20,
                },
            })
        }

        async fn release(&self, handle: AudioHandle) {
            self.released.lock().push(handle);
        }
    }

    fn queue_for(
        sink: &Arc<RecordingSink>,
        synthesizer: &Arc<ScriptedSynthesizer>,
        context: &TaskContext,
    ) -> OrderedDeliveryQueue {
        OrderedDeliveryQueue::new(
            ClientId::from("a"),
            Arc::clone(sink) as Arc<dyn MessageSink>,
            Arc::clone(synthesizer) as Arc<dyn Synthesizer>,
            context,
        )
    }

    fn say(queue: &mut OrderedDeliveryQueue, text: &str) -> u64 {
        queue.speak(DisplayText::new(text), text.to_string(), Actions::default())
    }

    // ========================================================================
    // Reorder Buffer Tests
    // ========================================================================

    /// Every ordering of `items`, generated by Heap's algorithm
    fn permutations(items: &mut Vec<u64>, k: usize, out: &mut Vec<Vec<u64>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        for i in 0..k {
            permutations(items, k - 1, out);
            let j = if k % 2 == 0 { i } else { 0 };
            items.swap(j, k - 1);
        }
    }

    #[test]
    fn test_reorder_buffer_any_arrival_order() {
        let mut orders = Vec::new();
        permutations(&mut (0..5).collect(), 5, &mut orders);
        assert_eq!(orders.len(), 120);

        for order in orders {
            let mut buffer = ReorderBuffer::new();
            let released: Vec<u64> = order
                .iter()
                .flat_map(|&seq| buffer.insert(seq, seq))
                .collect();
            assert_eq!(released, vec![0, 1, 2, 3, 4], "arrival order {order:?}");
            assert_eq!(buffer.pending(), 0);
        }
    }

    #[test]
    fn test_reorder_buffer_holds_until_gap_filled() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(2, "c").is_empty());
        assert!(buffer.insert(1, "b").is_empty());
        assert_eq!(buffer.pending(), 2);
        assert_eq!(buffer.insert(0, "a"), vec!["a", "b", "c"]);
        assert_eq!(buffer.next_expected(), 3);
        // Already released
        assert!(buffer.insert(1, "again").is_empty());
    }

    #[test]
    fn test_silent_text() {
        assert!(is_silent_text(""));
        assert!(is_silent_text("   "));
        assert!(is_silent_text("...!?"));
        assert!(is_silent_text("。」"));
        assert!(!is_silent_text("Hi."));
        assert!(!is_silent_text("好。"));
    }

    // ========================================================================
    // Queue Tests
    // ========================================================================

    #[tokio::test]
    async fn test_delivers_in_submission_order_despite_completion_order() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer::with_delays(&[
            ("First.", 60),
            ("Second.", 30),
            ("Third.", 0),
        ]));
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        assert_eq!(say(&mut queue, "First."), 0);
        assert_eq!(say(&mut queue, "Second."), 1);
        assert_eq!(say(&mut queue, "Third."), 2);

        let report = queue.finish().await.unwrap();
        assert_eq!(report, DeliveryReport { submitted: 3, delivered: 3 });
        assert_eq!(sink.texts(), vec!["First.", "Second.", "Third."]);
        assert_eq!(synth.released.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_fragment_becomes_silent_and_does_not_block() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer {
            delays: HashMap::from([("Broken.".to_string(), 40)]),
            failing: vec!["Broken.".to_string()],
            ..ScriptedSynthesizer::default()
        });
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        say(&mut queue, "Broken.");
        say(&mut queue, "Fine.");
        queue.finish().await.unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].is_silent());
        assert_eq!(payloads[0].display_text.as_ref().unwrap().text, "Broken.");
        assert!(!payloads[1].is_silent());
    }

    #[tokio::test]
    async fn test_blank_fragment_keeps_its_slot() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer::with_delays(&[("Late.", 30)]));
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        say(&mut queue, "Late.");
        say(&mut queue, "...");
        say(&mut queue, "Done.");
        queue.finish().await.unwrap();

        assert_eq!(sink.texts(), vec!["Late.", "...", "Done."]);
        assert!(sink.payloads()[1].is_silent());
    }

    #[tokio::test]
    async fn test_pre_rendered_audio_shares_the_sequence() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer::with_delays(&[("Spoken.", 30)]));
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        say(&mut queue, "Spoken.");
        let seq = queue.push_ready(
            RenderedAudio {
                bytes: vec![1, 2, 3],
                volumes: vec![0.1],
                slice_length_ms: 20,
            },
            DisplayText::new("Rendered."),
            Actions::default(),
        );
        assert_eq!(seq, 1);
        queue.finish().await.unwrap();

        assert_eq!(sink.texts(), vec!["Spoken.", "Rendered."]);
    }

    #[tokio::test]
    async fn test_speaker_attribution() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer::default());
        let context = TaskContext::new();
        let mut queue =
            queue_for(&sink, &synth, &context).with_speaker("Mika", Some("mika.png".to_string()));

        say(&mut queue, "Hi.");
        queue.finish().await.unwrap();

        let display = sink.payloads()[0].display_text.clone().unwrap();
        assert_eq!(display.name.as_deref(), Some("Mika"));
        assert_eq!(display.avatar.as_deref(), Some("mika.png"));
    }

    #[tokio::test]
    async fn test_finish_without_work() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer::default());
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        let report = queue.finish().await.unwrap();
        assert!(!report.had_work());
    }

    #[tokio::test]
    async fn test_closed_client_reports_transport_error() {
        let sink = Arc::new(RecordingSink {
            closed: true,
            ..RecordingSink::default()
        });
        let synth = Arc::new(ScriptedSynthesizer::default());
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        say(&mut queue, "Hello.");
        let err = queue.finish().await.unwrap_err();
        assert_eq!(err, TransportError::Closed(ClientId::from("a")));
    }

    #[tokio::test]
    async fn test_clear_discards_pending_and_resets() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer::with_delays(&[("Slow.", 5_000)]));
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        say(&mut queue, "Slow.");
        say(&mut queue, "Quick.");
        queue.clear().await;
        assert_eq!(queue.submitted(), 0);
        assert!(sink.texts().is_empty());

        // The queue is usable again and numbering restarts
        assert_eq!(say(&mut queue, "Again."), 0);
        queue.finish().await.unwrap();
        assert_eq!(sink.texts(), vec!["Again."]);
    }

    #[tokio::test]
    async fn test_task_cancellation_stops_queue() {
        let sink = Arc::new(RecordingSink::default());
        let synth = Arc::new(ScriptedSynthesizer::with_delays(&[("Slow.", 5_000)]));
        let context = TaskContext::new();
        let mut queue = queue_for(&sink, &synth, &context);

        say(&mut queue, "Slow.");
        context.cancel();

        let report = tokio::time::timeout(Duration::from_secs(1), queue.finish())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.delivered, 0);
        assert!(sink.texts().is_empty());
    }
}
