//! Voice Model Client (C7): the bidirectional streaming connection to the
//! speech model kept open for the life of an `AgentSession` (§4.7).
//!
//! Wire framing lives behind the `VoiceTransport` seam so the policy logic
//! here — dedup, debounce, interruption, speculative-audio suppression,
//! auto-nudge, lifecycle ordering — is exercised without a live connection.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::runtime::{ToolCatalogEntry, VoiceClient};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const USER_TEXT_DEBOUNCE: Duration = Duration::from_millis(500);
const STOP_SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const SILENT_PRIME_MS: u32 = 100;
const SILENT_PRIME_SAMPLE_RATE_HZ: u32 = 16_000;

const AUTO_NUDGE_TEXT: &str =
    "[SYSTEM_INJECTION]: You said you would perform an action. CALL THE TOOL NOW.";

const FILLER_PHRASES: [&str; 2] = ["Let me check that for you", "Just a moment more"];

fn default_commitment_patterns() -> RegexSet {
    RegexSet::new([
        r"(?i)i'll check",
        r"(?i)i will check",
        r"(?i)let me verify",
        r"(?i)just a moment",
        r"(?i)give me (a|one) (second|moment)",
        r"(?i)one moment please",
    ])
    .expect("static commitment regex set is valid")
}

static COMMITMENT_PATTERNS: Lazy<RegexSet> = Lazy::new(default_commitment_patterns);

/// Replaces `COMMITMENT_PATTERNS` for the lifetime of the process once
/// `load_nudge_patterns` has read a `nudge_patterns.yaml` file at startup.
static LOADED_NUDGE_PATTERNS: OnceCell<RegexSet> = OnceCell::new();

/// One row of `nudge_patterns.yaml`: `pattern` is a raw regex body, `flags`
/// (e.g. `"i"`) is wrapped into an inline flag group when non-empty.
#[derive(Debug, Clone, Deserialize)]
struct NudgePatternEntry {
    pattern: String,
    #[serde(default)]
    flags: String,
}

/// Loads the auto-nudge commitment-pattern table (§4.7) from a YAML list of
/// `{pattern, flags}` entries, so it is tunable without a code change.
/// Call once at startup; a missing/unreadable file is the caller's call to
/// make (the built-in defaults remain in effect until this succeeds).
pub fn load_nudge_patterns(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let set = parse_nudge_patterns(&raw)?;
    let _ = LOADED_NUDGE_PATTERNS.set(set);
    Ok(())
}

fn parse_nudge_patterns(raw: &str) -> Result<RegexSet> {
    let entries: Vec<NudgePatternEntry> = serde_yaml::from_str(raw)?;
    let patterns: Vec<String> = entries
        .into_iter()
        .map(|e| if e.flags.is_empty() { e.pattern } else { format!("(?{}){}", e.flags, e.pattern) })
        .collect();
    Ok(RegexSet::new(&patterns)?)
}

/// What the Runtime sends the voice model, named after §4.7's outbound list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboundVoiceEvent {
    ConfigureSession {
        system_prompt: String,
        voice_id: String,
        tools: Vec<ToolCatalogEntry>,
    },
    StartSession {
        session_id: String,
    },
    SendAudioChunk {
        pcm16le: Vec<u8>,
    },
    SendUserText {
        text: String,
    },
    SendToolResult {
        tool_use_id: String,
        result: Value,
        success: bool,
    },
    UpdateSystemPrompt {
        text: String,
    },
    StopSession,
}

impl OutboundVoiceEvent {
    /// Lower sorts first. Tool results > text/control > audio (§5).
    fn priority(&self) -> u8 {
        match self {
            OutboundVoiceEvent::SendToolResult { .. } => 0,
            OutboundVoiceEvent::SendAudioChunk { .. } => 2,
            _ => 1,
        }
    }

    fn is_audio(&self) -> bool {
        matches!(self, OutboundVoiceEvent::SendAudioChunk { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationStage {
    Speculative,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EndTurn,
    Interrupted,
    PartialTurn,
}

/// Inbound events from the model, named after §4.7's inbound list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundVoiceEvent {
    Audio {
        pcm: Vec<u8>,
        stage: GenerationStage,
    },
    Transcript {
        role: String,
        text: String,
        is_final: bool,
        turn_id: String,
        stage: GenerationStage,
    },
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    ContentStart {
        role: String,
    },
    ContentEnd {
        role: String,
        stop_reason: StopReason,
    },
    InteractionTurnEnd,
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    Interruption,
    Error {
        kind: String,
        message: String,
    },
}

/// Raw bidirectional transport the model speaks over. Concrete
/// implementations (e.g. a JSON-over-WebSocket dial-out) frame each
/// outbound event and parse inbound frames back into `InboundVoiceEvent`;
/// this trait is the seam so the policy logic above can be driven by a
/// recording fake in tests.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn send_frame(&self, event: &OutboundVoiceEvent) -> Result<()>;
    async fn recv_frame(&self) -> Result<Option<InboundVoiceEvent>>;
}

/// Bounded FIFO of outbound work (§5). Tool results take priority over
/// text/control events, which take priority over audio; overflow drops the
/// oldest queued audio chunk first and never a text or tool-result event.
#[derive(Default)]
struct OutboundQueue {
    items: VecDeque<OutboundVoiceEvent>,
}

impl OutboundQueue {
    fn push(&mut self, event: OutboundVoiceEvent) {
        if self.items.len() >= OUTBOUND_QUEUE_CAPACITY {
            if let Some(pos) = self.items.iter().position(|e| e.is_audio()) {
                self.items.remove(pos);
            } else if event.is_audio() {
                warn!("voice outbound queue full of non-audio work; dropping incoming audio chunk");
                return;
            }
        }
        let priority = event.priority();
        let insert_at = self
            .items
            .iter()
            .position(|e| e.priority() > priority)
            .unwrap_or(self.items.len());
        self.items.insert(insert_at, event);
    }

    fn pop(&mut self) -> Option<OutboundVoiceEvent> {
        self.items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Default)]
struct UserTextDebouncer {
    last: Option<(String, Instant)>,
}

impl UserTextDebouncer {
    fn should_send(&mut self, text: &str) -> bool {
        if is_filler_phrase(text) {
            self.last = Some((text.to_string(), Instant::now()));
            return true;
        }
        let now = Instant::now();
        if let Some((last_text, at)) = &self.last {
            if last_text == text && now.saturating_duration_since(*at) < USER_TEXT_DEBOUNCE {
                return false;
            }
        }
        self.last = Some((text.to_string(), now));
        true
    }
}

fn is_filler_phrase(text: &str) -> bool {
    FILLER_PHRASES.iter().any(|p| p.eq_ignore_ascii_case(text.trim()))
}

/// Dropped before forwarding: audio drafts for a turn whose final version
/// has not landed yet would otherwise play and then be superseded (§4.7).
pub fn should_forward_audio(stage: GenerationStage) -> bool {
    stage != GenerationStage::Speculative
}

pub fn contains_commitment_pattern(text: &str) -> bool {
    LOADED_NUDGE_PATTERNS.get().unwrap_or(&COMMITMENT_PATTERNS).is_match(text)
}

/// Local voice-activity gate: while the assistant is speaking, an incoming
/// user-audio energy spike above threshold fires `Interruption` once per
/// assistant turn and silences further assistant audio until the next turn.
pub struct InterruptionGate {
    energy_threshold: f32,
    assistant_speaking: bool,
    interrupted_this_turn: bool,
}

impl InterruptionGate {
    pub fn new(energy_threshold: f32) -> Self {
        Self {
            energy_threshold,
            assistant_speaking: false,
            interrupted_this_turn: false,
        }
    }

    pub fn on_content_start(&mut self, role: &str) {
        if role == "assistant" {
            self.assistant_speaking = true;
            self.interrupted_this_turn = false;
        }
    }

    pub fn on_content_end(&mut self, role: &str) {
        if role == "assistant" {
            self.assistant_speaking = false;
        }
    }

    /// Returns `true` the first time `energy` crosses the threshold during
    /// an assistant turn; `false` thereafter until the next turn starts.
    pub fn observe_user_audio_energy(&mut self, energy: f32) -> bool {
        if self.assistant_speaking && !self.interrupted_this_turn && energy > self.energy_threshold {
            self.interrupted_this_turn = true;
            return true;
        }
        false
    }

    pub fn should_forward_assistant_audio(&self) -> bool {
        !self.interrupted_this_turn
    }
}

/// Tracks whether the assistant's text this turn matched a commitment
/// pattern ("I'll check...") without a tool call following, so the Runtime
/// can nudge it exactly once per turn (§4.7).
#[derive(Default)]
pub struct AutoNudgeTracker {
    assistant_text_this_turn: String,
    tool_called_this_turn: bool,
}

impl AutoNudgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_assistant_text(&mut self, text: &str) {
        self.assistant_text_this_turn.push_str(text);
    }

    pub fn on_tool_called(&mut self) {
        self.tool_called_this_turn = true;
    }

    /// Call when a turn ends (`END_TURN`, final stage, no active content
    /// blocks). Returns the nudge text at most once per turn.
    pub fn on_turn_end(&mut self) -> Option<&'static str> {
        let nudge = !self.tool_called_this_turn
            && contains_commitment_pattern(&self.assistant_text_this_turn);
        self.assistant_text_this_turn.clear();
        self.tool_called_this_turn = false;
        nudge.then_some(AUTO_NUDGE_TEXT)
    }
}

fn silent_prime_samples() -> Vec<u8> {
    let sample_count = (SILENT_PRIME_SAMPLE_RATE_HZ * SILENT_PRIME_MS) / 1000;
    vec![0u8; (sample_count as usize) * 2]
}

/// Drains the bounded outbound queue into the transport. `VoiceModelClient`
/// owns one of these per session, spawned on construction.
async fn run_outbound_pump(transport: Arc<dyn VoiceTransport>, queue: Arc<Mutex<OutboundQueue>>, notify: Arc<Notify>) {
    loop {
        let next = { queue.lock().await.pop() };
        match next {
            Some(event) => {
                if let Err(e) = transport.send_frame(&event).await {
                    warn!(error = %e, "voice transport send failed");
                }
            }
            None => notify.notified().await,
        }
    }
}

/// Implements the `VoiceClient` seam the Agent Runtime (C8) depends on,
/// backed by a `VoiceTransport` and the outbound priority queue from §5.
pub struct VoiceModelClient {
    queue: Arc<Mutex<OutboundQueue>>,
    notify: Arc<Notify>,
    debounce: Mutex<UserTextDebouncer>,
}

impl VoiceModelClient {
    pub fn new(transport: Arc<dyn VoiceTransport>) -> Self {
        let queue = Arc::new(Mutex::new(OutboundQueue::default()));
        let notify = Arc::new(Notify::new());
        tokio::spawn(run_outbound_pump(transport, queue.clone(), notify.clone()));
        Self {
            queue,
            notify,
            debounce: Mutex::new(UserTextDebouncer::default()),
        }
    }

    async fn enqueue(&self, event: OutboundVoiceEvent) {
        self.queue.lock().await.push(event);
        self.notify.notify_one();
    }

    async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl VoiceClient for VoiceModelClient {
    async fn configure_session(&self, system_prompt: &str, voice_id: &str, tools: &[ToolCatalogEntry]) {
        self.enqueue(OutboundVoiceEvent::ConfigureSession {
            system_prompt: system_prompt.to_string(),
            voice_id: voice_id.to_string(),
            tools: tools.to_vec(),
        })
        .await;
    }

    /// The real transport turns `StartSession` into the session-start /
    /// prompt-start / system-prompt-block triplet; the fourth framing item
    /// — the initial silent audio block — is modeled explicitly here as a
    /// plain `SendAudioChunk` so it is visible and testable at this layer.
    async fn start_session(&self, session_id: &str) {
        self.enqueue(OutboundVoiceEvent::StartSession {
            session_id: session_id.to_string(),
        })
        .await;
        self.enqueue(OutboundVoiceEvent::SendAudioChunk {
            pcm16le: silent_prime_samples(),
        })
        .await;
    }

    async fn send_user_text(&self, text: &str) {
        let should_send = self.debounce.lock().await.should_send(text);
        if should_send {
            self.enqueue(OutboundVoiceEvent::SendUserText { text: text.to_string() }).await;
        }
    }

    async fn send_system_text(&self, text: &str) {
        self.enqueue(OutboundVoiceEvent::SendUserText { text: text.to_string() }).await;
    }

    async fn send_tool_result(&self, tool_use_id: &str, result: &Value, success: bool) {
        self.enqueue(OutboundVoiceEvent::SendToolResult {
            tool_use_id: tool_use_id.to_string(),
            result: result.clone(),
            success,
        })
        .await;
    }

    async fn update_system_prompt(&self, text: &str) {
        self.enqueue(OutboundVoiceEvent::UpdateSystemPrompt { text: text.to_string() }).await;
    }

    /// Flushes pending work, enqueues `StopSession`, and waits up to 2s for
    /// the queue to drain before returning (§4.7).
    async fn stop_session(&self) {
        self.enqueue(OutboundVoiceEvent::StopSession).await;
        let deadline = Instant::now() + STOP_SESSION_DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            if self.queue_len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Can also be sent audio directly when in a mode that produces it; exposed
/// separately from the trait since `VoiceClient` (§4.8.5) is mode-agnostic
/// but raw audio only ever comes from voice-capable modes.
impl VoiceModelClient {
    pub async fn send_audio_chunk(&self, pcm16le: Vec<u8>) {
        self.enqueue(OutboundVoiceEvent::SendAudioChunk { pcm16le }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex as TokioMutex;

    #[test]
    fn parse_nudge_patterns_applies_flags_and_matches() {
        let yaml = "- pattern: hang tight\n  flags: i\n- pattern: one sec\n";
        let set = parse_nudge_patterns(yaml).unwrap();
        assert!(set.is_match("Hang Tight while I look that up"));
        assert!(set.is_match("one sec"));
        assert!(!set.is_match("nothing matches here"));
    }

    #[test]
    fn parse_nudge_patterns_rejects_invalid_yaml() {
        assert!(parse_nudge_patterns("not: [valid, entries").is_err());
    }

    struct RecordingTransport {
        sent: TokioMutex<Vec<OutboundVoiceEvent>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: TokioMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl VoiceTransport for RecordingTransport {
        async fn send_frame(&self, event: &OutboundVoiceEvent) -> Result<()> {
            self.sent.lock().await.push(event.clone());
            Ok(())
        }
        async fn recv_frame(&self) -> Result<Option<InboundVoiceEvent>> {
            Ok(None)
        }
    }

    #[test]
    fn queue_orders_tool_results_before_text_before_audio() {
        let mut q = OutboundQueue::default();
        q.push(OutboundVoiceEvent::SendAudioChunk { pcm16le: vec![] });
        q.push(OutboundVoiceEvent::SendUserText { text: "hi".into() });
        q.push(OutboundVoiceEvent::SendToolResult {
            tool_use_id: "t1".into(),
            result: json!({}),
            success: true,
        });

        assert!(matches!(q.pop(), Some(OutboundVoiceEvent::SendToolResult { .. })));
        assert!(matches!(q.pop(), Some(OutboundVoiceEvent::SendUserText { .. })));
        assert!(matches!(q.pop(), Some(OutboundVoiceEvent::SendAudioChunk { .. })));
    }

    #[test]
    fn queue_overflow_drops_oldest_audio_not_text() {
        let mut q = OutboundQueue::default();
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            q.push(OutboundVoiceEvent::SendAudioChunk { pcm16le: vec![0] });
        }
        q.push(OutboundVoiceEvent::SendUserText { text: "important".into() });
        assert_eq!(q.len(), OUTBOUND_QUEUE_CAPACITY);
        assert!(matches!(q.pop(), Some(OutboundVoiceEvent::SendUserText { .. })));
    }

    #[test]
    fn debounce_drops_identical_text_within_window() {
        let mut d = UserTextDebouncer::default();
        assert!(d.should_send("balance please"));
        assert!(!d.should_send("balance please"));
    }

    #[test]
    fn debounce_allows_distinct_text() {
        let mut d = UserTextDebouncer::default();
        assert!(d.should_send("balance please"));
        assert!(d.should_send("transactions please"));
    }

    #[test]
    fn filler_phrase_bypasses_debounce() {
        let mut d = UserTextDebouncer::default();
        assert!(d.should_send("Let me check that for you"));
        assert!(d.should_send("Let me check that for you"));
    }

    #[test]
    fn interruption_fires_once_per_assistant_turn() {
        let mut gate = InterruptionGate::new(0.5);
        gate.on_content_start("assistant");
        assert!(gate.observe_user_audio_energy(0.9));
        assert!(!gate.observe_user_audio_energy(0.9));
        gate.on_content_end("assistant");
        gate.on_content_start("assistant");
        assert!(gate.observe_user_audio_energy(0.9));
    }

    #[test]
    fn interruption_ignored_while_assistant_silent() {
        let mut gate = InterruptionGate::new(0.5);
        assert!(!gate.observe_user_audio_energy(0.9));
    }

    #[test]
    fn speculative_audio_is_suppressed() {
        assert!(!should_forward_audio(GenerationStage::Speculative));
        assert!(should_forward_audio(GenerationStage::Final));
    }

    #[test]
    fn auto_nudge_fires_on_commitment_without_tool_call() {
        let mut tracker = AutoNudgeTracker::new();
        tracker.on_assistant_text("Let me verify your balance.");
        assert_eq!(tracker.on_turn_end(), Some(AUTO_NUDGE_TEXT));
    }

    #[test]
    fn auto_nudge_does_not_fire_when_tool_was_called() {
        let mut tracker = AutoNudgeTracker::new();
        tracker.on_assistant_text("Let me verify your balance.");
        tracker.on_tool_called();
        assert_eq!(tracker.on_turn_end(), None);
    }

    #[test]
    fn auto_nudge_does_not_fire_without_commitment_language() {
        let mut tracker = AutoNudgeTracker::new();
        tracker.on_assistant_text("Your balance is 500 pounds.");
        assert_eq!(tracker.on_turn_end(), None);
    }

    #[tokio::test]
    async fn start_session_sends_framing_then_silent_audio() {
        let transport = RecordingTransport::new();
        let client = VoiceModelClient::new(transport.clone());
        client.start_session("sess-1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = transport.sent.lock().await;
        assert!(matches!(sent[0], OutboundVoiceEvent::StartSession { .. }));
        assert!(matches!(sent[1], OutboundVoiceEvent::SendAudioChunk { .. }));
    }

    #[tokio::test]
    async fn stop_session_drains_queue_before_returning() {
        let transport = RecordingTransport::new();
        let client = VoiceModelClient::new(transport.clone());
        client.send_user_text("hello").await;
        client.stop_session().await;

        let sent = transport.sent.lock().await;
        assert!(sent.iter().any(|e| matches!(e, OutboundVoiceEvent::StopSession)));
    }
}
