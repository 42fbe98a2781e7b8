//! Per-session conversation state machine.
//!
//! One [`ConversationManager`] drives one session: it pulls inbound frames and
//! transcript fragments, assembles user utterances, runs each turn
//! (generation, optional filler, speech) as a spawned stage task, and handles
//! barge-in by cancelling speech and answering with a short acknowledgment.

use crate::config::{EngineConfig, SttFailurePolicy};
use crate::error::Result;
use crate::generation::{ContentGenerationError, ContentGenerator, ConversationMode, SessionContext};
use crate::history::{ConversationHistory, Utterance};
use crate::orchestrator::{SpeakOutcome, VoiceOrchestrator};
use crate::personality::{
    ContextualFiller, FillerPolicy, PhraseSelector, ProfileAdapter, RateMatchingAdapter,
    RollingMetrics, SeededPhraseSelector, VoiceProfile,
};
use crate::prompts::ConversationTemplates;
use crate::protocol::{ControlMessage, OutboundMessage};
use crate::sink::TranscriptSink;
use crate::stt::{TranscriptFragment, TranscriptionServiceError};
use crate::transport::{InboundFrame, TransportReceiver, TransportSender};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

const FALLBACK_ACK: &str = "Go ahead.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Listening,
    Thinking,
    Speaking,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpeechKind {
    Response,
    Apology,
    Acknowledgment,
}

enum StageOutput {
    Generated {
        result: std::result::Result<String, ContentGenerationError>,
        filler: Option<(String, Result<SpeakOutcome>)>,
    },
    Spoken {
        kind: SpeechKind,
        text: String,
        result: Result<SpeakOutcome>,
    },
}

/// Why a background STT reconnect was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectKind {
    /// A running stream dropped; failure applies the failure policy.
    Recover,
    /// Periodic attempt while degraded; failure just waits for the next one.
    Restore,
}

struct Reconnect {
    kind: ReconnectKind,
    handle: JoinHandle<std::result::Result<(), TranscriptionServiceError>>,
}

type ReconnectResult =
    std::result::Result<std::result::Result<(), TranscriptionServiceError>, JoinError>;

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Collaborators and policies a session is built with.
pub struct SessionServices {
    pub generator: Arc<dyn ContentGenerator>,
    pub sink: Arc<dyn TranscriptSink>,
    pub filler_policy: Box<dyn FillerPolicy>,
    pub adapter: Box<dyn ProfileAdapter>,
    pub selector: Box<dyn PhraseSelector>,
}

impl SessionServices {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        sink: Arc<dyn TranscriptSink>,
        phrase_seed: Option<u64>,
    ) -> Self {
        Self {
            generator,
            sink,
            filler_policy: Box::new(ContextualFiller),
            adapter: Box::new(RateMatchingAdapter::default()),
            selector: Box::new(SeededPhraseSelector::new(phrase_seed)),
        }
    }
}

/// What a finished session leaves behind.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub history: Vec<Utterance>,
    /// Every state entered, starting with the initial `LISTENING`.
    pub transitions: Vec<SessionState>,
    pub final_state: SessionState,
    pub interruption_count: u32,
    pub turn_count: u32,
    pub profile: VoiceProfile,
}

/// Final fragments of the utterance in progress.
#[derive(Debug, Default)]
struct TranscriptBuffer {
    finals: Vec<String>,
    started_at: Option<Instant>,
}

impl TranscriptBuffer {
    /// Feed one fragment; returns the utterance and how long it took to say
    /// once a speech-final fragment closes it. Interims are never kept.
    fn push(&mut self, fragment: &TranscriptFragment) -> Option<(String, Duration)> {
        if !fragment.is_blank() && self.started_at.is_none() {
            self.started_at = Some(fragment.received_at);
        }
        if fragment.is_final && !fragment.is_blank() {
            self.finals.push(fragment.text.trim().to_string());
        }
        if !fragment.is_speech_final {
            return None;
        }

        let text = self.finals.join(" ");
        let spoken_for = self
            .started_at
            .map(|start| fragment.received_at.saturating_duration_since(start))
            .unwrap_or_default();
        self.clear();
        if text.is_empty() {
            None
        } else {
            Some((text, spoken_for))
        }
    }

    fn clear(&mut self) {
        self.finals.clear();
        self.started_at = None;
    }
}

pub struct ConversationManager {
    session_id: String,
    config: EngineConfig,
    orchestrator: Arc<VoiceOrchestrator>,
    sender: Arc<dyn TransportSender>,
    services: SessionServices,
    state: SessionState,
    transitions: Vec<SessionState>,
    history: ConversationHistory,
    profile: VoiceProfile,
    metrics: RollingMetrics,
    context: SessionContext,
    transcript: TranscriptBuffer,
    pending: Option<(String, Duration)>,
    turn: Option<JoinHandle<StageOutput>>,
    reconnect: Option<Reconnect>,
    /// Set while transcription is down; time of the last reconnect attempt.
    stt_down_since: Option<Instant>,
}

impl ConversationManager {
    pub fn new(
        session_id: impl Into<String>,
        config: EngineConfig,
        orchestrator: Arc<VoiceOrchestrator>,
        sender: Arc<dyn TransportSender>,
        services: SessionServices,
        profile: VoiceProfile,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            context: SessionContext::new(session_id.clone()),
            session_id,
            config,
            orchestrator,
            sender,
            services,
            state: SessionState::Listening,
            transitions: vec![SessionState::Listening],
            history: ConversationHistory::new(),
            profile,
            metrics: RollingMetrics::new(),
            transcript: TranscriptBuffer::default(),
            pending: None,
            turn: None,
            reconnect: None,
            stt_down_since: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until the peer disconnects, an `end_session` arrives,
    /// or a session-fatal error occurs. Resources are released in every case.
    pub async fn run(
        mut self,
        receiver: &mut dyn TransportReceiver,
        mut control_rx: Option<mpsc::Receiver<ControlMessage>>,
    ) -> Result<SessionReport> {
        log::info!("[{}] 🎙️ Session started", self.session_id);

        let outcome = match self.start().await {
            Ok(()) => self.event_loop(receiver, &mut control_rx).await,
            Err(e) => Err(e),
        };
        self.shutdown().await;

        match outcome {
            Ok(()) => {
                log::info!("[{}] Session ended: {}", self.session_id, self.history.summary());
                Ok(self.report())
            }
            Err(e) => {
                if e.is_session_fatal() {
                    log::error!("[{}] Session failed: {}", self.session_id, e);
                } else {
                    log::warn!("[{}] Session terminated: {}", self.session_id, e);
                }
                Err(e)
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        self.orchestrator.apply_profile(&self.profile);
        match self.orchestrator.initialize(&self.profile.voice_id).await {
            Ok(()) => Ok(()),
            Err(e) => self.on_stt_unavailable(e).await,
        }
    }

    async fn event_loop(
        &mut self,
        receiver: &mut dyn TransportReceiver,
        control_rx: &mut Option<mpsc::Receiver<ControlMessage>>,
    ) -> Result<()> {
        loop {
            let poll = self.config.fragment_poll_interval;
            tokio::select! {
                biased;
                control = recv_control(control_rx) => match control {
                    Some(message) => {
                        if self.handle_control(message).await? == Flow::Stop {
                            return Ok(());
                        }
                    }
                    None => *control_rx = None,
                },
                output = wait_turn(&mut self.turn) => {
                    self.turn = None;
                    self.on_stage(output).await?;
                }
                (kind, result) = wait_reconnect(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.on_reconnected(kind, result).await?;
                }
                frame = receiver.receive() => match frame? {
                    None => {
                        log::info!("[{}] Peer disconnected", self.session_id);
                        return Ok(());
                    }
                    Some(InboundFrame::Audio(audio)) => self.on_audio(&audio).await?,
                    Some(InboundFrame::Control(message)) => {
                        if self.handle_control(message).await? == Flow::Stop {
                            return Ok(());
                        }
                    }
                },
                fragment = self.orchestrator.next_fragment(poll) => self.on_poll(fragment).await?,
            }
        }
    }

    async fn on_audio(&mut self, audio: &[u8]) -> Result<()> {
        match self.orchestrator.process_audio_input(audio).await {
            Ok(Some(fragment)) => self.on_fragment(fragment).await,
            Ok(None) => Ok(()),
            Err(e) => self.on_stt_error(e).await,
        }
    }

    async fn on_poll(
        &mut self,
        polled: std::result::Result<Option<TranscriptFragment>, TranscriptionServiceError>,
    ) -> Result<()> {
        match polled {
            Ok(Some(fragment)) => self.on_fragment(fragment).await,
            Ok(None) => self.maybe_restore_stt().await,
            Err(e) => self.on_stt_error(e).await,
        }
    }

    async fn on_fragment(&mut self, fragment: TranscriptFragment) -> Result<()> {
        // A stage that finished while this fragment was in flight is settled
        // first, so speech the user heard in full is never treated as barge-in.
        if self.turn.as_ref().is_some_and(|turn| turn.is_finished()) {
            if let Some(turn) = self.turn.take() {
                let output = turn.await;
                self.on_stage(output).await?;
            }
        }

        if self.state == SessionState::Speaking {
            if fragment.is_blank() {
                return Ok(());
            }
            return self.barge_in(fragment).await;
        }

        if !fragment.is_final && !fragment.is_blank() {
            self.sender
                .send_control(&OutboundMessage::PartialTranscript {
                    text: fragment.text.clone(),
                    confidence: fragment.confidence,
                })
                .await?;
        }

        if let Some((text, spoken_for)) = self.transcript.push(&fragment) {
            if self.state == SessionState::Listening && self.turn.is_none() {
                self.begin_turn(text, spoken_for);
            } else {
                log::debug!(
                    "[{}] Queued utterance while {}: {:?}",
                    self.session_id,
                    self.state,
                    text
                );
                self.pending = Some(match self.pending.take() {
                    Some((queued, queued_for)) => {
                        (format!("{} {}", queued, text), queued_for + spoken_for)
                    }
                    None => (text, spoken_for),
                });
            }
        }
        Ok(())
    }

    fn begin_turn(&mut self, text: String, spoken_for: Duration) {
        log::info!("[{}] 👤 User: {}", self.session_id, text);
        self.metrics.record_utterance(&text, spoken_for);

        let window = self.history.window(self.config.history_window);
        self.history.push(Utterance::user(text.clone()));
        let filler = self.services.filler_policy.filler(
            self.history.as_slice(),
            &self.profile,
            self.services.selector.as_mut(),
        );

        self.set_state(SessionState::Thinking);
        self.turn = Some(tokio::spawn(generate_stage(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.sender),
            Arc::clone(&self.services.generator),
            text,
            window,
            self.context.clone(),
            filler,
            self.config.filler_delay,
            self.config.generation_timeout,
        )));
    }

    async fn barge_in(&mut self, fragment: TranscriptFragment) -> Result<()> {
        log::info!("[{}] Barge-in: {:?}", self.session_id, fragment.text);

        self.orchestrator.interrupt_speech();
        let previous = self.turn.take();
        if let Some(previous) = &previous {
            previous.abort();
        }
        self.sender.clear_audio().await?;

        self.set_state(SessionState::Interrupted);
        self.metrics.record_interruption();
        self.transcript.clear();

        let ack = self
            .services
            .selector
            .choose(&self.profile.interruption_responses)
            .unwrap_or_else(|| FALLBACK_ACK.to_string());
        self.sender
            .send_control(&OutboundMessage::Interruption {
                action: "stop_speaking".to_string(),
                response: ack.clone(),
            })
            .await?;

        let orchestrator = Arc::clone(&self.orchestrator);
        let sender = Arc::clone(&self.sender);
        self.turn = Some(tokio::spawn(async move {
            // The aborted stage must be gone before anything else is spoken.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = orchestrator
                .speak_response(&ack, true, true, sender.as_ref())
                .await;
            StageOutput::Spoken {
                kind: SpeechKind::Acknowledgment,
                text: ack,
                result,
            }
        }));
        Ok(())
    }

    fn spawn_speech(&mut self, kind: SpeechKind, text: String) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let sender = Arc::clone(&self.sender);
        let is_filler = kind != SpeechKind::Response;
        self.turn = Some(tokio::spawn(async move {
            let result = orchestrator
                .speak_response(&text, true, is_filler, sender.as_ref())
                .await;
            StageOutput::Spoken { kind, text, result }
        }));
    }

    async fn on_stage(&mut self, output: std::result::Result<StageOutput, JoinError>) -> Result<()> {
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                log::error!("[{}] Turn task failed: {}", self.session_id, e);
                self.set_state(SessionState::Listening);
                self.resume_pending();
                return Ok(());
            }
        };

        match output {
            StageOutput::Generated { result, filler } => {
                if let Some((text, spoken)) = filler {
                    if self.delivered(&text, spoken).await? {
                        self.history.push(Utterance::filler(text));
                    }
                }
                self.set_state(SessionState::Speaking);
                match result {
                    Ok(text) => self.spawn_speech(SpeechKind::Response, text),
                    Err(e) => {
                        log::warn!("[{}] Content generation failed: {}", self.session_id, e);
                        self.spawn_speech(
                            SpeechKind::Apology,
                            ConversationTemplates::fallback_apology().to_string(),
                        );
                    }
                }
            }
            StageOutput::Spoken { kind, text, result } => {
                if self.delivered(&text, result).await? {
                    match kind {
                        SpeechKind::Response => {
                            log::info!("[{}] 🤖 Assistant: {}", self.session_id, text);
                            self.history.push(Utterance::assistant(text));
                            self.complete_turn();
                        }
                        SpeechKind::Apology | SpeechKind::Acknowledgment => {
                            self.history.push(Utterance::filler(text));
                        }
                    }
                }
                self.set_state(SessionState::Listening);
                self.resume_pending();
            }
        }
        Ok(())
    }

    /// Whether `text` reached the peer, as audio or as a text fallback when
    /// synthesis failed. Interrupted speech never counts.
    async fn delivered(&mut self, text: &str, result: Result<SpeakOutcome>) -> Result<bool> {
        match result {
            Ok(SpeakOutcome::Completed) => Ok(true),
            Ok(SpeakOutcome::Interrupted) => Ok(false),
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e) => {
                log::warn!("[{}] Speech failed, sending text: {}", self.session_id, e);
                self.sender.send_control(&OutboundMessage::system(text)).await?;
                self.sender
                    .send_control(&OutboundMessage::error(format!(
                        "{} ({})",
                        ConversationTemplates::synthesis_unavailable(),
                        e
                    )))
                    .await?;
                Ok(true)
            }
        }
    }

    fn complete_turn(&mut self) {
        self.metrics.record_turn();
        let every = self.config.adapt_every_turns.max(1);
        if self.metrics.turn_count % every != 0 {
            return;
        }
        if self.services.adapter.adapt(&mut self.profile, &self.metrics) {
            log::info!(
                "[{}] Voice profile now rate {:.2}, energy {}",
                self.session_id,
                self.profile.speaking_rate,
                self.profile.energy
            );
            self.orchestrator.apply_profile(&self.profile);
            self.context.energy = self.profile.energy.to_string();
            self.context.speaking_rate = self.profile.speaking_rate;
        }
        self.metrics.mark_adapted();
    }

    fn resume_pending(&mut self) {
        if self.state != SessionState::Listening || self.turn.is_some() {
            return;
        }
        if let Some((text, spoken_for)) = self.pending.take() {
            self.begin_turn(text, spoken_for);
        }
    }

    async fn handle_control(&mut self, message: ControlMessage) -> Result<Flow> {
        log::debug!("[{}] Control: {:?}", self.session_id, message);
        match message {
            ControlMessage::Auth { user_id, .. } => {
                self.context.user_id = user_id;
                self.sender
                    .send_control(&OutboundMessage::system("authenticated"))
                    .await?;
            }
            ControlMessage::StartIdeation { topic } => {
                let reply = ConversationTemplates::ideation_started(topic.as_deref());
                self.context.mode = ConversationMode::Ideation;
                self.context.topic = topic;
                self.sender.send_control(&OutboundMessage::system(reply)).await?;
            }
            ControlMessage::SaveIdea { title } => {
                let reply = match self
                    .services
                    .sink
                    .save_idea(&self.session_id, title.as_deref(), self.history.as_slice())
                    .await
                {
                    Ok(()) => OutboundMessage::system("idea saved"),
                    Err(e) => {
                        log::warn!("[{}] Failed to save idea: {}", self.session_id, e);
                        OutboundMessage::error(format!("could not save idea: {}", e))
                    }
                };
                self.sender.send_control(&reply).await?;
            }
            ControlMessage::ChangeVoice { voice_id } => {
                self.orchestrator.set_voice(&voice_id);
                let reply = format!("voice changed to {}", voice_id);
                self.profile.voice_id = voice_id;
                self.sender.send_control(&OutboundMessage::system(reply)).await?;
            }
            ControlMessage::CallStarted { stream_sid, call_sid } => {
                log::info!(
                    "[{}] Call attached: stream {} call {}",
                    self.session_id,
                    stream_sid,
                    call_sid.as_deref().unwrap_or("-")
                );
            }
            ControlMessage::EndSession => {
                log::info!("[{}] End of session requested", self.session_id);
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// A running stream failed: reconnect quietly in the background; the
    /// failure policy applies only if that fails too.
    async fn on_stt_error(&mut self, error: TranscriptionServiceError) -> Result<()> {
        log::warn!("[{}] Transcription failed: {}", self.session_id, error);
        self.start_reconnect(ReconnectKind::Recover);
        Ok(())
    }

    fn start_reconnect(&mut self, kind: ReconnectKind) {
        if self.reconnect.is_some() {
            return;
        }
        self.reconnect = Some(Reconnect {
            kind,
            handle: self.orchestrator.spawn_reconnect(),
        });
    }

    async fn on_reconnected(&mut self, kind: ReconnectKind, result: ReconnectResult) -> Result<()> {
        let result = result.unwrap_or_else(|e| {
            Err(TranscriptionServiceError::Disconnected(format!(
                "reconnect task failed: {}",
                e
            )))
        });
        match (kind, result) {
            (ReconnectKind::Recover, Ok(())) => {
                log::info!("[{}] Transcription reconnected", self.session_id);
            }
            (ReconnectKind::Recover, Err(e)) => self.on_stt_unavailable(e).await?,
            (ReconnectKind::Restore, Ok(())) => {
                log::info!("[{}] Transcription restored", self.session_id);
                self.stt_down_since = None;
                self.sender
                    .send_control(&OutboundMessage::system("transcription restored"))
                    .await?;
            }
            (ReconnectKind::Restore, Err(e)) => {
                log::debug!("[{}] Transcription still down: {}", self.session_id, e);
                self.stt_down_since = Some(Instant::now());
            }
        }
        Ok(())
    }

    async fn on_stt_unavailable(&mut self, error: TranscriptionServiceError) -> Result<()> {
        match self.config.stt_failure_policy {
            SttFailurePolicy::Terminate => {
                let _ = self
                    .sender
                    .send_control(&OutboundMessage::error(format!(
                        "transcription unavailable: {}",
                        error
                    )))
                    .await;
                Err(error.into())
            }
            SttFailurePolicy::Degrade => {
                log::warn!(
                    "[{}] Continuing without transcription: {}",
                    self.session_id,
                    error
                );
                self.stt_down_since = Some(Instant::now());
                self.sender
                    .send_control(&OutboundMessage::error(
                        ConversationTemplates::transcription_unavailable(),
                    ))
                    .await?;
                Ok(())
            }
        }
    }

    async fn maybe_restore_stt(&mut self) -> Result<()> {
        let Some(last_attempt) = self.stt_down_since else {
            return Ok(());
        };
        if self.reconnect.is_some() || last_attempt.elapsed() < self.config.stt_retry_interval {
            return Ok(());
        }

        self.stt_down_since = Some(Instant::now());
        self.start_reconnect(ReconnectKind::Restore);
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("[{}] {} -> {}", self.session_id, self.state, state);
            self.state = state;
            self.transitions.push(state);
        }
    }

    async fn shutdown(&mut self) {
        self.orchestrator.interrupt_speech();
        if let Some(turn) = self.turn.take() {
            turn.abort();
        }
        if let Some(reconnect) = self.reconnect.take() {
            // The task holds the STT client; it must be gone before close.
            reconnect.handle.abort();
            let _ = reconnect.handle.await;
        }
        self.orchestrator.close().await;
        if let Err(e) = self.sender.close().await {
            log::debug!("[{}] Transport close: {}", self.session_id, e);
        }
        if let Err(e) = self
            .services
            .sink
            .save_transcript(&self.session_id, self.history.as_slice())
            .await
        {
            log::warn!("[{}] Failed to save transcript: {}", self.session_id, e);
        }
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.session_id.clone(),
            history: self.history.as_slice().to_vec(),
            transitions: self.transitions.clone(),
            final_state: self.state,
            interruption_count: self.metrics.interruption_count,
            turn_count: self.metrics.turn_count,
            profile: self.profile.clone(),
        }
    }
}

async fn recv_control(control: &mut Option<mpsc::Receiver<ControlMessage>>) -> Option<ControlMessage> {
    match control {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_turn(
    turn: &mut Option<JoinHandle<StageOutput>>,
) -> std::result::Result<StageOutput, JoinError> {
    match turn {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_reconnect(reconnect: &mut Option<Reconnect>) -> (ReconnectKind, ReconnectResult) {
    match reconnect {
        Some(reconnect) => (reconnect.kind, (&mut reconnect.handle).await),
        None => std::future::pending().await,
    }
}

/// Generation for one user turn. A filler is spoken only when generation
/// outlasts `filler_delay`; the whole stage is bounded by `timeout`.
#[allow(clippy::too_many_arguments)]
async fn generate_stage(
    orchestrator: Arc<VoiceOrchestrator>,
    sender: Arc<dyn TransportSender>,
    generator: Arc<dyn ContentGenerator>,
    user_text: String,
    window: Vec<Utterance>,
    context: SessionContext,
    filler: Option<String>,
    filler_delay: Duration,
    timeout: Duration,
) -> StageOutput {
    let timed_out = || ContentGenerationError::Timeout(timeout.as_millis() as u64);
    let deadline = Instant::now() + timeout;

    let generation = generator.generate(&user_text, &window, &context);
    tokio::pin!(generation);

    let (result, filler) = match tokio::time::timeout(filler_delay.min(timeout), &mut generation).await {
        Ok(result) => (result, None),
        Err(_) => match filler {
            Some(text) => {
                let speak = orchestrator.speak_response(&text, true, true, sender.as_ref());
                let (spoken, result) =
                    tokio::join!(speak, tokio::time::timeout_at(deadline, &mut generation));
                (result.unwrap_or_else(|_| Err(timed_out())), Some((text, spoken)))
            }
            None => (
                tokio::time::timeout_at(deadline, &mut generation)
                    .await
                    .unwrap_or_else(|_| Err(timed_out())),
                None,
            ),
        },
    };

    StageOutput::Generated { result, filler }
}
