#![allow(dead_code)]

use async_stream::stream;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voice_dialogue_rs::config::EngineConfig;
use voice_dialogue_rs::generation::{ContentGenerationError, ContentGenerator, SessionContext};
use voice_dialogue_rs::history::Utterance;
use voice_dialogue_rs::manager::{ConversationManager, SessionReport, SessionServices};
use voice_dialogue_rs::orchestrator::VoiceOrchestrator;
use voice_dialogue_rs::personality::VoiceProfile;
use voice_dialogue_rs::protocol::{ControlMessage, OutboundMessage};
use voice_dialogue_rs::sink::TranscriptSink;
use voice_dialogue_rs::stt::{SttClient, TranscriptFragment, TranscriptionServiceError};
use voice_dialogue_rs::transport::{InboundFrame, TransportError, TransportReceiver, TransportSender};
use voice_dialogue_rs::tts::{AudioChunk, AudioStream, SpeechSynthesizer, SynthesisServiceError};

// ---------------------------------------------------------------------------
// STT

pub enum SttEvent {
    Fragment(TranscriptFragment),
    /// The provider connection drops.
    Disconnect,
}

#[derive(Default)]
pub struct SttState {
    /// Connect attempts still to fail.
    pub connect_failures: u32,
    pub connect_attempts: u32,
    pub connected: bool,
    pub audio: Vec<Vec<u8>>,
    /// How long each `send_audio` takes.
    pub send_delay: Duration,
}

pub struct FakeStt {
    state: Arc<Mutex<SttState>>,
    events: mpsc::UnboundedReceiver<SttEvent>,
}

impl FakeStt {
    pub fn new(connect_failures: u32) -> (Self, Arc<Mutex<SttState>>, mpsc::UnboundedSender<SttEvent>) {
        let state = Arc::new(Mutex::new(SttState {
            connect_failures,
            ..Default::default()
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::clone(&state),
                events: rx,
            },
            state,
            tx,
        )
    }
}

#[async_trait]
impl SttClient for FakeStt {
    async fn connect(&mut self) -> Result<(), TranscriptionServiceError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TranscriptionServiceError::ConnectTimeout(5000));
        }
        state.connected = true;
        Ok(())
    }

    async fn send_audio(&mut self, audio: &[u8]) -> Result<(), TranscriptionServiceError> {
        let delay = {
            let state = self.state.lock().unwrap();
            if !state.connected {
                return Err(TranscriptionServiceError::NotConnected);
            }
            state.send_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().audio.push(audio.to_vec());
        Ok(())
    }

    async fn next_fragment(
        &mut self,
        wait: Duration,
    ) -> Result<Option<TranscriptFragment>, TranscriptionServiceError> {
        match tokio::time::timeout(wait, self.events.recv()).await {
            Ok(Some(SttEvent::Fragment(fragment))) => Ok(Some(fragment)),
            Ok(Some(SttEvent::Disconnect)) => {
                self.state.lock().unwrap().connected = false;
                Err(TranscriptionServiceError::Disconnected("fake drop".into()))
            }
            Ok(None) => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }
}

// ---------------------------------------------------------------------------
// TTS

/// Every `speak` call yields `chunks` audio chunks `[call, index]`, one per
/// `chunk_delay`, then the end marker.
pub struct FakeTts {
    pub chunks: usize,
    pub chunk_delay: Duration,
    pub fail: Mutex<bool>,
    pub calls: AtomicUsize,
    pub aborts: AtomicUsize,
    pub spoken: Mutex<Vec<String>>,
    pub voice: Mutex<String>,
    pub delivery: Mutex<Option<(f32, f32)>>,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl FakeTts {
    pub fn new(chunks: usize, chunk_delay: Duration) -> Self {
        Self {
            chunks,
            chunk_delay,
            fail: Mutex::new(false),
            calls: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            spoken: Mutex::new(Vec::new()),
            voice: Mutex::new(String::new()),
            delivery: Mutex::new(None),
            in_flight: Mutex::new(None),
        }
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

impl SpeechSynthesizer for FakeTts {
    fn speak(&self, text: &str, _flush: bool) -> AudioStream {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u8;
        self.spoken.lock().unwrap().push(text.to_string());

        let token = CancellationToken::new();
        if let Some(previous) = self.in_flight.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }
        let fail = *self.fail.lock().unwrap();
        let chunks = self.chunks;
        let delay = self.chunk_delay;

        Box::pin(stream! {
            if fail {
                yield Err(SynthesisServiceError::ApiError { message: "quota exceeded".into() });
                return;
            }
            for index in 0..chunks {
                let cancelled = tokio::select! {
                    biased;
                    _ = token.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    return;
                }
                yield Ok(AudioChunk::Audio(vec![call, index as u8]));
            }
            yield Ok(AudioChunk::End);
        })
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.in_flight.lock().unwrap().take() {
            token.cancel();
        }
    }

    fn set_voice(&self, voice_id: &str) {
        *self.voice.lock().unwrap() = voice_id.to_string();
    }

    fn set_delivery(&self, speed: f32, style: f32) {
        *self.delivery.lock().unwrap() = Some((speed, style));
    }
}

// ---------------------------------------------------------------------------
// Content generation

#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub user_text: String,
    pub history_len: usize,
    pub context: SessionContext,
}

pub struct FakeGenerator {
    pub delay: Duration,
    pub fail: bool,
    pub calls: Mutex<Vec<GenerationCall>>,
    replies: Mutex<VecDeque<String>>,
}

impl FakeGenerator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: false,
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::from_millis(10))
        }
    }

    pub fn with_replies(self, replies: &[&str]) -> Self {
        *self.replies.lock().unwrap() = replies.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn generate(
        &self,
        user_text: &str,
        history: &[Utterance],
        context: &SessionContext,
    ) -> Result<String, ContentGenerationError> {
        self.calls.lock().unwrap().push(GenerationCall {
            user_text: user_text.to_string(),
            history_len: history.len(),
            context: context.clone(),
        });
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ContentGenerationError::ApiError {
                status: 503,
                message: "overloaded".into(),
            });
        }
        let reply = self.replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| format!("echo: {}", user_text)))
    }
}

// ---------------------------------------------------------------------------
// Transport

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Audio(Vec<u8>),
    Control(OutboundMessage),
    Clear,
    Close,
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<Sent>>,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn controls(&self) -> Vec<OutboundMessage> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Control(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Sent) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|s| predicate(s)).count()
    }

    pub fn completions(&self) -> usize {
        self.count(|s| matches!(s, Sent::Control(OutboundMessage::SpeakingComplete)))
    }
}

#[async_trait]
impl TransportSender for RecordingSender {
    async fn send_audio(&self, audio: &[u8]) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Audio(audio.to_vec()));
        Ok(())
    }

    async fn send_control(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Control(message.clone()));
        Ok(())
    }

    async fn clear_audio(&self) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Clear);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Close);
        Ok(())
    }
}

/// Frames pushed by the test; dropping the sender is a peer disconnect.
pub struct ChannelReceiver {
    frames: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
impl TransportReceiver for ChannelReceiver {
    async fn receive(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        Ok(self.frames.recv().await)
    }
}

// ---------------------------------------------------------------------------
// Persistence

#[derive(Default)]
pub struct RecordingSink {
    pub transcripts: Mutex<Vec<(String, Vec<Utterance>)>>,
    pub ideas: Mutex<Vec<(Option<String>, usize)>>,
}

#[async_trait]
impl TranscriptSink for RecordingSink {
    async fn save_transcript(
        &self,
        session_id: &str,
        history: &[Utterance],
    ) -> voice_dialogue_rs::Result<()> {
        self.transcripts
            .lock()
            .unwrap()
            .push((session_id.to_string(), history.to_vec()));
        Ok(())
    }

    async fn save_idea(
        &self,
        _session_id: &str,
        title: Option<&str>,
        history: &[Utterance],
    ) -> voice_dialogue_rs::Result<()> {
        self.ideas
            .lock()
            .unwrap()
            .push((title.map(str::to_string), history.len()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness

pub struct Setup {
    pub config: EngineConfig,
    pub connect_failures: u32,
    pub tts: FakeTts,
    pub generator: FakeGenerator,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: EngineConfig {
                phrase_seed: Some(7),
                ..EngineConfig::default()
            },
            connect_failures: 0,
            tts: FakeTts::new(3, Duration::from_millis(50)),
            generator: FakeGenerator::new(Duration::from_millis(100)),
        }
    }
}

pub struct Harness {
    pub inbound: Option<mpsc::UnboundedSender<InboundFrame>>,
    pub fragments: mpsc::UnboundedSender<SttEvent>,
    pub control: mpsc::Sender<ControlMessage>,
    pub stt: Arc<Mutex<SttState>>,
    pub tts: Arc<FakeTts>,
    pub generator: Arc<FakeGenerator>,
    pub sender: Arc<RecordingSender>,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Arc<VoiceOrchestrator>,
    pub session: JoinHandle<voice_dialogue_rs::Result<SessionReport>>,
}

impl Harness {
    pub fn start(setup: Setup) -> Self {
        let (stt, stt_state, fragments) = FakeStt::new(setup.connect_failures);
        let tts = Arc::new(setup.tts);
        let generator = Arc::new(setup.generator);
        let sender = Arc::new(RecordingSender::default());
        let sink = Arc::new(RecordingSink::default());

        let orchestrator = Arc::new(VoiceOrchestrator::new(
            "test-session",
            Box::new(stt),
            Arc::clone(&tts) as Arc<dyn SpeechSynthesizer>,
            setup.config.stt_retry_delay,
        ));
        let services = SessionServices::new(
            Arc::clone(&generator) as Arc<dyn ContentGenerator>,
            Arc::clone(&sink) as Arc<dyn TranscriptSink>,
            setup.config.phrase_seed,
        );
        let manager = ConversationManager::new(
            "test-session",
            setup.config,
            Arc::clone(&orchestrator),
            Arc::clone(&sender) as Arc<dyn TransportSender>,
            services,
            VoiceProfile::new("voice-a"),
        );

        let (inbound, frames) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::channel(8);
        let session = tokio::spawn(async move {
            let mut receiver = ChannelReceiver { frames };
            manager.run(&mut receiver, Some(control_rx)).await
        });

        Self {
            inbound: Some(inbound),
            fragments,
            control,
            stt: stt_state,
            tts,
            generator,
            sender,
            sink,
            orchestrator,
            session,
        }
    }

    pub fn fragment(&self, fragment: TranscriptFragment) {
        self.fragments.send(SttEvent::Fragment(fragment)).unwrap();
    }

    pub fn say(&self, text: &str) {
        self.fragment(TranscriptFragment::speech_final(text, 0.95));
    }

    pub fn frame(&self, frame: InboundFrame) {
        self.inbound.as_ref().unwrap().send(frame).unwrap();
    }

    /// Disconnect the peer and collect the session outcome.
    pub async fn finish(mut self) -> voice_dialogue_rs::Result<SessionReport> {
        self.inbound.take();
        self.session.await.unwrap()
    }
}

/// Let every task run until the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Poll `condition` on the (paused) clock until it holds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
