use crate::error::EngineError;
use crate::personality::VoiceProfile;
use crate::protocol::OutboundMessage;
use crate::stt::{connect_with_retry, SttClient, TranscriptFragment, TranscriptionServiceError};
use crate::transport::TransportSender;
use crate::tts::{AudioChunk, SpeechSynthesizer, SynthesisServiceError};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a `speak_response` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Every chunk reached the transport and `speaking_complete` was sent.
    Completed,
    /// `interrupt_speech` stopped delivery part way.
    Interrupted,
}

struct ActiveSpeech {
    id: u64,
    token: CancellationToken,
}

/// Clears the reconnecting flag when a reconnect task ends or is aborted.
struct ReconnectingFlag<'a>(&'a AtomicBool);

impl Drop for ReconnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One STT client and one synthesizer, owned by a single session.
pub struct VoiceOrchestrator {
    session_id: String,
    stt: Mutex<Box<dyn SttClient>>,
    tts: Arc<dyn SpeechSynthesizer>,
    speaking: StdMutex<Option<ActiveSpeech>>,
    next_speech_id: AtomicU64,
    /// Set while a background reconnect owns the STT client.
    reconnecting: AtomicBool,
    retry_delay: Duration,
}

impl VoiceOrchestrator {
    pub fn new(
        session_id: impl Into<String>,
        stt: Box<dyn SttClient>,
        tts: Arc<dyn SpeechSynthesizer>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            stt: Mutex::new(stt),
            tts,
            speaking: StdMutex::new(None),
            next_speech_id: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            retry_delay,
        }
    }

    /// Select the voice and open transcription, retrying the connect once.
    pub async fn initialize(&self, voice_id: &str) -> Result<(), TranscriptionServiceError> {
        self.tts.set_voice(voice_id);
        let mut stt = self.stt.lock().await;
        connect_with_retry(stt.as_mut(), self.retry_delay).await?;
        log::info!("[{}] Orchestrator ready (voice {})", self.session_id, voice_id);
        Ok(())
    }

    /// Forward one inbound frame and return a fragment if one is already waiting.
    /// Audio is dropped while transcription is down or reconnecting.
    pub async fn process_audio_input(
        &self,
        audio: &[u8],
    ) -> Result<Option<TranscriptFragment>, TranscriptionServiceError> {
        if self.is_reconnecting() {
            log::trace!("[{}] STT reconnecting, dropping {} bytes", self.session_id, audio.len());
            return Ok(None);
        }
        let mut stt = self.stt.lock().await;
        if !stt.is_connected() {
            log::trace!("[{}] STT down, dropping {} bytes", self.session_id, audio.len());
            return Ok(None);
        }
        stt.send_audio(audio).await?;
        stt.next_fragment(Duration::ZERO).await
    }

    /// Bounded wait for the next fragment. While transcription is down or
    /// reconnecting this just sleeps for `wait` so callers can keep polling on
    /// a fixed cadence.
    pub async fn next_fragment(
        &self,
        wait: Duration,
    ) -> Result<Option<TranscriptFragment>, TranscriptionServiceError> {
        if self.is_reconnecting() {
            tokio::time::sleep(wait).await;
            return Ok(None);
        }
        let mut stt = self.stt.lock().await;
        if !stt.is_connected() {
            drop(stt);
            tokio::time::sleep(wait).await;
            return Ok(None);
        }
        stt.next_fragment(wait).await
    }

    pub async fn reconnect_stt(&self) -> Result<(), TranscriptionServiceError> {
        let mut stt = self.stt.lock().await;
        stt.close().await;
        connect_with_retry(stt.as_mut(), self.retry_delay).await
    }

    /// Run [`reconnect_stt`](Self::reconnect_stt) on its own task so the
    /// caller keeps serving other events. Audio input is dropped and fragment
    /// polls come back empty until the task ends.
    pub fn spawn_reconnect(self: &Arc<Self>) -> JoinHandle<Result<(), TranscriptionServiceError>> {
        self.reconnecting.store(true, Ordering::SeqCst);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let _flag = ReconnectingFlag(&orchestrator.reconnecting);
            orchestrator.reconnect_stt().await
        })
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub async fn stt_connected(&self) -> bool {
        self.stt.lock().await.is_connected()
    }

    pub fn set_voice(&self, voice_id: &str) {
        self.tts.set_voice(voice_id);
    }

    pub fn apply_profile(&self, profile: &VoiceProfile) {
        self.tts
            .set_delivery(profile.speaking_rate, profile.energy.style());
    }

    /// Synthesise `text` and stream it to the peer.
    ///
    /// Sends `speaking_started` first and `speaking_complete` only when the
    /// synthesizer reached its end marker. A newer call, or
    /// [`interrupt_speech`](Self::interrupt_speech), stops delivery before the
    /// next chunk is forwarded.
    pub async fn speak_response(
        &self,
        text: &str,
        flush: bool,
        is_filler: bool,
        transport: &dyn TransportSender,
    ) -> Result<SpeakOutcome, EngineError> {
        let id = self.next_speech_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some(previous) = self.lock_speaking().replace(ActiveSpeech {
            id,
            token: token.clone(),
        }) {
            previous.token.cancel();
        }

        let result = self
            .deliver(text, flush, is_filler, &token, transport)
            .await;

        let mut speaking = self.lock_speaking();
        if speaking.as_ref().is_some_and(|active| active.id == id) {
            *speaking = None;
        }
        result
    }

    async fn deliver(
        &self,
        text: &str,
        flush: bool,
        is_filler: bool,
        token: &CancellationToken,
        transport: &dyn TransportSender,
    ) -> Result<SpeakOutcome, EngineError> {
        transport
            .send_control(&OutboundMessage::SpeakingStarted {
                text: text.to_string(),
                is_filler,
            })
            .await?;

        let mut stream = self.tts.speak(text, flush);
        let mut chunks = 0usize;
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = stream.next() => Some(item),
            };
            match next {
                None => break Ok(SpeakOutcome::Interrupted),
                Some(Some(Ok(AudioChunk::Audio(audio)))) => {
                    if token.is_cancelled() {
                        break Ok(SpeakOutcome::Interrupted);
                    }
                    chunks += 1;
                    if let Err(e) = transport.send_audio(&audio).await {
                        break Err(EngineError::from(e));
                    }
                }
                Some(Some(Ok(AudioChunk::End))) => break Ok(SpeakOutcome::Completed),
                Some(Some(Err(e))) => break Err(EngineError::from(e)),
                Some(None) if token.is_cancelled() => break Ok(SpeakOutcome::Interrupted),
                Some(None) => {
                    break Err(EngineError::from(SynthesisServiceError::Synthesis(
                        "audio stream ended without end marker".to_string(),
                    )))
                }
            }
        };
        // Close the generator before anything else is spoken.
        drop(stream);

        log::debug!(
            "[{}] Spoke {} chunks ({:?})",
            self.session_id,
            chunks,
            outcome.as_ref().ok()
        );
        if let Ok(SpeakOutcome::Completed) = outcome {
            transport
                .send_control(&OutboundMessage::SpeakingComplete)
                .await?;
        }
        outcome
    }

    /// Stop the in-flight `speak_response`. Returns whether anything was
    /// speaking; a second call with nothing in flight does nothing.
    pub fn interrupt_speech(&self) -> bool {
        match self.lock_speaking().take() {
            Some(active) => {
                active.token.cancel();
                self.tts.abort();
                log::info!("[{}] ✋ Speech interrupted", self.session_id);
                true
            }
            None => false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.lock_speaking().is_some()
    }

    pub async fn close(&self) {
        self.interrupt_speech();
        self.stt.lock().await.close().await;
        log::debug!("[{}] Orchestrator closed", self.session_id);
    }

    fn lock_speaking(&self) -> MutexGuard<'_, Option<ActiveSpeech>> {
        self.speaking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
