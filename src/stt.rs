use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::{HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

#[derive(Error, Debug)]
pub enum TranscriptionServiceError {
    #[error("WebSocket connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Invalid request header: {0}")]
    InvalidHeader(String),
    #[error("Connection attempt timed out after {0}ms")]
    ConnectTimeout(u64),
    #[error("Transcription stream is not connected")]
    NotConnected,
    #[error("Transcription stream disconnected: {0}")]
    Disconnected(String),
    #[error("Response parsing error: {0}")]
    ParseError(String),
    #[error("Transcription service unavailable after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },
}

/// An incremental recognition result.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    pub text: String,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    pub is_final: bool,
    pub is_speech_final: bool,
    pub received_at: Instant,
}

impl TranscriptFragment {
    pub fn new(text: impl Into<String>, confidence: f32, is_final: bool, is_speech_final: bool) -> Self {
        Self {
            text: text.into(),
            confidence: if confidence.is_nan() {
                0.0
            } else {
                confidence.clamp(0.0, 1.0)
            },
            is_final,
            is_speech_final,
            received_at: Instant::now(),
        }
        .normalized()
    }

    pub fn interim(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(text, confidence, false, false)
    }

    pub fn finalized(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(text, confidence, true, false)
    }

    pub fn speech_final(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(text, confidence, true, true)
    }

    // speech-final implies final
    fn normalized(mut self) -> Self {
        if self.is_speech_final {
            self.is_final = true;
        }
        self
    }

    /// Whitespace-only fragments carry no speech.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AudioEncoding {
    Linear16,
    Mulaw,
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub model: String,
    pub language: String,
    pub punctuate: bool,
    pub interim_results: bool,
    /// Silence (ms) after which the provider marks speech as final.
    pub endpointing_ms: u32,
    /// Gap (ms) after the last final word before an utterance-end event.
    pub utterance_end_ms: Option<u32>,
    pub vad_events: bool,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Capacity of the fragment queue between the reader task and the session.
    pub fragment_buffer: usize,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            language: "en-US".to_string(),
            punctuate: true,
            interim_results: true,
            endpointing_ms: 300,
            utterance_end_ms: Some(1000),
            vad_events: true,
            encoding: AudioEncoding::Linear16,
            sample_rate: 16000,
            channels: 1,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(8),
            fragment_buffer: 64,
        }
    }
}

impl SttConfig {
    /// Settings for 8kHz mu-law telephony audio.
    pub fn telephony() -> Self {
        Self {
            encoding: AudioEncoding::Mulaw,
            sample_rate: 8000,
            ..Self::default()
        }
    }
}

/// A live transcription connection.
///
/// Fragments are pulled by the caller with a bounded wait so the caller can
/// interleave other work (interruption checks, inbound frames) between polls.
#[async_trait]
pub trait SttClient: Send {
    /// Open the connection. A single attempt; see [`connect_with_retry`].
    async fn connect(&mut self) -> Result<(), TranscriptionServiceError>;

    /// Forward one audio frame. Frames are delivered in call order.
    async fn send_audio(&mut self, audio: &[u8]) -> Result<(), TranscriptionServiceError>;

    /// Wait up to `wait` for the next fragment. `Ok(None)` means nothing
    /// arrived in time, never that the stream ended.
    async fn next_fragment(
        &mut self,
        wait: Duration,
    ) -> Result<Option<TranscriptFragment>, TranscriptionServiceError>;

    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// Connect, and on failure make exactly one more attempt after `retry_delay`.
pub async fn connect_with_retry(
    client: &mut (dyn SttClient + '_),
    retry_delay: Duration,
) -> Result<(), TranscriptionServiceError> {
    match client.connect().await {
        Ok(()) => Ok(()),
        Err(first) => {
            log::warn!(
                "STT: connect failed ({}), retrying in {}ms",
                first,
                retry_delay.as_millis()
            );
            tokio::time::sleep(retry_delay).await;
            match client.connect().await {
                Ok(()) => {
                    log::info!("STT: reconnected on retry");
                    Ok(())
                }
                Err(second) => Err(TranscriptionServiceError::RetryExhausted {
                    attempts: 2,
                    last: second.to_string(),
                }),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results(ResultsMessage),
    UtteranceEnd {},
    SpeechStarted {},
    Metadata {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultsMessage {
    channel: ResultsChannel,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Map one provider text frame to a fragment, if it carries one.
fn parse_deepgram_message(text: &str) -> Result<Option<TranscriptFragment>, TranscriptionServiceError> {
    let message: DeepgramMessage = serde_json::from_str(text)
        .map_err(|e| TranscriptionServiceError::ParseError(e.to_string()))?;

    match message {
        DeepgramMessage::Results(results) => {
            let Some(best) = results.channel.alternatives.into_iter().next() else {
                return Ok(None);
            };
            Ok(Some(TranscriptFragment::new(
                best.transcript,
                best.confidence,
                results.is_final,
                results.speech_final,
            )))
        }
        // The provider saw a gap after the last final word; closes the utterance.
        DeepgramMessage::UtteranceEnd {} => Ok(Some(TranscriptFragment::speech_final("", 1.0))),
        DeepgramMessage::SpeechStarted {} => {
            log::debug!("STT: speech started");
            Ok(None)
        }
        DeepgramMessage::Metadata {} | DeepgramMessage::Other => Ok(None),
    }
}

enum WriterCommand {
    Audio(Vec<u8>),
    Close,
}

type ReaderEvent = Result<TranscriptFragment, TranscriptionServiceError>;

struct SttConnection {
    commands: mpsc::Sender<WriterCommand>,
    fragments: mpsc::Receiver<ReaderEvent>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Drop for SttConnection {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

pub struct DeepgramStt {
    api_key: String,
    base_url: String,
    config: SttConfig,
    connection: Option<SttConnection>,
}

impl DeepgramStt {
    pub fn new(api_key: String) -> Self {
        Self::with_config(api_key, SttConfig::default())
    }

    pub fn with_config(api_key: String, config: SttConfig) -> Self {
        Self {
            api_key,
            base_url: "wss://api.deepgram.com/v1/listen".to_string(),
            config,
            connection: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn config(&self) -> &SttConfig {
        &self.config
    }

    fn build_url(&self) -> Result<Url, TranscriptionServiceError> {
        let mut url = Url::parse(&self.base_url)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("model", &self.config.model)
                .append_pair("language", &self.config.language)
                .append_pair("punctuate", &self.config.punctuate.to_string())
                .append_pair("interim_results", &self.config.interim_results.to_string())
                .append_pair("endpointing", &self.config.endpointing_ms.to_string())
                .append_pair("vad_events", &self.config.vad_events.to_string())
                .append_pair("encoding", &self.config.encoding.to_string())
                .append_pair("sample_rate", &self.config.sample_rate.to_string())
                .append_pair("channels", &self.config.channels.to_string());

            // utterance_end_ms is only honoured alongside interim results
            if let (Some(ms), true) = (self.config.utterance_end_ms, self.config.interim_results) {
                query.append_pair("utterance_end_ms", &ms.to_string());
            }
        }
        Ok(url)
    }

    fn drop_connection(&mut self, reason: &str) {
        if self.connection.take().is_some() {
            log::warn!("STT: dropping connection: {}", reason);
        }
    }
}

#[async_trait]
impl SttClient for DeepgramStt {
    async fn connect(&mut self) -> Result<(), TranscriptionServiceError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let url = self.build_url()?;
        let mut request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| TranscriptionServiceError::InvalidHeader(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        log::debug!("STT: connecting to {}", self.base_url);
        let timeout = self.config.connect_timeout;
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| TranscriptionServiceError::ConnectTimeout(timeout.as_millis() as u64))??;
        let (write, read) = ws_stream.split();

        let (command_tx, command_rx) = mpsc::channel(256);
        let (fragment_tx, fragment_rx) = mpsc::channel(self.config.fragment_buffer.max(1));

        let writer = tokio::spawn(run_writer(write, command_rx, self.config.keepalive_interval));
        let reader = tokio::spawn(run_reader(read, fragment_tx));

        self.connection = Some(SttConnection {
            commands: command_tx,
            fragments: fragment_rx,
            writer,
            reader,
        });
        log::info!("🎤 STT: transcription stream connected");
        Ok(())
    }

    async fn send_audio(&mut self, audio: &[u8]) -> Result<(), TranscriptionServiceError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(TranscriptionServiceError::NotConnected)?;

        if connection
            .commands
            .send(WriterCommand::Audio(audio.to_vec()))
            .await
            .is_err()
        {
            self.drop_connection("audio writer stopped");
            return Err(TranscriptionServiceError::Disconnected(
                "audio writer stopped".to_string(),
            ));
        }
        Ok(())
    }

    async fn next_fragment(
        &mut self,
        wait: Duration,
    ) -> Result<Option<TranscriptFragment>, TranscriptionServiceError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(TranscriptionServiceError::NotConnected)?;

        let event = match tokio::time::timeout(wait, connection.fragments.recv()).await {
            Err(_) => return Ok(None),
            Ok(event) => event,
        };

        match event {
            Some(Ok(fragment)) => Ok(Some(fragment)),
            Some(Err(e)) => {
                self.drop_connection(&e.to_string());
                Err(e)
            }
            None => {
                self.drop_connection("reader stopped");
                Err(TranscriptionServiceError::Disconnected(
                    "reader stopped".to_string(),
                ))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.commands.send(WriterCommand::Close).await;
            // Give the writer a moment to flush CloseStream; Drop aborts the rest.
            let _ = tokio::time::timeout(Duration::from_secs(2), &mut connection.writer).await;
            log::info!("STT: transcription stream closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

async fn run_writer<W>(mut write: W, mut commands: mpsc::Receiver<WriterCommand>, keepalive: Duration)
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let mut ticker = tokio::time::interval(keepalive);
    ticker.tick().await;
    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(WriterCommand::Audio(pcm)) => {
                    frames_sent += 1;
                    if let Err(e) = write.send(Message::Binary(pcm.into())).await {
                        log::warn!("STT: failed to send audio frame {}: {}", frames_sent, e);
                        break;
                    }
                }
                Some(WriterCommand::Close) | None => {
                    let close = json!({"type": "CloseStream"}).to_string();
                    if let Err(e) = write.send(Message::Text(close.into())).await {
                        log::debug!("STT: failed to send CloseStream: {}", e);
                    }
                    break;
                }
            },
            _ = ticker.tick() => {
                let keepalive = json!({"type": "KeepAlive"}).to_string();
                if let Err(e) = write.send(Message::Text(keepalive.into())).await {
                    log::warn!("STT: keepalive failed: {}", e);
                    break;
                }
            }
        }
    }

    log::debug!("STT: audio writer finished after {} frames", frames_sent);
    let _ = write.close().await;
}

async fn run_reader<R>(mut read: R, fragments: mpsc::Sender<ReaderEvent>)
where
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => match parse_deepgram_message(text.as_str()) {
                Ok(Some(fragment)) => {
                    if fragments.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("STT: ignoring unparseable message: {}", e),
            },
            Ok(Message::Close(frame)) => {
                log::info!("STT: server closed connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = fragments
                    .send(Err(TranscriptionServiceError::Disconnected(e.to_string())))
                    .await;
                return;
            }
        }
    }

    let _ = fragments
        .send(Err(TranscriptionServiceError::Disconnected(
            "server closed the stream".to_string(),
        )))
        .await;
}
