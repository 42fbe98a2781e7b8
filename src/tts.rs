use async_stream::stream;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Error, Debug)]
pub enum SynthesisServiceError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Connection attempt timed out after {0}ms")]
    ConnectTimeout(u64),
    #[error("No audio received for {0}ms")]
    Stalled(u64),
    #[error("API error: {message}")]
    ApiError { message: String },
    #[error("Audio decode error: {0}")]
    Decode(String),
    #[error("Synthesis error: {0}")]
    Synthesis(String),
}

/// One element of a `speak` call's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioChunk {
    Audio(Vec<u8>),
    /// Terminal sentinel: the call produced all of its audio.
    End,
}

/// Lazily produced audio for one `speak` call. Finite, not restartable.
pub type AudioStream =
    Pin<Box<dyn Stream<Item = Result<AudioChunk, SynthesisServiceError>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub speed: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            speed: 1.0,
            use_speaker_boost: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub voice_id: String,
    pub model: String,
    pub voice: VoiceSettings,
    /// Characters buffered before the provider is forced to synthesise, per
    /// successive request. Trades first-audio latency against naturalness.
    pub chunk_length_schedule: Vec<u32>,
    pub output_format: String,
    pub connect_timeout: Duration,
    /// Longest gap tolerated between provider frames.
    pub inactivity_timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(), // Rachel voice
            model: "eleven_flash_v2_5".to_string(),
            voice: VoiceSettings::default(),
            chunk_length_schedule: vec![50, 90, 120, 150],
            output_format: "pcm_16000".to_string(),
            connect_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(10),
        }
    }
}

impl TtsConfig {
    /// 8kHz mu-law output for telephony bridges.
    pub fn telephony() -> Self {
        Self {
            output_format: "ulaw_8000".to_string(),
            ..Self::default()
        }
    }
}

/// Streaming text-to-speech with explicit abort.
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesising `text`. With `flush` the provider emits audio for
    /// everything buffered immediately instead of waiting for more input.
    fn speak(&self, text: &str, flush: bool) -> AudioStream;

    /// Stop the in-flight `speak` call. Once this returns, that call's stream
    /// yields no further chunks. No-op when nothing is in flight.
    fn abort(&self);

    fn set_voice(&self, voice_id: &str);

    /// Adjust delivery for later calls. `speed` 1.0 is neutral, `style` is 0..1.
    fn set_delivery(&self, speed: f32, style: f32);
}

#[derive(Debug, Deserialize)]
struct SynthesisFrame {
    #[serde(default)]
    audio: Option<String>,
    #[serde(rename = "isFinal", default)]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
struct DecodedFrame {
    audio: Option<Vec<u8>>,
    is_final: bool,
}

fn parse_frame(text: &str) -> Result<DecodedFrame, SynthesisServiceError> {
    let frame: SynthesisFrame = serde_json::from_str(text)
        .map_err(|e| SynthesisServiceError::Synthesis(format!("Invalid JSON: {}", e)))?;

    if let Some(error) = frame.error {
        return Err(SynthesisServiceError::ApiError {
            message: frame.message.unwrap_or(error),
        });
    }

    let audio = match frame.audio {
        Some(encoded) if !encoded.is_empty() => Some(
            BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| SynthesisServiceError::Decode(e.to_string()))?,
        ),
        _ => None,
    };

    Ok(DecodedFrame {
        audio,
        is_final: frame.is_final.unwrap_or(false),
    })
}

/// Frames sent on a fresh stream-input connection: settings, text, end of input.
fn request_frames(config: &TtsConfig, api_key: &str, text: &str, flush: bool) -> [String; 3] {
    let settings = json!({
        "text": " ",
        "voice_settings": {
            "stability": config.voice.stability,
            "similarity_boost": config.voice.similarity_boost,
            "style": config.voice.style,
            "speed": config.voice.speed,
            "use_speaker_boost": config.voice.use_speaker_boost
        },
        "generation_config": {
            "chunk_length_schedule": config.chunk_length_schedule
        },
        "xi_api_key": api_key
    });
    let body = json!({
        "text": format!("{} ", text.trim()),
        "try_trigger_generation": true,
        "flush": flush
    });
    let end_of_input = json!({ "text": "" });

    [settings.to_string(), body.to_string(), end_of_input.to_string()]
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ElevenLabsTts {
    api_key: String,
    base_url: String,
    config: Mutex<TtsConfig>,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl ElevenLabsTts {
    pub fn new(api_key: String) -> Self {
        Self::with_config(api_key, TtsConfig::default())
    }

    pub fn with_config(api_key: String, config: TtsConfig) -> Self {
        Self {
            api_key,
            base_url: "wss://api.elevenlabs.io/v1".to_string(),
            config: Mutex::new(config),
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn config(&self) -> TtsConfig {
        lock(&self.config).clone()
    }

    fn stream_url(&self, config: &TtsConfig) -> Result<Url, SynthesisServiceError> {
        let mut url = Url::parse(&format!(
            "{}/text-to-speech/{}/stream-input",
            self.base_url, config.voice_id
        ))?;
        url.query_pairs_mut()
            .append_pair("model_id", &config.model)
            .append_pair("output_format", &config.output_format);
        Ok(url)
    }
}

impl SpeechSynthesizer for ElevenLabsTts {
    fn speak(&self, text: &str, flush: bool) -> AudioStream {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.in_flight).replace(token.clone()) {
            previous.cancel();
        }

        let config = self.config();
        let url = self.stream_url(&config);
        let frames = request_frames(&config, &self.api_key, text, flush);
        let blank = text.trim().is_empty();

        Box::pin(stream! {
            if blank {
                yield Ok(AudioChunk::End);
                return;
            }
            let url = match url {
                Ok(url) => url,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let connect = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()));
            let connected = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = connect => Some(result),
            };
            let ws_stream = match connected {
                None => return,
                Some(Err(_)) => {
                    yield Err(SynthesisServiceError::ConnectTimeout(
                        config.connect_timeout.as_millis() as u64,
                    ));
                    return;
                }
                Some(Ok(Err(e))) => {
                    yield Err(SynthesisServiceError::from(e));
                    return;
                }
                Some(Ok(Ok((ws_stream, _)))) => ws_stream,
            };
            let (mut write, mut read) = ws_stream.split();

            let mut send_error = None;
            for frame in frames {
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    send_error = Some(e);
                    break;
                }
            }
            if let Some(e) = send_error {
                yield Err(SynthesisServiceError::from(e));
                return;
            }

            let mut chunks = 0usize;
            let mut finished = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    message = tokio::time::timeout(config.inactivity_timeout, read.next()) => Some(message),
                };
                let message = match next {
                    None => {
                        log::debug!("TTS: aborted after {} chunks", chunks);
                        break;
                    }
                    Some(Err(_)) => {
                        yield Err(SynthesisServiceError::Stalled(
                            config.inactivity_timeout.as_millis() as u64,
                        ));
                        break;
                    }
                    Some(Ok(message)) => message,
                };

                match message {
                    Some(Ok(Message::Text(text))) => match parse_frame(text.as_str()) {
                        Ok(frame) => {
                            if let Some(audio) = frame.audio {
                                if token.is_cancelled() {
                                    break;
                                }
                                chunks += 1;
                                yield Ok(AudioChunk::Audio(audio));
                            }
                            if frame.is_final {
                                finished = true;
                                break;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        finished = true;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        yield Err(SynthesisServiceError::from(e));
                        break;
                    }
                }
            }

            // Close explicitly so the provider stops generating buffered audio.
            let _ = write.close().await;
            if finished && !token.is_cancelled() {
                log::debug!("TTS: stream complete, {} chunks", chunks);
                yield Ok(AudioChunk::End);
            }
        })
    }

    fn abort(&self) {
        if let Some(token) = lock(&self.in_flight).take() {
            token.cancel();
        }
    }

    fn set_voice(&self, voice_id: &str) {
        lock(&self.config).voice_id = voice_id.to_string();
    }

    fn set_delivery(&self, speed: f32, style: f32) {
        let mut config = lock(&self.config);
        // provider accepts 0.7..=1.2
        config.voice.speed = speed.clamp(0.7, 1.2);
        config.voice.style = style.clamp(0.0, 1.0);
    }
}
