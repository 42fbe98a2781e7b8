use crate::config::{ApiConfig, EngineConfig};
use crate::error::Result;
use crate::generation::{ContentGenerator, GroqGenerator};
use crate::manager::{ConversationManager, SessionServices};
use crate::orchestrator::VoiceOrchestrator;
use crate::personality::VoiceProfile;
use crate::protocol::{ControlMessage, OutboundMessage};
use crate::registry::{SessionRegistry, TransportKind};
use crate::sink::{LogTranscriptSink, TranscriptSink};
use crate::stt::{DeepgramStt, SttClient, SttConfig};
use crate::transport::{raw, telephony, TransportReceiver, TransportSender};
use crate::tts::{ElevenLabsTts, SpeechSynthesizer, TtsConfig};
use futures_util::SinkExt;
use http::StatusCode;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::accept_hdr_async;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the per-session provider clients and policies.
pub trait SessionFactory: Send + Sync {
    fn stt(&self, kind: TransportKind) -> Box<dyn SttClient>;
    fn tts(&self, kind: TransportKind) -> Arc<dyn SpeechSynthesizer>;
    fn services(&self) -> SessionServices;
}

/// Deepgram transcription, ElevenLabs synthesis and Groq generation.
pub struct ProviderFactory {
    api: ApiConfig,
    generator: Arc<dyn ContentGenerator>,
    sink: Arc<dyn TranscriptSink>,
    phrase_seed: Option<u64>,
}

impl ProviderFactory {
    pub fn new(api: ApiConfig, phrase_seed: Option<u64>) -> Result<Self> {
        let generator = GroqGenerator::new(api.groq_key().to_string())?;
        Ok(Self {
            api,
            generator: Arc::new(generator),
            sink: Arc::new(LogTranscriptSink),
            phrase_seed,
        })
    }
}

impl SessionFactory for ProviderFactory {
    fn stt(&self, kind: TransportKind) -> Box<dyn SttClient> {
        let config = match kind {
            TransportKind::Raw => SttConfig::default(),
            TransportKind::Telephony => SttConfig::telephony(),
        };
        Box::new(DeepgramStt::with_config(
            self.api.deepgram_key().to_string(),
            config,
        ))
    }

    fn tts(&self, kind: TransportKind) -> Arc<dyn SpeechSynthesizer> {
        let config = match kind {
            TransportKind::Raw => TtsConfig::default(),
            TransportKind::Telephony => TtsConfig::telephony(),
        };
        Arc::new(ElevenLabsTts::with_config(
            self.api.elevenlabs_key().to_string(),
            config,
        ))
    }

    fn services(&self) -> SessionServices {
        SessionServices::new(
            Arc::clone(&self.generator),
            Arc::clone(&self.sink),
            self.phrase_seed,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub voice_id: String,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8765".to_string(),
            voice_id: TtsConfig::default().voice_id,
            engine: EngineConfig::default(),
        }
    }
}

/// Request path to transport dialect.
pub fn route(path: &str) -> Option<TransportKind> {
    match path {
        "/ws" => Some(TransportKind::Raw),
        "/media-stream" => Some(TransportKind::Telephony),
        _ => None,
    }
}

/// Accepts WebSocket connections and runs one session per connection.
pub struct VoiceServer {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn SessionFactory>,
}

impl VoiceServer {
    pub fn new(config: ServerConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let registry = SessionRegistry::new(config.engine.max_sessions);
        Self {
            config: Arc::new(config),
            registry,
            factory,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind and serve until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve on `listener` until `shutdown` resolves, then end every session.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        log::info!("🎯 Voice server listening on {}", listener.local_addr()?);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.config),
                            Arc::clone(&self.registry),
                            Arc::clone(&self.factory),
                        ));
                    }
                    Err(e) => log::warn!("Accept failed: {}", e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = &mut shutdown => {
                    log::info!("Received shutdown signal, ending sessions...");
                    break;
                }
            }
        }

        let ended = self.registry.broadcast(ControlMessage::EndSession).await;
        log::info!("Sent end_session to {} sessions", ended);

        let drain = async { while sessions.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            log::warn!("Sessions did not finish in time, aborting");
            sessions.abort_all();
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn SessionFactory>,
) {
    let mut kind = None;
    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        match route(request.uri().path()) {
            Some(found) => {
                kind = Some(found);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("not found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let Some(kind) = kind else {
        return;
    };

    let mut guard = match registry.register(kind) {
        Ok(guard) => guard,
        Err(e) => {
            log::warn!("Rejecting {}: {}", peer, e);
            if let Ok(json) = serde_json::to_string(&OutboundMessage::error(e.to_string())) {
                let _ = ws.send(Message::Text(json.into())).await;
            }
            let _ = ws.close(None).await;
            return;
        }
    };
    let session_id = guard.id().to_string();
    let control_rx = guard.take_control();
    log::info!("[{}] {} connection from {}", session_id, kind, peer);

    let (mut receiver, sender): (Box<dyn TransportReceiver>, Arc<dyn TransportSender>) = match kind {
        TransportKind::Raw => {
            let (receiver, sender) = raw::split(ws, &session_id);
            (Box::new(receiver), Arc::new(sender))
        }
        TransportKind::Telephony => {
            let (receiver, sender) = telephony::split(ws, &session_id);
            (Box::new(receiver), Arc::new(sender))
        }
    };

    let orchestrator = Arc::new(VoiceOrchestrator::new(
        session_id.clone(),
        factory.stt(kind),
        factory.tts(kind),
        config.engine.stt_retry_delay,
    ));
    let manager = ConversationManager::new(
        session_id.clone(),
        config.engine.clone(),
        orchestrator,
        sender,
        factory.services(),
        VoiceProfile::new(config.voice_id.clone()),
    );

    if let Ok(report) = manager.run(receiver.as_mut(), control_rx).await {
        log::info!(
            "[{}] Closed after {} turns, {} interruptions",
            report.session_id,
            report.turn_count,
            report.interruption_count
        );
    }
    drop(guard);
}
