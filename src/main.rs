use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use voice_dialogue_rs::config::{load_config, EngineConfig};
use voice_dialogue_rs::server::{ProviderFactory, ServerConfig, VoiceServer};
use voice_dialogue_rs::tts::TtsConfig;

#[derive(Parser)]
#[command(name = "voice-dialogue")]
#[command(about = "Real-time voice conversation server")]
#[command(long_about = "
Accepts WebSocket connections and holds a spoken conversation on each one:
speech recognition, response generation, streaming synthesis and barge-in.

ROUTES:
  /ws            raw binary audio frames plus JSON control messages
  /media-stream  telephony media-stream JSON envelopes

EXAMPLES:
  # Serve on the default address
  voice-dialogue

  # Deterministic phrase choice and a different voice
  voice-dialogue --seed 42 --voice-id pNInz6obpgDQGcFmaJgB
")]
struct Args {
    /// TCP address and port to listen on
    #[arg(long, default_value = "127.0.0.1:8765")]
    bind: String,

    /// Initial synthesis voice
    #[arg(long)]
    voice_id: Option<String>,

    /// Seed for filler and acknowledgment phrase selection
    #[arg(long)]
    seed: Option<u64>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum concurrent sessions (overrides VOICE_MAX_SESSIONS)
    #[arg(long)]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();
    log::info!("🚀 Initializing voice-dialogue");

    let api_config = load_config().context("loading API keys")?;
    let mut engine = EngineConfig::from_env().context("loading VOICE_* settings")?;
    if let Some(max_sessions) = args.max_sessions {
        engine.max_sessions = max_sessions;
    }
    if args.seed.is_some() {
        engine.phrase_seed = args.seed;
    }

    let factory = ProviderFactory::new(api_config, engine.phrase_seed)
        .context("creating provider clients")?;
    let config = ServerConfig {
        bind_address: args.bind,
        voice_id: args.voice_id.unwrap_or_else(|| TtsConfig::default().voice_id),
        engine,
    };

    let server = VoiceServer::new(config, Arc::new(factory));
    server.run().await.context("voice server failed")?;

    println!("\n👋 Goodbye!");
    Ok(())
}
