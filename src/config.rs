use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

/// Configuration for API services
#[derive(Debug)]
pub struct ApiConfig {
    pub deepgram_key: SecretBox<String>,
    pub elevenlabs_key: SecretBox<String>,
    pub groq_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let deepgram_key = Self::load_api_key("DEEPGRAM_API_KEY", "Deepgram")?;
        let elevenlabs_key = Self::load_api_key("ELEVENLABS_API_KEY", "ElevenLabs")?;
        let groq_key = Self::load_api_key("GROQ_API_KEY", "Groq")?;

        Ok(Self {
            deepgram_key,
            elevenlabs_key,
            groq_key,
        })
    }

    /// Load and validate a single API key from environment
    fn load_api_key(env_var: &str, service_name: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;

        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKeyFormat {
                service: service_name.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }

        Self::validate_key_format(&key, service_name)?;

        Ok(SecretBox::new(Box::new(key)))
    }

    /// Validate API key format for each service
    fn validate_key_format(key: &str, service: &str) -> Result<(), ConfigError> {
        match service {
            "Groq" => {
                // Groq keys typically start with "gsk_"
                if !key.starts_with("gsk_") {
                    return Err(ConfigError::InvalidKeyFormat {
                        service: service.to_string(),
                        reason: "Groq keys should start with 'gsk_'".to_string(),
                    });
                }
            }
            "Deepgram" | "ElevenLabs" => {
                if key.len() < 10 {
                    return Err(ConfigError::InvalidKeyFormat {
                        service: service.to_string(),
                        reason: format!("{} keys should be at least 10 characters", service),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Get Deepgram API key (use only when making API calls)
    pub fn deepgram_key(&self) -> &str {
        self.deepgram_key.expose_secret()
    }

    /// Get ElevenLabs API key (use only when making API calls)
    pub fn elevenlabs_key(&self) -> &str {
        self.elevenlabs_key.expose_secret()
    }

    /// Get Groq API key (use only when making API calls)
    pub fn groq_key(&self) -> &str {
        self.groq_key.expose_secret()
    }
}

/// What a session does once the transcription service has failed twice in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SttFailurePolicy {
    /// Keep the session open without transcription and retry periodically.
    Degrade,
    /// End the session.
    Terminate,
}

/// Per-session tunables for the conversation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded wait used when polling for the next transcript fragment.
    pub fragment_poll_interval: Duration,
    /// Upper bound on a single content-generation call.
    pub generation_timeout: Duration,
    /// A filler is spoken only if generation takes longer than this.
    pub filler_delay: Duration,
    /// Pause before the single automatic STT reconnect attempt.
    pub stt_retry_delay: Duration,
    /// Minimum spacing between reconnect attempts while degraded.
    pub stt_retry_interval: Duration,
    pub stt_failure_policy: SttFailurePolicy,
    /// Maximum number of concurrently registered sessions.
    pub max_sessions: usize,
    /// Number of trailing utterances passed to content generation.
    pub history_window: usize,
    /// The voice profile is re-tuned every this many completed turns.
    pub adapt_every_turns: u32,
    /// Seed for phrase selection; `None` seeds from entropy.
    pub phrase_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fragment_poll_interval: Duration::from_millis(100),
            generation_timeout: Duration::from_secs(8),
            filler_delay: Duration::from_millis(600),
            stt_retry_delay: Duration::from_millis(500),
            stt_retry_interval: Duration::from_secs(10),
            stt_failure_policy: SttFailurePolicy::Degrade,
            max_sessions: 64,
            history_window: 20,
            adapt_every_turns: 3,
            phrase_seed: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `VOICE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Some(ms) = parse_env::<u64>("VOICE_FRAGMENT_POLL_MS")? {
            config.fragment_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("VOICE_GENERATION_TIMEOUT_MS")? {
            config.generation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("VOICE_FILLER_DELAY_MS")? {
            config.filler_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("VOICE_STT_RETRY_DELAY_MS")? {
            config.stt_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("VOICE_STT_RETRY_INTERVAL_MS")? {
            config.stt_retry_interval = Duration::from_millis(ms);
        }
        if let Some(policy) = parse_env::<SttFailurePolicy>("VOICE_STT_FAILURE_POLICY")? {
            config.stt_failure_policy = policy;
        }
        if let Some(max) = parse_env::<usize>("VOICE_MAX_SESSIONS")? {
            config.max_sessions = max;
        }
        if let Some(window) = parse_env::<usize>("VOICE_HISTORY_WINDOW")? {
            config.history_window = window;
        }
        if let Some(turns) = parse_env::<u32>("VOICE_ADAPT_EVERY_TURNS")? {
            config.adapt_every_turns = turns.max(1);
        }
        if let Some(seed) = parse_env::<u64>("VOICE_PHRASE_SEED")? {
            config.phrase_seed = Some(seed);
        }
        Ok(config)
    }
}

fn parse_env<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Successfully loaded API configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}
