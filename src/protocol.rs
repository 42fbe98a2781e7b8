//! Wire messages exchanged with the peer.
//!
//! Two inbound dialects exist: the raw socket dialect (binary audio frames plus
//! JSON control frames tagged by `type`) and the telephony media-stream dialect
//! (JSON envelopes tagged by `event`). Both are mapped onto [`ControlMessage`]
//! and raw audio bytes before they reach a session.

use serde::{Deserialize, Serialize};

/// Control messages a session reacts to, whatever dialect carried them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Auth {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default, skip_serializing)]
        token: Option<String>,
    },
    StartIdeation {
        #[serde(default)]
        topic: Option<String>,
    },
    SaveIdea {
        #[serde(default)]
        title: Option<String>,
    },
    ChangeVoice {
        voice_id: String,
    },
    EndSession,
    /// Raised by the telephony bridge when the provider announces the stream.
    #[serde(skip_deserializing)]
    CallStarted {
        stream_sid: String,
        call_sid: Option<String>,
    },
}

/// Messages sent to the peer over the raw socket dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    PartialTranscript { text: String, confidence: f32 },
    SpeakingStarted { text: String, is_filler: bool },
    SpeakingComplete,
    Interruption { action: String, response: String },
    System { message: String },
    Error { message: String },
}

impl OutboundMessage {
    pub fn system(message: impl Into<String>) -> Self {
        OutboundMessage::System {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }
}

/// Inbound telephony media-stream envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StartPayload,
    },
    Media {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },
    Dtmf {
        #[serde(default)]
        dtmf: Option<DtmfPayload>,
    },
    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartPayload {
    #[serde(rename = "streamSid", default)]
    pub stream_sid: Option<String>,
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    /// base64 encoded audio
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
}

/// Outbound telephony media-stream envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyCommand {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}
