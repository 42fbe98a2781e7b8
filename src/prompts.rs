// System prompts and spoken fallback templates

pub struct SystemPrompts;

impl SystemPrompts {
    /// Base persona for spoken conversation
    pub fn voice_companion() -> &'static str {
        "You are a warm, quick-witted voice companion having a live spoken conversation.

VOICE RESPONSE GUIDELINES:
- Keep responses conversational and natural for speech
- Avoid markdown, bullet points, emoji, or any formatting that cannot be spoken
- Answer in one to three short sentences unless asked for more detail
- If you did not understand, ask a brief clarifying question
- Never mention that you are reading a transcript"
    }

    /// Added to the persona while the session is brainstorming
    pub fn ideation(topic: Option<&str>) -> String {
        let focus = match topic {
            Some(topic) if !topic.trim().is_empty() => format!(" about {}", topic.trim()),
            _ => String::new(),
        };
        format!(
            "The user is brainstorming ideas{}. Build on what they say, offer one fresh angle \
             at a time, and keep the energy up. Do not list many ideas at once.",
            focus
        )
    }

    /// Delivery hint derived from the current voice profile
    pub fn delivery(energy: &str, speaking_rate: f32) -> String {
        if speaking_rate > 1.05 {
            format!("The user speaks quickly; keep answers brisk. Energy: {}.", energy)
        } else if speaking_rate < 0.95 {
            format!("The user speaks slowly; keep answers calm and short. Energy: {}.", energy)
        } else {
            format!("Energy: {}.", energy)
        }
    }
}

pub struct ConversationTemplates;

impl ConversationTemplates {
    /// Spoken when content generation fails or times out
    pub fn fallback_apology() -> &'static str {
        "Sorry, I lost my train of thought for a second. Could you say that again?"
    }

    /// Sent as text when speech synthesis is unavailable
    pub fn synthesis_unavailable() -> &'static str {
        "Voice output is temporarily unavailable; replying in text."
    }

    /// Sent when transcription cannot be restored
    pub fn transcription_unavailable() -> &'static str {
        "I can't hear you right now. Trying to reconnect..."
    }

    pub fn ideation_started(topic: Option<&str>) -> String {
        match topic {
            Some(topic) if !topic.trim().is_empty() => {
                format!("Ideation session started: {}", topic.trim())
            }
            _ => "Ideation session started".to_string(),
        }
    }
}
