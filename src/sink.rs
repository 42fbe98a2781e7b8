use crate::error::Result;
use crate::history::{last_user, ConversationHistory, Utterance};
use async_trait::async_trait;

/// Receives finalized conversation history. Storage is up to the implementor.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    /// Called once when a session ends.
    async fn save_transcript(&self, session_id: &str, history: &[Utterance]) -> Result<()>;

    /// Called on a `save_idea` control message with the history so far.
    async fn save_idea(
        &self,
        session_id: &str,
        title: Option<&str>,
        history: &[Utterance],
    ) -> Result<()>;
}

/// Default sink: writes a summary to the log and keeps nothing.
#[derive(Debug, Clone, Default)]
pub struct LogTranscriptSink;

#[async_trait]
impl TranscriptSink for LogTranscriptSink {
    async fn save_transcript(&self, session_id: &str, history: &[Utterance]) -> Result<()> {
        let summary = ConversationHistory::from(history.to_vec()).summary();
        log::info!("[{}] 📝 {}", session_id, summary);
        Ok(())
    }

    async fn save_idea(
        &self,
        session_id: &str,
        title: Option<&str>,
        history: &[Utterance],
    ) -> Result<()> {
        let latest = last_user(history).map(|u| u.text.as_str()).unwrap_or("");
        log::info!(
            "[{}] 💡 Idea saved: {} ({})",
            session_id,
            title.unwrap_or("untitled"),
            latest
        );
        Ok(())
    }
}
