//! Raw socket dialect: binary frames carry audio, text frames carry JSON
//! control messages tagged by `type`.

use super::{is_disconnect, InboundFrame, ProtocolError, TransportError, TransportReceiver, TransportSender};
use crate::protocol::{ControlMessage, OutboundMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

const KNOWN_TYPES: &[&str] = &["auth", "start_ideation", "save_idea", "change_voice", "end_session"];

/// Split an accepted socket into the session-facing halves.
pub fn split<S>(ws: WebSocketStream<S>, session_id: &str) -> (RawReceiver<S>, RawSender<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        RawReceiver {
            stream,
            session_id: session_id.to_string(),
        },
        RawSender {
            sink: Mutex::new(sink),
        },
    )
}

pub fn parse_control(text: &str) -> Result<ControlMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::MalformedFrame("missing \"type\"".to_string()))?;
    if !KNOWN_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownMessage(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

pub struct RawReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    session_id: String,
}

#[async_trait]
impl<S> TransportReceiver for RawReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        while let Some(message) = self.stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) if is_disconnect(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            match message {
                Message::Binary(data) => return Ok(Some(InboundFrame::Audio(data.as_slice().to_vec()))),
                Message::Text(text) => match parse_control(text.as_str()) {
                    Ok(control) => return Ok(Some(InboundFrame::Control(control))),
                    Err(e) => log::warn!("[{}] Dropping control frame: {}", self.session_id, e),
                },
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => {}
                _ => log::debug!(
                    "[{}] {}",
                    self.session_id,
                    ProtocolError::UnexpectedFrame("raw")
                ),
            }
        }
        Ok(None)
    }
}

pub struct RawSender<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

#[async_trait]
impl<S> TransportSender for RawSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_audio(&self, audio: &[u8]) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(audio.to_vec().into()))
            .await?;
        Ok(())
    }

    async fn send_control(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)?;
        self.sink.lock().await.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Raw peers play what they receive; there is no remote buffer to clear.
    async fn clear_audio(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        match self.sink.lock().await.close().await {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    #[test]
    fn test_parse_control_rejects_unknown_and_malformed() {
        assert!(matches!(
            parse_control(r#"{"type":"dance"}"#),
            Err(ProtocolError::UnknownMessage(t)) if t == "dance"
        ));
        assert!(matches!(
            parse_control("not json"),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(
            parse_control(r#"{"type":"change_voice"}"#),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert_eq!(
            parse_control(r#"{"type":"end_session"}"#).unwrap(),
            ControlMessage::EndSession
        );
    }

    #[tokio::test]
    async fn test_receive_skips_malformed_frames() {
        let (server, mut client) = pair().await;
        let (mut receiver, _sender) = split(server, "t");

        client.send(Message::Text("{oops".into())).await.unwrap();
        client.send(Message::Text(r#"{"type":"bogus"}"#.into())).await.unwrap();
        client.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
        client
            .send(Message::Text(r#"{"type":"start_ideation","topic":"gardens"}"#.into()))
            .await
            .unwrap();

        assert_eq!(
            receiver.receive().await.unwrap(),
            Some(InboundFrame::Audio(vec![1, 2, 3]))
        );
        assert_eq!(
            receiver.receive().await.unwrap(),
            Some(InboundFrame::Control(ControlMessage::StartIdeation {
                topic: Some("gardens".into())
            }))
        );

        client.close(None).await.unwrap();
        assert_eq!(receiver.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sender_writes_audio_and_json() {
        let (server, mut client) = pair().await;
        let (_receiver, sender) = split(server, "t");

        sender.send_audio(&[9, 8, 7]).await.unwrap();
        sender.send_control(&OutboundMessage::SpeakingComplete).await.unwrap();
        sender.clear_audio().await.unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data.as_slice().to_vec(), vec![9, 8, 7]),
            other => panic!("unexpected {:?}", other),
        }
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"type":"speaking_complete"}"#),
            other => panic!("unexpected {:?}", other),
        }
    }
}
