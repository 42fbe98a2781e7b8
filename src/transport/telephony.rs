//! Telephony media-stream bridge: JSON envelopes tagged by `event`, audio as
//! base64 payloads addressed by the provider's `streamSid`.

use super::{is_disconnect, InboundFrame, ProtocolError, TransportError, TransportReceiver, TransportSender};
use crate::protocol::{
    ControlMessage, MarkPayload, OutboundMedia, OutboundMessage, TelephonyCommand, TelephonyEvent,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

pub const SPEAKING_COMPLETE_MARK: &str = "speaking_complete";

type StreamSid = Arc<StdMutex<Option<String>>>;

pub fn split<S>(ws: WebSocketStream<S>, session_id: &str) -> (TelephonyReceiver<S>, TelephonySender<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let stream_sid: StreamSid = Arc::new(StdMutex::new(None));
    (
        TelephonyReceiver {
            stream,
            stream_sid: stream_sid.clone(),
            session_id: session_id.to_string(),
        },
        TelephonySender {
            sink: Mutex::new(sink),
            stream_sid,
            session_id: session_id.to_string(),
        },
    )
}

fn current_sid(stream_sid: &StreamSid) -> Option<String> {
    stream_sid
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

pub struct TelephonyReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    stream_sid: StreamSid,
    session_id: String,
}

impl<S> TelephonyReceiver<S> {
    /// Map one envelope to a frame. `Ok(None)` for events with nothing to deliver.
    fn handle_event(&self, text: &str) -> Result<Option<InboundFrame>, ProtocolError> {
        let event: TelephonyEvent =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

        match event {
            TelephonyEvent::Connected { protocol } => {
                log::debug!("[{}] Media stream connected ({:?})", self.session_id, protocol);
                Ok(None)
            }
            TelephonyEvent::Start { stream_sid, start } => {
                let sid = start
                    .stream_sid
                    .or(stream_sid)
                    .ok_or_else(|| ProtocolError::MalformedFrame("start without streamSid".into()))?;
                *self
                    .stream_sid
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sid.clone());
                log::info!("[{}] 📞 Call stream started: {}", self.session_id, sid);
                Ok(Some(InboundFrame::Control(ControlMessage::CallStarted {
                    stream_sid: sid,
                    call_sid: start.call_sid,
                })))
            }
            TelephonyEvent::Media { media, .. } => {
                if let Some(track) = media.track.as_deref() {
                    if track != "inbound" {
                        return Ok(None);
                    }
                }
                let audio = BASE64
                    .decode(media.payload.as_bytes())
                    .map_err(|e| ProtocolError::InvalidAudio(e.to_string()))?;
                Ok(Some(InboundFrame::Audio(audio)))
            }
            TelephonyEvent::Mark { mark } => {
                log::debug!(
                    "[{}] Mark played: {}",
                    self.session_id,
                    mark.map(|m| m.name).unwrap_or_default()
                );
                Ok(None)
            }
            TelephonyEvent::Dtmf { dtmf } => {
                if let Some(dtmf) = dtmf {
                    log::info!("[{}] DTMF digit {}", self.session_id, dtmf.digit);
                }
                Ok(None)
            }
            TelephonyEvent::Stop { .. } => {
                log::info!("[{}] Call stream stopped", self.session_id);
                Ok(Some(InboundFrame::Control(ControlMessage::EndSession)))
            }
            TelephonyEvent::Unknown => Err(ProtocolError::UnknownMessage("telephony event".into())),
        }
    }
}

#[async_trait]
impl<S> TransportReceiver for TelephonyReceiver<S>
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
                Message::Text(text) => match self.handle_event(text.as_str()) {
                    Ok(Some(frame)) => return Ok(Some(frame)),
                    Ok(None) => {}
                    Err(e) => log::warn!("[{}] Dropping telephony frame: {}", self.session_id, e),
                },
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => {}
                _ => log::warn!(
                    "[{}] {}",
                    self.session_id,
                    ProtocolError::UnexpectedFrame("binary")
                ),
            }
        }
        Ok(None)
    }
}

pub struct TelephonySender<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream_sid: StreamSid,
    session_id: String,
}

impl<S> TelephonySender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_command(&self, command: &TelephonyCommand) -> Result<(), TransportError> {
        let json = serde_json::to_string(command)?;
        self.sink.lock().await.send(Message::Text(json.into())).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> TransportSender for TelephonySender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_audio(&self, audio: &[u8]) -> Result<(), TransportError> {
        let Some(stream_sid) = current_sid(&self.stream_sid) else {
            log::debug!("[{}] No stream yet, dropping {} bytes", self.session_id, audio.len());
            return Ok(());
        };
        self.send_command(&TelephonyCommand::Media {
            stream_sid,
            media: OutboundMedia {
                payload: BASE64.encode(audio),
            },
        })
        .await
    }

    /// Only `speaking_complete` has a telephony counterpart (a mark).
    async fn send_control(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let Some(stream_sid) = current_sid(&self.stream_sid) else {
            return Ok(());
        };
        match message {
            OutboundMessage::SpeakingComplete => {
                self.send_command(&TelephonyCommand::Mark {
                    stream_sid,
                    mark: MarkPayload {
                        name: SPEAKING_COMPLETE_MARK.to_string(),
                    },
                })
                .await
            }
            other => {
                log::debug!("[{}] Not forwarded to call: {:?}", self.session_id, other);
                Ok(())
            }
        }
    }

    async fn clear_audio(&self) -> Result<(), TransportError> {
        match current_sid(&self.stream_sid) {
            Some(stream_sid) => self.send_command(&TelephonyCommand::Clear { stream_sid }).await,
            None => Ok(()),
        }
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
    use serde_json::Value;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn next_json(client: &mut WebSocketStream<DuplexStream>) -> Value {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_lifecycle() {
        let (server, mut client) = pair().await;
        let (mut receiver, sender) = split(server, "t");

        // Audio before the stream is known goes nowhere
        sender.send_audio(&[1, 2]).await.unwrap();

        let frames = [
            r#"{"event":"connected","protocol":"Call"}"#.to_string(),
            r#"{"event":"start","start":{"streamSid":"MZ1","callSid":"CA1"}}"#.to_string(),
            r#"{"event":"media","streamSid":"MZ1","media":{"payload":"not base64!","track":"inbound"}}"#.to_string(),
            format!(
                r#"{{"event":"media","streamSid":"MZ1","media":{{"payload":"{}","track":"outbound"}}}}"#,
                BASE64.encode([0u8])
            ),
            format!(
                r#"{{"event":"media","streamSid":"MZ1","media":{{"payload":"{}","track":"inbound"}}}}"#,
                BASE64.encode([7u8, 7, 7])
            ),
            r#"{"event":"whatever"}"#.to_string(),
            r#"{"event":"stop","streamSid":"MZ1"}"#.to_string(),
        ];
        for frame in frames {
            client.send(Message::Text(frame.into())).await.unwrap();
        }

        assert_eq!(
            receiver.receive().await.unwrap(),
            Some(InboundFrame::Control(ControlMessage::CallStarted {
                stream_sid: "MZ1".into(),
                call_sid: Some("CA1".into()),
            }))
        );
        assert_eq!(
            receiver.receive().await.unwrap(),
            Some(InboundFrame::Audio(vec![7, 7, 7]))
        );
        assert_eq!(
            receiver.receive().await.unwrap(),
            Some(InboundFrame::Control(ControlMessage::EndSession))
        );

        sender.send_audio(&[4, 5]).await.unwrap();
        let media = next_json(&mut client).await;
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ1");
        assert_eq!(media["media"]["payload"], BASE64.encode([4u8, 5]));
    }

    #[tokio::test]
    async fn test_clear_and_mark() {
        let (server, mut client) = pair().await;
        let (mut receiver, sender) = split(server, "t");

        client
            .send(Message::Text(
                r#"{"event":"start","streamSid":"MZ9","start":{}}"#.into(),
            ))
            .await
            .unwrap();
        receiver.receive().await.unwrap();

        sender.clear_audio().await.unwrap();
        sender
            .send_control(&OutboundMessage::system("not forwarded"))
            .await
            .unwrap();
        sender.send_control(&OutboundMessage::SpeakingComplete).await.unwrap();

        let clear = next_json(&mut client).await;
        assert_eq!(clear["event"], "clear");
        assert_eq!(clear["streamSid"], "MZ9");

        let mark = next_json(&mut client).await;
        assert_eq!(mark["event"], "mark");
        assert_eq!(mark["mark"]["name"], SPEAKING_COMPLETE_MARK);
    }
}
