mod common;

use common::{FakeGenerator, FakeStt, FakeTts, RecordingSink};
use futures_util::{SinkExt, StreamExt};
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use voice_dialogue_rs::config::EngineConfig;
use voice_dialogue_rs::generation::ContentGenerator;
use voice_dialogue_rs::manager::SessionServices;
use voice_dialogue_rs::protocol::OutboundMessage;
use voice_dialogue_rs::registry::{SessionRegistry, TransportKind};
use voice_dialogue_rs::server::{ServerConfig, SessionFactory, VoiceServer};
use voice_dialogue_rs::sink::TranscriptSink;
use voice_dialogue_rs::stt::SttClient;
use voice_dialogue_rs::tts::SpeechSynthesizer;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct FakeFactory;

impl SessionFactory for FakeFactory {
    fn stt(&self, _kind: TransportKind) -> Box<dyn SttClient> {
        let (stt, _state, _events) = FakeStt::new(0);
        Box::new(stt)
    }

    fn tts(&self, _kind: TransportKind) -> Arc<dyn SpeechSynthesizer> {
        Arc::new(FakeTts::new(2, Duration::from_millis(10)))
    }

    fn services(&self) -> SessionServices {
        SessionServices::new(
            Arc::new(FakeGenerator::new(Duration::from_millis(10))) as Arc<dyn ContentGenerator>,
            Arc::new(RecordingSink::default()) as Arc<dyn TranscriptSink>,
            Some(1),
        )
    }
}

struct RunningServer {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<voice_dialogue_rs::Result<()>>,
}

async fn start_server(max_sessions: usize) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_address: addr.to_string(),
        engine: EngineConfig {
            max_sessions,
            ..EngineConfig::default()
        },
        ..ServerConfig::default()
    };
    let server = VoiceServer::new(config, Arc::new(FakeFactory));
    let registry = server.registry();
    let (shutdown, signal) = oneshot::channel();
    let task = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = signal.await;
            })
            .await
    });
    RunningServer {
        addr,
        registry,
        shutdown,
        task,
    }
}

async fn next_outbound(client: &mut Client) -> Option<OutboundMessage> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("server went quiet")?;
        match message.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn wait_for_sessions(registry: &SessionRegistry, count: usize) {
    for _ in 0..200 {
        if registry.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} sessions, have {}", count, registry.len());
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_unknown_path_is_rejected() {
    let server = start_server(4).await;

    let result = connect_async(format!("ws://{}/nope", server.addr)).await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected a 404 rejection, got {:?}", other.map(|_| ())),
    }
    assert!(server.registry.is_empty());

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_raw_session_lifecycle() {
    let server = start_server(4).await;

    let (mut client, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    wait_for_sessions(&server.registry, 1).await;
    let id = server.registry.session_ids().remove(0);
    assert_eq!(
        server.registry.get(&id).map(|info| info.kind),
        Some(TransportKind::Raw)
    );

    client
        .send(Message::Text(r#"{"type":"auth","user_id":"u-1"}"#.into()))
        .await
        .unwrap();
    loop {
        match next_outbound(&mut client).await {
            Some(OutboundMessage::System { message }) if message == "authenticated" => break,
            Some(_) => continue,
            None => panic!("connection closed before auth reply"),
        }
    }

    // Server shutdown ends the session and closes the socket.
    server.shutdown.send(()).unwrap();
    while next_outbound(&mut client).await.is_some() {}
    server.task.await.unwrap().unwrap();
    assert!(server.registry.is_empty());
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_capacity_is_enforced() {
    let server = start_server(1).await;

    let (_first, _) = connect_async(format!("ws://{}/media-stream", server.addr))
        .await
        .unwrap();
    wait_for_sessions(&server.registry, 1).await;

    let (mut second, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    match next_outbound(&mut second).await {
        Some(OutboundMessage::Error { message }) => assert!(message.contains("Max sessions")),
        other => panic!("expected capacity error, got {:?}", other),
    }
    assert!(next_outbound(&mut second).await.is_none());
    assert_eq!(server.registry.len(), 1);

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap().unwrap();
    assert!(server.registry.is_empty());
}
