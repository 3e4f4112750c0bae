//! Bridge protocol and session scenarios

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use attache::bridge::server::reject_non_loopback;
use attache::bridge::{
    parse_command, BridgeSession, CommandKind, ErrorCode, PlatformClient, PlatformEvent,
    SessionConfig, PROTOCOL_VERSION,
};
use attache::Result;

const TOKEN: &str = "integration-secret";

struct RecordingClient {
    sent: std::sync::Mutex<Vec<(String, String, bool)>>,
}

impl RecordingClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, String, bool)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformClient for RecordingClient {
    async fn connect(&self) -> Result<mpsc::Receiver<PlatformEvent>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn send_text(&self, to: &str, text: &str, quoted: Option<&Value>) -> Result<String> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string(), quoted.is_some()));
        Ok(format!("OUT-{}", self.sent.lock().unwrap().len()))
    }

    async fn send_media(
        &self,
        _to: &str,
        _bytes: Vec<u8>,
        _mime: Option<&str>,
        _file: Option<&str>,
        _caption: Option<&str>,
        _quoted: Option<&Value>,
    ) -> Result<String> {
        Ok("OUT-MEDIA".to_string())
    }

    async fn send_poll(&self, _to: &str, _q: &str, _options: &[String], _max: u32) -> Result<String> {
        Ok("OUT-POLL".to_string())
    }

    async fn react(
        &self,
        _chat: &str,
        _id: &str,
        _emoji: &str,
        _participant: Option<&str>,
        _from_me: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn presence(&self, _state: &str, _chat: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn list_groups(&self, _ids: Option<&[String]>) -> Result<Value> {
        Ok(json!([{"jid": "G1@g.us", "subject": "Family"}]))
    }

    async fn mark_read(&self, _chat: &str, _id: &str, _participant: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn download_media(&self, _raw: &Value) -> Result<Vec<u8>> {
        Ok(vec![0xFF])
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    fn self_jids(&self) -> Vec<String> {
        vec!["490000000000@s.whatsapp.net".to_string()]
    }
}

fn session_with(client: Arc<RecordingClient>) -> Arc<BridgeSession> {
    BridgeSession::new(client, SessionConfig::default(), None)
}

fn inbound(chat: &str, id: &str, text: &str) -> Value {
    json!({
        "key": {"remoteJid": chat, "fromMe": false, "id": id},
        "message": {"conversation": text},
        "messageTimestamp": 1_700_000_000,
    })
}

#[test]
fn non_loopback_peer_is_rejected_before_any_dispatch() {
    let lan: SocketAddr = "192.168.1.5:40000".parse().unwrap();
    let rejection = reject_non_loopback(lan, "acct").expect("LAN peers must be rejected");
    assert_eq!(rejection.kind, "error");
    assert_eq!(rejection.payload["code"], "ERR_AUTH");
    assert_eq!(rejection.payload["retryable"], false);
    assert_eq!(rejection.version, PROTOCOL_VERSION);

    let local: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    assert!(reject_non_loopback(local, "acct").is_none());
}

#[test]
fn auth_error_never_leaks_the_token() {
    let raw = json!({
        "version": PROTOCOL_VERSION,
        "type": "send_text",
        "token": "guess",
        "payload": {"to": "x@s.whatsapp.net", "text": "hi"}
    })
    .to_string();
    let err = parse_command(&raw, TOKEN).unwrap_err();
    assert_eq!(err.code, ErrorCode::Auth);
    assert!(!err.message.contains(TOKEN));
}

#[tokio::test]
async fn whatsapp_participant_in_one_to_one() {
    let session = session_with(RecordingClient::new());
    let raw = json!({
        "key": {"remoteJid": "A@s.whatsapp.net", "fromMe": false, "id": "M77"},
        "message": {
            "extendedTextMessage": {
                "text": "look at this",
                "contextInfo": {"participant": "B@lid", "stanzaId": "Q9"}
            }
        },
    });
    let payload = session.process_inbound(&raw).await.unwrap();
    // The quoted author must never be mistaken for the sender.
    assert_eq!(payload["participantJid"], "A@s.whatsapp.net");
    assert_ne!(payload["participantJid"], "B@lid");
}

#[tokio::test]
async fn outbound_reply_uses_the_quote_cache() {
    let client = RecordingClient::new();
    let session = session_with(Arc::clone(&client));

    // Seed the quote cache with an inbound message.
    session
        .process_inbound(&inbound("A@s.whatsapp.net", "M1", "original question"))
        .await
        .unwrap();

    let command = parse_command(
        &json!({
            "version": PROTOCOL_VERSION,
            "type": "send_text",
            "token": TOKEN,
            "requestId": "r1",
            "payload": {
                "to": "A@s.whatsapp.net",
                "text": "answer",
                "replyToMessageId": "M1"
            }
        })
        .to_string(),
        TOKEN,
    )
    .unwrap();

    let response = session.handle_command(&command).await.unwrap();
    assert!(response["messageId"].as_str().unwrap().starts_with("OUT-"));
    let sent = client.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].2, "send should carry the quoted message");

    // Unknown reply ids degrade to a plain send.
    let command = parse_command(
        &json!({
            "version": PROTOCOL_VERSION,
            "type": "send_text",
            "token": TOKEN,
            "payload": {
                "to": "A@s.whatsapp.net",
                "text": "plain",
                "replyToMessageId": "UNKNOWN"
            }
        })
        .to_string(),
        TOKEN,
    )
    .unwrap();
    session.handle_command(&command).await.unwrap();
    assert!(!client.sent()[1].2);
}

#[tokio::test]
async fn outbound_self_echo_is_filtered_on_inbound() {
    let client = RecordingClient::new();
    let session = BridgeSession::new(
        Arc::clone(&client) as Arc<dyn PlatformClient>,
        SessionConfig {
            accept_from_me: true,
            ..SessionConfig::default()
        },
        None,
    );

    let command = parse_command(
        &json!({
            "version": PROTOCOL_VERSION,
            "type": "send_text",
            "token": TOKEN,
            "payload": {"to": "A@s.whatsapp.net", "text": "ping"}
        })
        .to_string(),
        TOKEN,
    )
    .unwrap();
    let response = session.handle_command(&command).await.unwrap();
    let sent_id = response["messageId"].as_str().unwrap().to_string();

    // The platform echoes our own send back.
    let mut echo = inbound("A@s.whatsapp.net", &sent_id, "ping");
    echo["key"]["fromMe"] = json!(true);
    assert!(session.process_inbound(&echo).await.is_none());

    // An external message from the same account is still accepted.
    let mut external = inbound("A@s.whatsapp.net", "PHONE-1", "typed on my phone");
    external["key"]["fromMe"] = json!(true);
    assert!(session.process_inbound(&external).await.is_some());
}

#[tokio::test]
async fn health_command_reports_the_contract_shape() {
    let session = session_with(RecordingClient::new());
    let command = parse_command(
        &json!({
            "version": PROTOCOL_VERSION,
            "type": "health",
            "token": TOKEN,
            "payload": {}
        })
        .to_string(),
        TOKEN,
    )
    .unwrap();
    assert_eq!(command.kind, CommandKind::Health);

    let health = session.handle_command(&command).await.unwrap();
    assert_eq!(health["protocolVersion"], 2);
    for field in [
        "connected",
        "running",
        "reconnectAttempts",
        "droppedInboundDuplicates",
        "dedupeCacheSize",
    ] {
        assert!(
            health["whatsapp"].get(field).is_some(),
            "health.whatsapp.{field} missing"
        );
    }
}

#[tokio::test]
async fn qr_latch_feeds_login_wait() {
    let session = session_with(RecordingClient::new());
    session.latch_qr("QR-DATA-123".to_string());

    let command = parse_command(
        &json!({
            "version": PROTOCOL_VERSION,
            "type": "login_wait",
            "token": TOKEN,
            "payload": {"timeoutMs": 1000}
        })
        .to_string(),
        TOKEN,
    )
    .unwrap();
    let response = session.handle_command(&command).await.unwrap();
    assert_eq!(response["qr"], "QR-DATA-123");
}

#[tokio::test]
async fn list_groups_round_trip() {
    let session = session_with(RecordingClient::new());
    let command = parse_command(
        &json!({
            "version": PROTOCOL_VERSION,
            "type": "list_groups",
            "token": TOKEN,
            "payload": {}
        })
        .to_string(),
        TOKEN,
    )
    .unwrap();
    let response = session.handle_command(&command).await.unwrap();
    assert_eq!(response["groups"][0]["jid"], "G1@g.us");
}
