//! 主题（subject）树传输：原生请求/应答、错误应答、队列组、流消费与令牌认证

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use hub_client::core::HubError;
use hub_client::things::{ConnectionStatus, ThingMessage};
use hub_client::transport::subject::{MemorySubjectServer, SubjectTransport};
use hub_client::transport::{HubTransport, KeyPair, RequestReply, TransportOptions};

/// 测试密钥对：签名为 nonce 逐字节加上私钥首字节
struct ShiftKeyPair {
    seed: u8,
}

impl KeyPair for ShiftKeyPair {
    fn public_key(&self) -> String {
        format!("UKEY{}", self.seed)
    }

    fn sign(&self, nonce: &[u8]) -> Vec<u8> {
        nonce.iter().map(|b| b.wrapping_add(self.seed)).collect()
    }

    fn verify(&self, nonce: &[u8], signature: &[u8]) -> bool {
        self.sign(nonce) == signature
    }

    fn export_private(&self) -> String {
        format!("SKEY{}", self.seed)
    }
}

// {"alg":"none"}.{"sub":"c1"}.sig
const JWT: &str = "eyJhbGciOiJub25lIn0.eyJzdWIiOiJjMSJ9.c2ln";

fn transport(server: &MemorySubjectServer, client_id: &str) -> SubjectTransport {
    let options =
        TransportOptions::new("nats://mem", client_id).with_timeout(Duration::from_secs(1));
    SubjectTransport::new(options, Arc::new(server.clone()))
}

fn echo_handler(prefix: &'static str) -> hub_client::transport::RequestHandler {
    Arc::new(move |msg: ThingMessage| -> BoxFuture<'static, RequestReply> {
        Box::pin(async move { RequestReply::ok(format!("{}{}", prefix, msg.data).into_bytes()) })
    })
}

#[tokio::test]
async fn test_native_request_reply() {
    let server = MemorySubjectServer::new();
    server.add_user("agent1", "pw");
    server.add_user("c2", "pw");
    let agent = transport(&server, "agent1");
    let consumer = transport(&server, "c2");

    agent.set_request_handler(Some(echo_handler("ok:")));
    agent.connect_with_password("pw").await.unwrap();
    agent.subscribe("action.agent1.*.*.>").await.unwrap();
    consumer.connect_with_password("pw").await.unwrap();

    let reply = consumer
        .pub_request("action.agent1.thing1.dim.c2", b"30")
        .await
        .unwrap();
    assert_eq!(reply, b"ok:30");

    agent.disconnect().await;
    consumer.disconnect().await;
}

#[tokio::test]
async fn test_error_replies() {
    let server = MemorySubjectServer::new();
    server.add_user("agent1", "pw");
    server.add_user("c2", "pw");
    let agent = transport(&server, "agent1");
    let consumer = transport(&server, "c2");

    agent.set_request_handler(Some(Arc::new(
        move |msg: ThingMessage| -> BoxFuture<'static, RequestReply> {
            Box::pin(async move {
                match msg.name.as_str() {
                    // 错误放在应答头
                    "dim" => RequestReply::error("bad level"),
                    // 错误编码在负载
                    _ => RequestReply::ok(br#"{"error":"unknown action"}"#.to_vec()),
                }
            })
        },
    )));
    agent.connect_with_password("pw").await.unwrap();
    agent.subscribe("action.agent1.*.*.>").await.unwrap();
    consumer.connect_with_password("pw").await.unwrap();

    let err = consumer
        .pub_request("action.agent1.thing1.dim.c2", b"300")
        .await
        .unwrap_err();
    assert_eq!(err, HubError::Handler("bad level".into()));

    let err = consumer
        .pub_request("action.agent1.thing1.blink.c2", b"")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown action");

    // 无人订阅
    assert!(consumer
        .pub_request("action.nobody.thing1.dim.c2", b"")
        .await
        .is_err());

    agent.disconnect().await;
    consumer.disconnect().await;
}

#[tokio::test]
async fn test_queue_group_spreads_requests() {
    let server = MemorySubjectServer::new();
    for id in ["svc", "c2"] {
        server.add_user(id, "pw");
    }
    let counts = [Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))];
    let mut members = Vec::new();
    for count in &counts {
        let t = transport(&server, "svc");
        let count = count.clone();
        t.set_request_handler(Some(Arc::new(
            move |_msg: ThingMessage| -> BoxFuture<'static, RequestReply> {
                count.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { RequestReply::ok(b"done".to_vec()) })
            },
        )));
        t.connect_with_password("pw").await.unwrap();
        t.subscribe_group("rpc.svc.*.*.>", "svc-workers").await.unwrap();
        members.push(t);
    }
    let consumer = transport(&server, "c2");
    consumer.connect_with_password("pw").await.unwrap();

    for _ in 0..4 {
        consumer.pub_request("rpc.svc.store.read.c2", b"{}").await.unwrap();
    }
    assert_eq!(counts[0].load(Ordering::SeqCst) + counts[1].load(Ordering::SeqCst), 4);
    assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) > 0));
}

#[tokio::test]
async fn test_stream_receives_latest_per_subject() {
    let server = MemorySubjectServer::new();
    server.add_user("agent1", "pw");
    server.add_user("viewer", "pw");
    server.add_stream("things", &["event.>"]);

    let agent = transport(&server, "agent1");
    agent.connect_with_password("pw").await.unwrap();
    for (name, value) in [("temp", "20"), ("temp", "21"), ("humidity", "40")] {
        let addr = format!("event.agent1.thing1.{}.agent1", name);
        agent.pub_event(&addr, value.as_bytes()).await.unwrap();
    }

    let viewer = transport(&server, "viewer");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    viewer.set_event_handler(Some(Arc::new(move |msg: ThingMessage| {
        let _ = tx.send(msg);
    })));
    viewer.connect_with_password("pw").await.unwrap();
    let sub = viewer.sub_stream("things", true).await.unwrap();
    assert_eq!(sub.stream(), "things");

    let mut latest = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.created_msec > 0);
        latest.push((msg.name, msg.data.to_string()));
    }
    latest.sort();
    assert_eq!(
        latest,
        vec![("humidity".to_string(), "40".to_string()), ("temp".to_string(), "21".to_string())]
    );

    // 新消息继续送达
    agent.pub_event("event.agent1.thing1.temp.agent1", b"22").await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.data, "22");

    sub.unsubscribe();
    assert!(!sub.is_active());
}

#[tokio::test]
async fn test_stream_new_only_skips_history() {
    let server = MemorySubjectServer::new();
    server.add_user("agent1", "pw");
    server.add_user("viewer", "pw");
    server.add_stream("things", &["event.>"]);

    let agent = transport(&server, "agent1");
    agent.connect_with_password("pw").await.unwrap();
    agent.pub_event("event.agent1.thing1.temp.agent1", b"20").await.unwrap();

    let viewer = transport(&server, "viewer");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    viewer.set_event_handler(Some(Arc::new(move |msg: ThingMessage| {
        let _ = tx.send(msg);
    })));
    viewer.connect_with_password("pw").await.unwrap();
    let sub = viewer.sub_stream("things", false).await.unwrap();

    // 订阅前的历史消息不会送达
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
        .await
        .is_err());

    agent.pub_event("event.agent1.thing1.temp.agent1", b"21").await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.data, "21");
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .is_err());

    sub.unsubscribe();
    agent.disconnect().await;
    viewer.disconnect().await;
}

#[tokio::test]
async fn test_token_authentication() {
    let server = MemorySubjectServer::new();
    server.add_jwt(JWT);
    let key = Arc::new(ShiftKeyPair { seed: 7 });
    server.add_nkey(key.clone());

    let with_jwt = transport(&server, "c1");
    with_jwt.connect_with_token(None, JWT).await.unwrap();
    assert_eq!(with_jwt.status().connection_status, ConnectionStatus::Connected);

    let with_key = transport(&server, "c2");
    with_key.connect_with_token(Some(key), "not-a-jwt").await.unwrap();
    assert_eq!(with_key.status().connection_status, ConnectionStatus::Connected);

    let stranger = transport(&server, "c3");
    let err = stranger
        .connect_with_token(Some(Arc::new(ShiftKeyPair { seed: 9 })), "not-a-jwt")
        .await
        .unwrap_err();
    assert!(err.is_terminal());
    assert_eq!(stranger.status().connection_status, ConnectionStatus::Unauthorized);

    with_jwt.disconnect().await;
    with_key.disconnect().await;
}
