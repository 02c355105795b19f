//! 主题树传输的端到端场景：请求/应答、错误应答、重连后订阅重放、认证失败终止

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use hub_client::core::HubError;
use hub_client::things::{ConnectionStatus, ThingMessage, TransportStatus};
use hub_client::transport::pubsub::{BrokerRecord, MemoryBroker, PubSubTransport};
use hub_client::transport::{HubTransport, RequestReply, TransportOptions};

fn transport(broker: &MemoryBroker, client_id: &str) -> PubSubTransport {
    let options =
        TransportOptions::new("mem://broker", client_id).with_timeout(Duration::from_secs(1));
    PubSubTransport::new(options, Arc::new(broker.clone()))
}

fn broker_with(users: &[&str]) -> MemoryBroker {
    let broker = MemoryBroker::new().with_retry_interval(Duration::from_millis(50));
    for u in users {
        broker.add_user(u, "pw");
    }
    broker
}

#[tokio::test]
async fn test_request_reply_between_clients() {
    let broker = broker_with(&["C1", "C2"]);
    let c1 = transport(&broker, "C1");
    let c2 = transport(&broker, "C2");

    let received = Arc::new(Mutex::new(None));
    let r = received.clone();
    c1.set_request_handler(Some(Arc::new(
        move |msg: ThingMessage| -> BoxFuture<'static, RequestReply> {
            *r.lock().unwrap() = Some(msg);
            Box::pin(async move { RequestReply::ok(br#"{"ok":true}"#.to_vec()) })
        },
    )));
    c1.connect_with_password("pw").await.unwrap();
    c1.subscribe("action/agent1/thing1/+/+").await.unwrap();
    c2.connect_with_password("pw").await.unwrap();

    let reply = c2
        .pub_request("action/agent1/thing1/dim/C2", br#"{"level":30}"#)
        .await
        .unwrap();
    assert_eq!(reply, br#"{"ok":true}"#);

    let msg = received.lock().unwrap().clone().unwrap();
    assert_eq!(msg.name, "dim");
    assert_eq!(msg.sender_id, "C2");
    assert_eq!(msg.data, r#"{"level":30}"#);
    assert_eq!(c2.pending_requests(), 0);

    c1.disconnect().await;
    c2.disconnect().await;
}

#[tokio::test]
async fn test_handler_error_is_returned_to_caller() {
    let broker = broker_with(&["C1", "C2"]);
    let c1 = transport(&broker, "C1");
    let c2 = transport(&broker, "C2");

    c1.set_request_handler(Some(Arc::new(
        move |_msg: ThingMessage| -> BoxFuture<'static, RequestReply> {
            Box::pin(async move { RequestReply::error("bad level") })
        },
    )));
    c1.connect_with_password("pw").await.unwrap();
    c1.subscribe("action/agent1/thing1/+/+").await.unwrap();
    c2.connect_with_password("pw").await.unwrap();

    let err = c2
        .pub_request("action/agent1/thing1/dim/C2", br#"{"level":300}"#)
        .await
        .unwrap_err();
    assert_eq!(err, HubError::Handler("bad level".to_string()));
    assert_eq!(err.to_string(), "bad level");

    c1.disconnect().await;
    c2.disconnect().await;
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_reply() {
    let broker = broker_with(&["agent1", "C2"]);
    let agent = transport(&broker, "agent1");
    let c2 = Arc::new(transport(&broker, "C2"));

    // 先到的请求后应答
    agent.set_request_handler(Some(Arc::new(
        move |msg: ThingMessage| -> BoxFuture<'static, RequestReply> {
            Box::pin(async move {
                let delay = if msg.name == "slow" { 200 } else { 10 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                RequestReply::ok(msg.name.into_bytes())
            })
        },
    )));
    agent.connect_with_password("pw").await.unwrap();
    agent.subscribe("action/agent1/+/+/#").await.unwrap();
    c2.connect_with_password("pw").await.unwrap();

    let slow = {
        let c2 = c2.clone();
        tokio::spawn(async move { c2.pub_request("action/agent1/t/slow/C2", b"").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = c2.pub_request("action/agent1/t/fast/C2", b"").await.unwrap();

    assert_eq!(fast, b"fast");
    assert_eq!(slow.await.unwrap().unwrap(), b"slow");

    agent.disconnect().await;
    c2.disconnect().await;
}

#[tokio::test]
async fn test_subscriptions_replayed_before_connected() {
    let broker = broker_with(&["c1"]);
    let t = Arc::new(transport(&broker, "c1"));

    // 每次收到 connected 时记录当时 broker 看到的订阅次数
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let b = broker.clone();
    t.set_connect_handler(Some(Arc::new(move |st: TransportStatus| {
        if st.connection_status == ConnectionStatus::Connected {
            s.lock().unwrap().push((
                b.subscribe_count("c1", "event/a/t/+"),
                b.subscribe_count("c1", "event/b/+/+"),
            ));
        }
    })));

    t.connect_with_password("pw").await.unwrap();
    t.subscribe("event/a/t/+").await.unwrap();
    t.subscribe("event/b/+/+").await.unwrap();

    broker.sever("c1");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(t.status().connection_status, ConnectionStatus::Connected);
    assert_eq!(*seen.lock().unwrap(), vec![(0, 0), (2, 2)]);

    // 重连后 SUBSCRIBE 紧跟在 CONNECT 之后，早于任何发布
    let journal = broker.journal();
    let reconnect = journal
        .iter()
        .rposition(|r| matches!(r, BrokerRecord::Connect { username } if username == "c1"))
        .unwrap();
    let after: Vec<&BrokerRecord> = journal[reconnect + 1..].iter().take(2).collect();
    assert_eq!(
        after,
        vec![
            &BrokerRecord::Subscribe {
                username: "c1".into(),
                filter: "event/a/t/+".into()
            },
            &BrokerRecord::Subscribe {
                username: "c1".into(),
                filter: "event/b/+/+".into()
            },
        ]
    );

    t.disconnect().await;
}

#[tokio::test]
async fn test_unauthorized_stops_reconnecting() {
    let broker = broker_with(&["c1"]);
    let t = transport(&broker, "c1");
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let s = statuses.clone();
    t.set_connect_handler(Some(Arc::new(move |st: TransportStatus| {
        s.lock().unwrap().push(st.connection_status);
    })));

    let err = t.connect_with_password("wrong").await.unwrap_err();
    assert!(err.is_terminal());

    // 至少三倍重试间隔内没有新的连接尝试
    tokio::time::sleep(broker.retry_interval() * 4).await;
    assert_eq!(broker.connect_attempts("c1"), 1);
    assert_eq!(broker.online_sessions(), 0);
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Unauthorized]
    );
    assert_eq!(t.status().connection_status, ConnectionStatus::Unauthorized);
    assert_eq!(
        t.pub_event("event/c1/t/temp/c1", b"1").await,
        Err(HubError::NoConnection)
    );
}

#[tokio::test]
async fn test_binary_event_payload_arrives_unchanged() {
    let broker = broker_with(&["a1", "viewer"]);
    let agent = transport(&broker, "a1");
    let viewer = transport(&broker, "viewer");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    viewer.set_event_handler(Some(Arc::new(move |msg: ThingMessage| {
        let _ = tx.send(msg);
    })));
    agent.connect_with_password("pw").await.unwrap();
    viewer.connect_with_password("pw").await.unwrap();
    viewer.subscribe("event/a1/+/+/#").await.unwrap();

    let raw = [0xff, 0x00, 0x80, 0x41];
    agent.pub_event("event/a1/t/img/a1", &raw).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload(), &raw[..]);
    assert_eq!(msg.text(), None);

    agent.disconnect().await;
    viewer.disconnect().await;
}

#[tokio::test]
async fn test_refused_reconnect_is_terminal() {
    let broker = broker_with(&["c1"]);
    let t = transport(&broker, "c1");
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let s = statuses.clone();
    t.set_connect_handler(Some(Arc::new(move |st: TransportStatus| {
        s.lock().unwrap().push(st.connection_status);
    })));
    t.connect_with_password("pw").await.unwrap();

    // 凭据在线上被吊销，重连时 broker 以 134 拒绝
    broker.add_user("c1", "rotated");
    broker.sever("c1");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(t.status().connection_status, ConnectionStatus::Unauthorized);
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Unauthorized,
        ]
    );
    let attempts = broker.connect_attempts("c1");
    assert_eq!(attempts, 2);
    tokio::time::sleep(broker.retry_interval() * 4).await;
    assert_eq!(broker.connect_attempts("c1"), attempts);
    assert_eq!(broker.online_sessions(), 0);
}
