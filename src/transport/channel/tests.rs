use super::*;
use bytes::Bytes;
use futures::StreamExt;

fn message(subject: &str, body: &'static [u8]) -> OutboundMessage {
    OutboundMessage::new(subject, Bytes::from_static(body))
}

async fn next(stream: &mut MessageStream) -> Option<InboundMessage> {
    tokio::time::timeout(Duration::from_millis(100), stream.next())
        .await
        .ok()
        .flatten()
}

#[test]
fn test_subject_matches_exact() {
    assert!(subject_matches("v1.greeter.greet", "v1.greeter.greet"));
    assert!(!subject_matches("v1.greeter.greet", "v1.greeter.wave"));
    assert!(!subject_matches("v1.greeter", "v1.greeter.greet"));
}

#[test]
fn test_subject_matches_single_token_wildcard() {
    assert!(subject_matches("v1.*.greet", "v1.greeter.greet"));
    assert!(!subject_matches("v1.*", "v1.greeter.greet"));
}

#[test]
fn test_subject_matches_tail_wildcard() {
    assert!(subject_matches("v1.>", "v1.greeter.greet"));
    assert!(subject_matches("v1.>", "v1.orders"));
    assert!(!subject_matches("v1.>", "v1")); // needs at least one token
    assert!(!subject_matches("v1.>.x", "v1.a.x")); // only valid as last token
}

#[tokio::test]
async fn test_publish_no_subscribers() {
    let server = ChannelServer::new();
    let transport = server.connect().unwrap();

    // Fire-and-forget must not fail with nobody listening
    let result = transport
        .publish(message("v1.orders.order_created", br#"{"id":"123"}"#))
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_plain_subscribers_all_receive() {
    let server = ChannelServer::new();
    let a = server.connect().unwrap();
    let b = server.connect().unwrap();

    let mut sub_a = a.subscribe("events.>", None).await.unwrap();
    let mut sub_b = b.subscribe("events.created", None).await.unwrap();

    a.publish(message("events.created", b"1")).await.unwrap();

    assert_eq!(next(&mut sub_a).await.unwrap().payload, Bytes::from_static(b"1"));
    assert_eq!(next(&mut sub_b).await.unwrap().payload, Bytes::from_static(b"1"));
}

#[tokio::test]
async fn test_queue_group_delivers_to_one_member() {
    let server = ChannelServer::new();
    let transport = server.connect().unwrap();

    let mut first = transport.subscribe("work", Some("workers")).await.unwrap();
    let mut second = transport.subscribe("work", Some("workers")).await.unwrap();

    for _ in 0..4 {
        transport.publish(message("work", b"job")).await.unwrap();
    }

    let mut first_count = 0;
    while next(&mut first).await.is_some() {
        first_count += 1;
    }
    let mut second_count = 0;
    while next(&mut second).await.is_some() {
        second_count += 1;
    }

    assert_eq!(first_count + second_count, 4);
    // Round-robin spreads the work
    assert_eq!(first_count, 2);
    assert_eq!(second_count, 2);
}

#[tokio::test]
async fn test_dropped_stream_unsubscribes() {
    let server = ChannelServer::new();
    let transport = server.connect().unwrap();

    let stream = transport.subscribe("work", None).await.unwrap();
    assert_eq!(server.subscription_count(), 1);

    drop(stream);
    assert_eq!(server.subscription_count(), 0);
}

#[tokio::test]
async fn test_request_reply() {
    let server = ChannelServer::new();
    let transport = Arc::new(server.connect().unwrap());

    let mut requests = transport.subscribe("echo", None).await.unwrap();
    let responder = transport.clone();
    tokio::spawn(async move {
        while let Some(msg) = requests.next().await {
            let reply = msg.reply.clone().unwrap();
            responder
                .publish(OutboundMessage::new(reply, msg.payload.clone()))
                .await
                .unwrap();
        }
    });

    let reply = transport
        .request(message("echo", b"ping"), Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"ping"));
}

#[tokio::test]
async fn test_request_no_responders() {
    let server = ChannelServer::new();
    let transport = server.connect().unwrap();

    let result = transport
        .request(message("nobody.home", b"{}"), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(BrokerError::NoResponders(_))));
}

#[tokio::test]
async fn test_request_timeout() {
    let server = ChannelServer::new();
    let transport = server.connect().unwrap();

    // Subscriber that never answers
    let _silent = transport.subscribe("slow", None).await.unwrap();

    let result = transport
        .request(message("slow", b"{}"), Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(BrokerError::Timeout { .. })));
}

#[tokio::test]
async fn test_headers_and_reply_are_delivered() {
    let server = ChannelServer::new();
    let transport = server.connect().unwrap();
    let mut stream = transport.subscribe("audit", None).await.unwrap();

    let mut headers = crate::transport::Headers::new();
    headers.insert("Correlation-Id".to_string(), "abc".to_string());
    transport
        .publish(
            message("audit", b"{}")
                .with_reply(Some("replies".to_string()))
                .with_headers(Some(headers)),
        )
        .await
        .unwrap();

    let received = next(&mut stream).await.unwrap();
    assert_eq!(received.reply.as_deref(), Some("replies"));
    assert_eq!(received.header("Correlation-Id"), Some("abc"));
}

#[tokio::test]
async fn test_close_ends_streams_and_rejects_publish() {
    let server = ChannelServer::new();
    let transport = server.connect().unwrap();
    let mut stream = transport.subscribe("work", None).await.unwrap();

    transport.close().await.unwrap();

    assert!(stream.next().await.is_none());
    assert!(matches!(
        transport.publish(message("work", b"{}")).await,
        Err(BrokerError::Connection(_))
    ));
}

#[tokio::test]
async fn test_unreachable_server() {
    let server = ChannelServer::new();
    server.set_reachable(false);
    assert!(matches!(server.connect(), Err(BrokerError::Connection(_))));

    server.set_reachable(true);
    assert!(server.connect().is_ok());
}
