mod common;

use bytes::Bytes;
use common::{events_until, init_tracing, next_event, MockBroker};
use kafka_lite_client::testing::{fetch_response, message_set, offsets_response, response, WireRequest};
use kafka_lite_client::{
    Client, ClientError, ClientEvent, FetchRequest, OffsetTime, OffsetsRequest, DEFAULT_MAX_SIZE,
};

fn is_last_message(event: &ClientEvent) -> bool {
    matches!(event, ClientEvent::LastMessage { .. })
}

#[tokio::test]
async fn test_fetch_round_trip() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();
    let mut events = client.events();

    client.connect().await.unwrap();
    let mut conn = broker.accept().await;
    client
        .fetch_topic(FetchRequest::new("orders").partition(1).offset(100))
        .unwrap();

    assert_eq!(
        conn.next_request().await,
        WireRequest::Fetch {
            topic: "orders".into(),
            partition: 1,
            offset: 100,
            max_size: DEFAULT_MAX_SIZE as u32,
        }
    );
    conn.reply(&fetch_response(0, &[b"first", b"second"])).await;

    let seen = events_until(&mut events, is_last_message).await;
    let address = broker.address();
    assert_eq!(
        seen,
        vec![
            ClientEvent::Connecting {
                address: address.clone()
            },
            ClientEvent::Connected { address },
            ClientEvent::Message {
                topic: "orders".into(),
                payload: Bytes::from_static(b"first"),
                offset: 114,
            },
            ClientEvent::Message {
                topic: "orders".into(),
                payload: Bytes::from_static(b"second"),
                offset: 129,
            },
            ClientEvent::LastMessage {
                topic: "orders".into(),
                offset: 129,
                code: 0,
                name: "NoError",
            },
        ]
    );
    assert_eq!(client.stats().messages_received, 2);
}

#[tokio::test]
async fn test_response_split_into_small_reads() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();
    let mut events = client.events();

    client.fetch_topic(FetchRequest::new("t")).unwrap();
    let mut conn = broker.accept().await;
    conn.next_request().await;

    let payload = vec![7u8; 300];
    conn.reply_chunked(&fetch_response(0, &[b"a", &payload, b"c"]), 7)
        .await;

    let seen = events_until(&mut events, is_last_message).await;
    let payloads: Vec<Bytes> = seen
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::Message { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(
        payloads,
        vec![
            Bytes::from_static(b"a"),
            Bytes::from(payload),
            Bytes::from_static(b"c")
        ]
    );
}

#[tokio::test]
async fn test_offsets_lookup() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();
    let mut events = client.events();

    client
        .fetch_offsets(OffsetsRequest::new("t").time(OffsetTime::Earliest).max_offsets(2))
        .unwrap();
    let mut conn = broker.accept().await;
    assert_eq!(
        conn.next_request().await,
        WireRequest::Offsets {
            topic: "t".into(),
            partition: 0,
            time: -2,
            max_offsets: 2,
        }
    );
    conn.reply(&offsets_response(0, &[0, 4096])).await;

    let seen = events_until(&mut events, |e| matches!(e, ClientEvent::LastOffset { .. })).await;
    let offsets: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Offset { value, .. } => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![0, 4096]);
    assert!(matches!(
        seen.last(),
        Some(ClientEvent::LastOffset {
            offset: 4096,
            code: 0,
            ..
        })
    ));
}

#[tokio::test]
async fn test_double_connect_fails() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();

    client.connect().await.unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyConnected { .. }));
}

#[tokio::test]
async fn test_size_limited_fetch_continues() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();
    let mut events = client.events();

    client
        .fetch_topic(FetchRequest::new("t").max_size(40))
        .unwrap();
    let mut conn = broker.accept().await;
    conn.next_request().await;

    // 40 bytes: two whole messages and the start of a third
    let set = message_set(&[b"hello", b"world", b"cut-off"]);
    conn.reply(&response(0, &set[..34])).await;

    assert_eq!(
        conn.next_request().await,
        WireRequest::Fetch {
            topic: "t".into(),
            partition: 0,
            offset: 28,
            max_size: 40,
        }
    );
    conn.reply(&fetch_response(0, &[b"cut-off"])).await;

    let seen = events_until(&mut events, is_last_message).await;
    let messages = seen
        .iter()
        .filter(|e| matches!(e, ClientEvent::Message { .. }))
        .count();
    assert_eq!(messages, 3);
    assert!(matches!(
        seen.last(),
        Some(ClientEvent::LastMessage { offset: 44, .. })
    ));
}

#[tokio::test]
async fn test_broker_close_is_reported() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();
    let mut events = client.events();

    client.connect().await.unwrap();
    let conn = broker.accept().await;
    next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    drop(conn);

    let seen = events_until(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await;
    assert!(matches!(seen[0], ClientEvent::Disconnected { .. }));

    // No reconnect policy: connecting again is up to the caller
    client.connect().await.unwrap();
    broker.accept().await;
}

#[tokio::test]
async fn test_disconnect_discards_pending_requests() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();
    let mut events = client.events();

    client.connect().await.unwrap();
    let mut conn = broker.accept().await;
    client.fetch_topic(FetchRequest::new("t")).unwrap();
    conn.next_request().await;

    client.disconnect().unwrap();
    next_event(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await;
    assert!(conn.closed().await);
}

#[tokio::test]
async fn test_fetch_resumes_after_connection_lost_mid_response() {
    init_tracing();
    let broker = MockBroker::bind().await;
    let client = Client::new(broker.config()).unwrap();
    let mut events = client.events();

    client.fetch_topic(FetchRequest::new("t")).unwrap();
    let mut first = broker.accept().await;
    assert_eq!(
        first.next_request().await,
        WireRequest::Fetch {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            max_size: DEFAULT_MAX_SIZE as u32,
        }
    );

    // Header, the whole first message and half of the second
    let full = fetch_response(0, &[b"xyz", b"second"]);
    first.reply(&full[..4 + 2 + 12 + 7]).await;
    next_event(&mut events, |e| matches!(e, ClientEvent::Message { .. })).await;
    drop(first);
    next_event(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await;

    client.connect().await.unwrap();
    let mut second = broker.accept().await;
    assert_eq!(
        second.next_request().await,
        WireRequest::Fetch {
            topic: "t".into(),
            partition: 0,
            offset: 12,
            max_size: DEFAULT_MAX_SIZE as u32,
        }
    );
    second.reply(&fetch_response(0, &[b"second"])).await;

    let seen = events_until(&mut events, is_last_message).await;
    let messages: Vec<_> = seen
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::Message { payload, offset, .. } => Some((payload, offset)),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec![(Bytes::from_static(b"second"), 27)]);
    assert_eq!(client.stats().messages_received, 2);
}
