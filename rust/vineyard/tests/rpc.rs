//! End-to-end calls over TCP.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{RawPeer, start_server};
use vineyard::wire::{MessageType, Packet, PacketHeader};
use vineyard::{
    CallError, Client, Config, Encoding, ErrorKind, Message, Request, Value, args,
};

#[tokio::test]
async fn add_with_opaque_7_returns_5() {
    let server = start_server(Config::default()).await;
    let mut peer = RawPeer::connect(server.local_addr()).await;

    peer.request(
        Encoding::Postcard.as_u8(),
        Request::new("Calc", "add", args![2, 3]).with_opaque(7),
    )
    .await;

    let Message::Response(reply) = peer.next_message().await else {
        panic!("expected a response");
    };
    assert_eq!(reply.header.message_type, MessageType::Response);
    assert_eq!(reply.header.opaque, 7);
    assert_eq!(reply.header.serializer_type, Encoding::Postcard.as_u8());
    assert_eq!(reply.response.opaque, 7);
    assert_eq!(reply.response.result(), Some(&Value::Int(5)));

    server.stop().await;
}

#[tokio::test]
async fn reply_uses_the_request_serializer() {
    let server = start_server(Config::default()).await;
    let mut peer = RawPeer::connect(server.local_addr()).await;

    peer.request(
        Encoding::Json.as_u8(),
        Request::new("Calc", "add", args![1.5, 1]).with_opaque(3),
    )
    .await;

    let Message::Response(reply) = peer.next_message().await else {
        panic!("expected a response");
    };
    assert_eq!(reply.header.serializer_type, Encoding::Json.as_u8());
    assert_eq!(reply.response.result(), Some(&Value::Float(2.5)));
}

#[tokio::test]
async fn bad_magic_closes_only_that_connection() {
    let server = start_server(Config::default()).await;

    let mut peer = RawPeer::connect(server.local_addr()).await;
    let header = PacketHeader {
        magic: 0x99,
        message_type: MessageType::Request,
        serializer_type: Encoding::Postcard.as_u8(),
        opaque: 1,
        body_length: 0,
    };
    // Bypass the local codec, which would stamp the right magic.
    let mut raw = header.to_bytes().to_vec();
    raw.extend_from_slice(&[0u8; 4]);
    raw[7..11].copy_from_slice(&4i32.to_be_bytes());
    tokio::io::AsyncWriteExt::write_all(peer.framed.get_mut(), &raw)
        .await
        .unwrap();

    assert!(peer.next_packet().await.is_none(), "server should close");

    // The server keeps serving everyone else.
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();
    let sum = client.call("Calc", "add", args![2, 3], None).await.unwrap();
    assert_eq!(sum, Value::Int(5));
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let server = start_server(Config {
        max_frame_size: 1024,
        ..Config::default()
    })
    .await;
    let mut peer = RawPeer::connect(server.local_addr()).await;

    let header = PacketHeader {
        magic: vineyard::DEFAULT_MAGIC,
        message_type: MessageType::Request,
        serializer_type: Encoding::Postcard.as_u8(),
        opaque: 1,
        body_length: 0,
    };
    // The local codec has the default 16 MiB limit, so this goes out.
    peer.send_packet(Packet::new(header, Bytes::from(vec![0u8; 4096])))
        .await;
    assert!(peer.next_packet().await.is_none());
}

#[tokio::test]
async fn unknown_bean_leaves_the_connection_usable() {
    let server = start_server(Config::default()).await;
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();

    let err = client
        .call("Nope", "add", args![1, 2], None)
        .await
        .unwrap_err();
    assert_eq!(err.remote().map(|e| e.kind), Some(ErrorKind::UnknownService));

    let sum = client.call("Calc", "add", args![2, 3], None).await.unwrap();
    assert_eq!(sum, Value::Int(5));
    assert_eq!(client.live_connections(), 1);
}

#[tokio::test]
async fn dispatch_errors_come_back_as_remote_errors() {
    let server = start_server(Config::default()).await;
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();

    let err = client
        .call("Calc", "add", args!["a", "b"], None)
        .await
        .unwrap_err();
    assert_eq!(err.remote().map(|e| e.kind), Some(ErrorKind::NoMatchingMethod));

    let err = client
        .call("Calc", "div", args![1, 0], None)
        .await
        .unwrap_err();
    let remote = err.remote().expect("remote error");
    assert_eq!(remote.kind, ErrorKind::ServiceInvocation);
    assert_eq!(remote.message, "division by zero");

    let stats = server.stats().snapshot();
    assert_eq!(stats.calls, 2);
    assert_eq!(stats.failures, 2);
}

#[tokio::test]
async fn unknown_serializer_gets_an_error_reply_in_the_default_serializer() {
    let server = start_server(Config::default()).await;
    let mut peer = RawPeer::connect(server.local_addr()).await;

    let mut packet = peer
        .codec
        .encode(&Message::Request(vineyard::wire::RequestMessage::new(
            vineyard::DEFAULT_MAGIC,
            Encoding::Json.as_u8(),
            Request::new("Calc", "add", args![1, 2]).with_opaque(11),
        )))
        .unwrap();
    packet.header.serializer_type = 77;
    peer.send_packet(packet).await;

    let Message::Response(reply) = peer.next_message().await else {
        panic!("expected a response");
    };
    assert_eq!(reply.header.opaque, 11);
    assert_eq!(reply.header.serializer_type, Encoding::Postcard.as_u8());
    assert_eq!(
        reply.response.error().map(|e| e.kind),
        Some(ErrorKind::UnsupportedSerializer)
    );

    // Still open.
    peer.request(
        Encoding::Postcard.as_u8(),
        Request::new("Calc", "add", args![2, 2]).with_opaque(12),
    )
    .await;
    let Message::Response(reply) = peer.next_message().await else {
        panic!("expected a response");
    };
    assert_eq!(reply.response.result(), Some(&Value::Int(4)));
}

#[tokio::test]
async fn garbage_body_gets_a_serialization_error() {
    let server = start_server(Config::default()).await;
    let mut peer = RawPeer::connect(server.local_addr()).await;

    let header = PacketHeader {
        magic: vineyard::DEFAULT_MAGIC,
        message_type: MessageType::Request,
        serializer_type: Encoding::Json.as_u8(),
        opaque: 21,
        body_length: 0,
    };
    peer.send_packet(Packet::new(header, Bytes::from_static(b"{ not json")))
        .await;

    let Message::Response(reply) = peer.next_message().await else {
        panic!("expected a response");
    };
    assert_eq!(reply.header.opaque, 21);
    assert_eq!(reply.header.serializer_type, Encoding::Json.as_u8());
    assert_eq!(
        reply.response.error().map(|e| e.kind),
        Some(ErrorKind::Serialization)
    );
}

#[tokio::test]
async fn json_clients_round_trip_every_value_kind() {
    let server = start_server(Config::default()).await;
    let config = Config {
        serializer: Encoding::Json.as_u8(),
        ..Config::default()
    };
    let client = Client::connect([server.local_addr()], config).await.unwrap();

    let value = Value::List(vec![
        Value::Null,
        Value::Bool(true),
        Value::Int(-4),
        Value::Float(0.25),
        Value::Str("vine".into()),
        Value::Bytes(vec![0, 255]),
    ]);
    let echoed = client
        .call("Calc", "echo", vec![value.clone()], None)
        .await
        .unwrap();
    assert_eq!(echoed, value);
}

#[tokio::test]
async fn non_finite_floats_cross_both_serializers() {
    let server = start_server(Config::default()).await;

    for encoding in [Encoding::Postcard, Encoding::Json] {
        let config = Config {
            serializer: encoding.as_u8(),
            ..Config::default()
        };
        let client = Client::connect([server.local_addr()], config).await.unwrap();

        for x in [f64::INFINITY, f64::NEG_INFINITY] {
            let echoed = client
                .call("Calc", "echo", args![x], None)
                .await
                .unwrap_or_else(|e| panic!("{encoding}: {e}"));
            assert_eq!(echoed, Value::Float(x), "{encoding}");
        }
        let echoed = client
            .call("Calc", "echo", args![f64::NAN], None)
            .await
            .unwrap_or_else(|e| panic!("{encoding}: {e}"));
        assert!(matches!(echoed, Value::Float(x) if x.is_nan()), "{encoding}: {echoed:?}");

        // Overflowing float arithmetic comes back as infinity, not an error.
        let sum = client
            .call("Calc", "add", args![f64::MAX, f64::MAX], None)
            .await
            .unwrap();
        assert_eq!(sum, Value::Float(f64::INFINITY), "{encoding}");

        client.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_on_one_connection_each_get_their_own_answer() {
    let server = start_server(Config::default()).await;
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();

    let calls = (0..64i64).map(|i| {
        let client = &client;
        async move {
            let sum = client.call("Calc", "add", args![i, 1000], None).await;
            (i, sum)
        }
    });
    for (i, sum) in futures_util::future::join_all(calls).await {
        assert_eq!(sum.unwrap(), Value::Int(i + 1000));
    }
    assert_eq!(client.stats().snapshot().successes, 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_requests_past_the_worker_limit_are_all_answered() {
    let server = start_server(Config {
        max_concurrent_dispatch: 1,
        ..Config::default()
    })
    .await;
    let mut peer = RawPeer::connect(server.local_addr()).await;

    for opaque in 1..=10 {
        peer.request(
            Encoding::Postcard.as_u8(),
            Request::new("Calc", "sleep", args![20]).with_opaque(opaque),
        )
        .await;
    }

    let mut answered = Vec::new();
    for _ in 0..10 {
        let Message::Response(reply) = peer.next_message().await else {
            panic!("expected a response");
        };
        assert_eq!(reply.response.result(), Some(&Value::Int(20)));
        answered.push(reply.response.opaque);
    }
    answered.sort_unstable();
    assert_eq!(answered, (1..=10).collect::<Vec<i32>>());
    assert_eq!(server.stats().snapshot().successes, 10);

    server.stop().await;
}

#[tokio::test]
async fn concurrent_sends_use_distinct_opaques() {
    let server = start_server(Config::default()).await;
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16i64 {
        let handle = client
            .send(Request::new("Calc", "add", args![i, i]), None)
            .await
            .unwrap();
        handles.push((i, handle));
    }
    let mut opaques: Vec<i32> = handles.iter().map(|(_, h)| h.opaque()).collect();
    opaques.sort_unstable();
    opaques.dedup();
    assert_eq!(opaques.len(), 16);

    for (i, handle) in handles {
        let opaque = handle.opaque();
        let response = handle.wait().await.unwrap();
        assert_eq!(response.opaque, opaque);
        assert_eq!(response.result(), Some(&Value::Int(2 * i)));
    }
}

#[tokio::test]
async fn timed_out_call_fails_and_late_response_is_discarded() {
    let server = start_server(Config::default()).await;
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();

    let err = client
        .call("Calc", "sleep", args![300], Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout { .. }), "got {err:?}");

    // Let the late response arrive; it must not disturb later calls.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let sum = client.call("Calc", "add", args![2, 3], None).await.unwrap();
    assert_eq!(sum, Value::Int(5));
    assert_eq!(client.stats().snapshot().timeouts, 1);
}

#[tokio::test]
async fn unbounded_timeout_is_clamped_not_fatal() {
    let server = start_server(Config::default()).await;
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();

    let sum = client
        .call("Calc", "add", args![1, 2], Some(Duration::MAX))
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(3));

    let handle = client
        .send(Request::new("Calc", "add", args![2, 2]), Some(Duration::MAX))
        .await
        .unwrap();
    assert_eq!(handle.timeout(), vineyard::MAX_CALL_TIMEOUT);
    assert_eq!(handle.wait().await.unwrap().result(), Some(&Value::Int(4)));
}

#[tokio::test]
async fn stop_drains_in_flight_calls() {
    let server = start_server(Config::default()).await;
    let addr = server.local_addr();
    let client = Client::connect([addr], Config::default()).await.unwrap();

    let slow = tokio::spawn(async move {
        let result = client.call("Calc", "sleep", args![200], None).await;
        (client, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop().await;

    let (client, result) = slow.await.unwrap();
    assert_eq!(result.unwrap(), Value::Int(200));

    // Nothing is listening any more.
    let err = client.call("Calc", "add", args![1, 1], None).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::NoConnection | CallError::ConnectionClosed
    ));
    assert!(Client::connect([addr], Config::default()).await.is_err());
}

#[tokio::test]
async fn close_fails_pending_calls() {
    let server = start_server(Config::default()).await;
    let client = Client::connect([server.local_addr()], Config::default())
        .await
        .unwrap();

    let handle = client
        .send(Request::new("Calc", "sleep", args![500]), None)
        .await
        .unwrap();
    client.close().await;
    assert!(matches!(
        handle.wait().await,
        Err(CallError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn connect_skips_unreachable_addresses() {
    let server = start_server(Config::default()).await;

    // Bind and drop a listener to get a port nobody is listening on.
    let dead = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let client = Client::connect([dead, server.local_addr()], Config::default())
        .await
        .unwrap();
    assert_eq!(client.live_connections(), 1);
    assert_eq!(
        client.call("Calc", "add", args![1, 2], None).await.unwrap(),
        Value::Int(3)
    );

    let err = Client::connect([dead], Config::default()).await.unwrap_err();
    assert!(matches!(err, CallError::Io(_)));
}

#[tokio::test]
async fn calls_are_spread_round_robin() {
    let a = start_server(Config::default()).await;
    let b = start_server(Config::default()).await;
    let client = Client::connect([a.local_addr(), b.local_addr()], Config::default())
        .await
        .unwrap();

    for i in 0..10i64 {
        client.call("Calc", "add", args![i, i], None).await.unwrap();
    }
    assert_eq!(a.stats().snapshot().calls, 5);
    assert_eq!(b.stats().snapshot().calls, 5);

    let on_b = client
        .call_on(b.local_addr(), "Calc", "add", args![1, 1], None)
        .await
        .unwrap();
    assert_eq!(on_b, Value::Int(2));
    assert_eq!(b.stats().snapshot().calls, 6);
}

#[tokio::test]
async fn one_shot_call_helper() {
    let server = start_server(Config::default()).await;
    let sum = vineyard::call(server.local_addr(), "Calc", "add", args![40, 2], None)
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(42));
}
