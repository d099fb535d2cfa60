//! End-to-end tests over real loopback sockets: two universes, stream
//! discovery, packet fan-out, channel selection and RPC.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use beyond_protocol::stream::PacketEvent;
use beyond_protocol::{
    Channel, ChannelSet, Codec, DataPacket, Error, NodeState, PropertyValue, StreamPacket,
    StreamProperty, Universe,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn collector() -> (
    Arc<Mutex<Vec<PacketEvent>>>,
    Box<dyn Fn(&PacketEvent) -> bool + Send + Sync>,
) {
    let store: Arc<Mutex<Vec<PacketEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&store);
    (
        store,
        Box::new(move |ev| {
            sink.lock().push(ev.clone());
            true
        }),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn produce_and_consume_across_tcp() {
    init_logging();
    let server = Universe::new();
    let addr = server.listen("tcp://127.0.0.1:0").await.expect("listen");

    let producer = server.create_stream("ftl://camera").expect("create");
    assert!(producer.begin().await);

    let client = Universe::new();
    let peer = client
        .connect_node(&format!("tcp://{addr}"))
        .await
        .expect("connect");
    assert!(peer.wait_connection(Duration::from_secs(5)).await);

    let consumer = client.get_stream("ftl://camera").await.expect("get");
    let (received, cb) = collector();
    let _sub = consumer.on_packet(cb);
    assert!(consumer.begin().await);

    // Wait for the subscription to land producer-side.
    assert!(
        wait_until(|| {
            producer.property(StreamProperty::Observers) == Some(PropertyValue::Int(1))
        })
        .await
    );

    for frame in 0..10u32 {
        let spkt = StreamPacket::new(1000 + i64::from(frame), 0, frame, Channel::COLOUR);
        let pkt = DataPacket::new(Codec::Jpg, Bytes::from(format!("frame-{frame}")));
        assert!(producer.post(spkt, pkt).await);
    }

    assert!(wait_until(|| received.lock().len() == 10).await);
    let got = received.lock().clone();
    for (i, ev) in got.iter().enumerate() {
        assert_eq!(ev.spkt.frame_number, i as u32);
        assert_eq!(ev.pkt.data, Bytes::from(format!("frame-{i}")));
        assert!(ev.spkt.local_timestamp > 0);
    }
    assert!(
        consumer
            .available(0)
            .expect("frameset 0")
            .contains(Channel::COLOUR)
    );

    client.reset().await;
    server.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_selection_reaches_the_producer() {
    init_logging();
    let server = Universe::new();
    let addr = server.listen("tcp://127.0.0.1:0").await.expect("listen");
    let producer = server.create_stream("ftl://rig").expect("create");
    assert!(producer.begin().await);

    let client = Universe::new();
    client
        .connect_node(&format!("tcp://{addr}"))
        .await
        .expect("connect");

    let consumer = client.get_stream("ftl://rig").await.expect("get");
    consumer
        .select(0, ChannelSet::from_iter([Channel::DEPTH]))
        .expect("select");
    let (received, cb) = collector();
    let _sub = consumer.on_packet(cb);
    assert!(consumer.begin().await);

    // The selection travels with the subscription.
    assert!(
        wait_until(|| producer.selected_no_except(0).contains(Channel::DEPTH)).await
    );

    for ts in 0..5i64 {
        let colour = StreamPacket::new(2000 + ts, 0, 0, Channel::COLOUR);
        let depth = StreamPacket::new(2000 + ts, 0, 0, Channel::DEPTH);
        producer
            .post(colour, DataPacket::new(Codec::Jpg, Bytes::from_static(b"c")))
            .await;
        producer
            .post(depth, DataPacket::new(Codec::Raw, Bytes::from_static(b"d")))
            .await;
    }

    assert!(wait_until(|| received.lock().len() >= 5).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let got = received.lock().clone();
    assert!(got.iter().all(|ev| ev.spkt.channel == Channel::DEPTH));
    // The producer never sent the unselected channel, but still knows it
    // exists locally.
    assert!(
        producer
            .available(0)
            .expect("frameset 0")
            .contains(Channel::COLOUR)
    );

    client.reset().await;
    server.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_round_trip() {
    init_logging();
    let server = Universe::new();
    let addr = server.listen("tcp://127.0.0.1:0").await.expect("listen");
    server.bind("add", |body| {
        let args: (i64, i64) =
            serde_json::from_slice(&body).map_err(|e| e.to_string())?;
        let sum = args.0 + args.1;
        serde_json::to_vec(&sum)
            .map(Bytes::from)
            .map_err(|e| e.to_string())
    });

    let client = Universe::new();
    let peer = client
        .connect_node(&format!("tcp://{addr}"))
        .await
        .expect("connect");

    let sum: i64 = peer.call("add", &(19i64, 23i64)).await.expect("call");
    assert_eq!(sum, 42);

    // Unbound names come back as an error response.
    let missing: Result<i64, Error> = peer.call("no_such_rpc", &()).await;
    assert!(missing.is_err());

    client.reset().await;
    server.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_peers_interoperate() {
    init_logging();
    let server = Universe::new();
    let addr = server.listen("ws://127.0.0.1:0").await.expect("listen");
    server.bind("echo", |body| Ok(body));

    let client = Universe::new();
    let peer = client
        .connect_node(&format!("ws://{addr}"))
        .await
        .expect("connect over websocket");
    assert!(peer.wait_connection(Duration::from_secs(5)).await);

    let echoed: String = peer.call("echo", &"hello".to_owned()).await.expect("call");
    assert_eq!(echoed, "hello");

    client.reset().await;
    server.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connecting_to_yourself_is_refused() {
    init_logging();
    let node = Universe::new();
    let addr = node.listen("tcp://127.0.0.1:0").await.expect("listen");

    let result = node.connect_node(&format!("tcp://{addr}")).await;
    assert!(matches!(result, Err(Error::SelfConnect)));

    node.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_uri_bookkeeping() {
    init_logging();
    let node = Universe::new();

    node.create_stream("ftl://unique").expect("first create");
    assert!(matches!(
        node.create_stream("ftl://unique"),
        Err(Error::UriAlreadyExists(_))
    ));

    // Nobody advertises this and there are no peers to ask.
    let missing = node.get_stream("ftl://nowhere").await;
    assert!(matches!(missing, Err(Error::UriDoesNotExist(_))));

    assert!(matches!(
        node.create_stream("device://cam0"),
        Err(Error::BadUri(_))
    ));

    node.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_connections_reconnect_and_replay_registrations() {
    init_logging();
    let server = Universe::new();
    let addr = server.listen("tcp://127.0.0.1:0").await.expect("listen");
    let producer = server.create_stream("ftl://live").expect("create");
    assert!(producer.begin().await);

    let client = Universe::new();
    let peer = client
        .connect_node(&format!("tcp://{addr}"))
        .await
        .expect("connect");
    assert!(peer.wait_connection(Duration::from_secs(5)).await);
    let consumer = client.get_stream("ftl://live").await.expect("get");
    assert!(consumer.begin().await);
    assert!(
        wait_until(|| {
            producer.property(StreamProperty::Observers) == Some(PropertyValue::Int(1))
        })
        .await
    );

    // Sever the connection from the server side; the listener stays up.
    for remote in server.peers() {
        remote.close();
    }
    assert!(wait_until(|| !peer.is_connected()).await);

    // Backoff brings the peer back, and the registration replay on the new
    // handshake re-subscribes the waiting consumer.
    assert!(peer.wait_connection(Duration::from_secs(10)).await);
    assert!(
        wait_until(|| {
            producer.property(StreamProperty::Observers) == Some(PropertyValue::Int(1))
        })
        .await
    );

    client.reset().await;
    server.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_joins_peer_teardown() {
    init_logging();
    let server = Universe::new();
    let addr = server.listen("tcp://127.0.0.1:0").await.expect("listen");

    let client = Universe::new();
    let peer = client
        .connect_node(&format!("tcp://{addr}"))
        .await
        .expect("connect");
    assert!(peer.wait_connection(Duration::from_secs(5)).await);

    // By the time reset returns the I/O task has fully wound down; no
    // connection event can fire afterwards.
    client.reset().await;
    assert_eq!(peer.state(), NodeState::Disconnected);
    assert_eq!(client.peer_count(), 0);

    server.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_fires_and_streams_detach() {
    init_logging();
    let server = Universe::new();
    let addr = server.listen("tcp://127.0.0.1:0").await.expect("listen");
    let producer = server.create_stream("ftl://feed").expect("create");
    assert!(producer.begin().await);

    let disconnects = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&disconnects);
    let _watch = server.on_disconnect(move |_| {
        *counter.lock() += 1;
        true
    });

    let client = Universe::new();
    client
        .connect_node(&format!("tcp://{addr}"))
        .await
        .expect("connect");
    let consumer = client.get_stream("ftl://feed").await.expect("get");
    assert!(consumer.begin().await);
    assert!(
        wait_until(|| {
            producer.property(StreamProperty::Observers) == Some(PropertyValue::Int(1))
        })
        .await
    );

    // Tearing the client down closes its sockets.
    client.reset().await;

    assert!(wait_until(|| *disconnects.lock() == 1).await);
    assert!(
        wait_until(|| {
            producer.property(StreamProperty::Observers) == Some(PropertyValue::Int(0))
        })
        .await
    );

    server.reset().await;
}
