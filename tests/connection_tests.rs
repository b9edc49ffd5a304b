use fleetlink::config::ConnectionConfig;
use fleetlink::connection::{ConnectionError, ConnectionEvent, Endpoint, ResilientConnection};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{self, timeout, Instant};

/// A loopback port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn fast_retry() -> ConnectionConfig {
    ConnectionConfig {
        retry_interval_ms: 100,
        ..ConnectionConfig::default()
    }
}

#[tokio::test]
async fn test_retries_within_retry_window() {
    let port = closed_port().await;
    let (connection, _events) =
        ResilientConnection::open(Endpoint::new("127.0.0.1", port), &ConnectionConfig::default());

    let started = Instant::now();
    while connection.attempts() < 2 {
        assert!(
            started.elapsed() < Duration::from_millis(3500),
            "no retry within 3.5 s"
        );
        time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!connection.is_connected());
    connection.close();
}

#[tokio::test]
async fn test_retries_until_closed_then_stops() {
    let port = closed_port().await;
    let (connection, _events) = ResilientConnection::open(Endpoint::new("127.0.0.1", port), &fast_retry());

    time::sleep(Duration::from_millis(450)).await;
    assert!(connection.attempts() >= 3);

    connection.close();
    time::sleep(Duration::from_millis(50)).await;
    let frozen = connection.attempts();
    time::sleep(Duration::from_millis(350)).await;
    assert_eq!(connection.attempts(), frozen);
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_send_while_disconnected_fails() {
    let port = closed_port().await;
    let endpoint = Endpoint::new("127.0.0.1", port);
    let (connection, _events) = ResilientConnection::open(endpoint.clone(), &fast_retry());

    match connection.send(b"lost".to_vec()) {
        Err(ConnectionError::NotConnected(ep)) => assert_eq!(ep, endpoint),
        other => panic!("expected NotConnected, got {:?}", other),
    }

    connection.close();
    assert!(matches!(
        connection.send(b"lost".to_vec()),
        Err(ConnectionError::Closed(_))
    ));
}

#[tokio::test]
async fn test_data_flows_and_reconnects_after_peer_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (connection, mut events) = ResilientConnection::open(Endpoint::new("127.0.0.1", port), &fast_retry());

    // First session: echo one message, then hang up
    let (mut peer, _) = listener.accept().await.unwrap();
    assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));
    connection.send(b"ping".to_vec()).unwrap();
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    peer.write_all(b"pong").await.unwrap();

    let mut received = Vec::new();
    while received.len() < 4 {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(ConnectionEvent::Data(bytes)) => received.extend(bytes),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(received, b"pong");
    drop(peer);

    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(ConnectionEvent::Disconnected)
    );

    // Second session on the same listener
    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(ConnectionEvent::Connecting)
    );
    let (_peer, _) = timeout(Duration::from_secs(2), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(ConnectionEvent::Connected)
    );
    assert!(connection.is_connected());

    connection.close();
}

#[tokio::test]
async fn test_peer_that_stops_reading_never_blocks_sender() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ConnectionConfig {
        write_timeout_ms: 200,
        outbound_queue: 4,
        ..fast_retry()
    };
    let (connection, mut events) = ResilientConnection::open(Endpoint::new("127.0.0.1", port), &config);

    // Accept, then never read
    let (_peer, _) = listener.accept().await.unwrap();
    assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

    let chunk = vec![0u8; 1 << 20];
    let mut queue_full = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "stalled session was never dropped");
        match connection.send(chunk.clone()) {
            Ok(()) => {}
            Err(ConnectionError::QueueFull(_)) => queue_full = true,
            Err(ConnectionError::NotConnected(_)) => break,
            Err(e) => panic!("unexpected error {:?}", e),
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    assert!(queue_full, "queue never filled up");
    assert_eq!(
        timeout(Duration::from_secs(1), events.recv()).await.unwrap(),
        Some(ConnectionEvent::Disconnected)
    );

    connection.close();
}
