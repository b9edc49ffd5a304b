use fleetlink::config::{ConnectionConfig, IntegrityConfig};
use fleetlink::integrity::{IntegrityGateway, TransformDirection};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{self, Instant};

const TAIL: &str = "e^&og\r\n\r\n";

fn connection() -> ConnectionConfig {
    ConnectionConfig {
        retry_interval_ms: 100,
        ..ConnectionConfig::default()
    }
}

async fn listeners() -> (TcpListener, TcpListener, IntegrityConfig) {
    let secure = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let insecure = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = IntegrityConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        secure_port: secure.local_addr().unwrap().port(),
        insecure_port: insecure.local_addr().unwrap().port(),
        response_timeout_ms: 300,
        ..IntegrityConfig::default()
    };
    (secure, insecure, config)
}

async fn wait_ready(gateway: &IntegrityGateway) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !gateway.is_ready() {
        assert!(Instant::now() < deadline, "integrity channels never connected");
        time::sleep(Duration::from_millis(20)).await;
    }
}

/// Reads one tail-terminated packet.
async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Option<String> {
    let mut packet = Vec::new();
    let mut buf = [0u8; 256];
    while !packet.ends_with(TAIL.as_bytes()) {
        let n = reader.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        packet.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(packet).ok()
}

/// Fake service: answers `S0<body><tail>` with `S0<reversed body><tail>` on
/// the opposite channel.
async fn reverse_service<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = read_packet(&mut reader).await {
        let body = &packet[2..packet.len() - TAIL.len()];
        let reply = format!("S0{}{}", body.chars().rev().collect::<String>(), TAIL);
        if writer.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_bypass_is_identity() {
    let gateway = IntegrityGateway::bypass();
    assert!(gateway.is_bypass());
    for payload in ["", "plain", "S0already framed e^&og\r\n\r\n"] {
        assert_eq!(gateway.seal(payload).await.as_deref(), Some(payload));
        assert_eq!(gateway.unseal(payload).await.as_deref(), Some(payload));
    }
}

#[tokio::test]
async fn test_unreachable_service_yields_none() {
    let (secure, insecure, config) = listeners().await;
    drop(secure);
    drop(insecure);

    let gateway = IntegrityGateway::connect(&config, &connection()).unwrap();
    let started = Instant::now();
    assert_eq!(gateway.transform(TransformDirection::Seal, "data").await, None);
    assert!(started.elapsed() <= Duration::from_millis(300) + Duration::from_millis(200));
    gateway.close();
}

#[tokio::test]
async fn test_silent_service_times_out() {
    let (secure, insecure, config) = listeners().await;
    let gateway = IntegrityGateway::connect(&config, &connection()).unwrap();
    let (_secure_peer, _) = secure.accept().await.unwrap();
    let (_insecure_peer, _) = insecure.accept().await.unwrap();
    wait_ready(&gateway).await;

    let started = Instant::now();
    assert_eq!(gateway.seal("hello").await, None);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
    gateway.close();
}

#[tokio::test]
async fn test_seal_and_unseal_round_trip() {
    let (secure, insecure, config) = listeners().await;
    let gateway = IntegrityGateway::connect(&config, &connection()).unwrap();

    let (secure_peer, _) = secure.accept().await.unwrap();
    let (insecure_peer, _) = insecure.accept().await.unwrap();
    let (secure_read, secure_write) = secure_peer.into_split();
    let (insecure_read, insecure_write) = insecure_peer.into_split();
    // Seal requests arrive on the insecure side, unseal requests on the secure side
    tokio::spawn(reverse_service(insecure_read, secure_write));
    tokio::spawn(reverse_service(secure_read, insecure_write));
    wait_ready(&gateway).await;

    let sealed = gateway.seal("hello fleet").await.expect("sealed");
    assert_eq!(sealed, format!("S0teelf olleh{}", TAIL));

    let opened = gateway.unseal(&sealed).await.expect("unsealed");
    assert_eq!(opened, "hello fleet");
    gateway.close();
}
