use fleetlink::codec::FrameDecoder;
use fleetlink::config::{CodecConfig, GatewayConfig};
use fleetlink::protocol::AgentCommand;
use fleetlink::registry::{AgentEndpoint, AgentSelector, RegistryError, StaticRoster};
use fleetlink::{AgentEvent, AgentStatus, Direction, Gateway, GatewayError, LinkState};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, timeout, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.connection.retry_interval_ms = 100;
    config.control.tick_interval_ms = 100;
    config.control.staleness_ms = 300;
    config.roster.refresh_interval_ms = 100;
    config
}

fn agent_at(id: u64, listener: &TcpListener) -> AgentEndpoint {
    AgentEndpoint {
        port: Some(listener.local_addr().unwrap().port()),
        ..AgentEndpoint::new(id, Some("127.0.0.1"))
    }
}

/// Reads commands off a fake agent socket.
struct CommandReader {
    stream: TcpStream,
    decoder: FrameDecoder,
    pending: Vec<AgentCommand>,
}

impl CommandReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(&CodecConfig::default()),
            pending: Vec::new(),
        }
    }

    async fn next(&mut self) -> Option<AgentCommand> {
        let mut buf = [0u8; 512];
        while self.pending.is_empty() {
            let n = timeout(WAIT, self.stream.read(&mut buf)).await.ok()?.ok()?;
            if n == 0 {
                return None;
            }
            for frame in self.decoder.feed(&buf[..n]) {
                self.pending
                    .push(serde_json::from_value(frame.ok()?).ok()?);
            }
        }
        Some(self.pending.remove(0))
    }
}

async fn wait_connected(gateway: &Gateway, id: u64) {
    let deadline = Instant::now() + WAIT;
    while !matches!(gateway.link_state(id).await, Ok(LinkState::Connected)) {
        assert!(Instant::now() < deadline, "agent {} never connected", id);
        time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_direction_repeats_then_stops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (gateway, _events) = Gateway::start(config()).unwrap();
    gateway.connect_to_agent(agent_at(7, &listener)).await.unwrap();
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut agent = CommandReader::new(stream);
    wait_connected(&gateway, 7).await;

    gateway.set_direction(7, Direction::Forward).await.unwrap();

    let mut moving = 0;
    let started = Instant::now();
    loop {
        match agent.next().await.expect("command stream ended") {
            AgentCommand::Control(c) if c.linear_x > 0.0 => {
                assert_eq!(c.angular_z, 0.0);
                moving += 1;
            }
            AgentCommand::Control(c) => {
                assert_eq!((c.linear_x, c.angular_z), (0.0, 0.0));
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(moving >= 1, "intent was never dispatched");
    assert!(started.elapsed() < Duration::from_secs(1));

    // Nothing more after the stop
    assert!(timeout(Duration::from_millis(300), agent.next()).await.is_err());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_navigation_goal_is_one_shot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (gateway, _events) = Gateway::start(config()).unwrap();
    gateway.connect_to_agent(agent_at(2, &listener)).await.unwrap();
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut agent = CommandReader::new(stream);
    wait_connected(&gateway, 2).await;

    assert!(gateway.set_target_position(2, 4.0, -1.0, None).await.unwrap());
    assert_eq!(agent.next().await, Some(AgentCommand::navigate(4.0, -1.0, Some(0.0))));
    assert!(timeout(Duration::from_millis(300), agent.next()).await.is_err());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unknown_agents_are_rejected() {
    let (gateway, _events) = Gateway::start(config()).unwrap();

    assert!(matches!(
        gateway.set_direction(42, Direction::Left).await,
        Err(GatewayError::Registry(RegistryError::UnknownAgent(42)))
    ));
    assert!(matches!(
        gateway.send_control_cmd(42, 1.0, 0.0).await,
        Err(GatewayError::Registry(RegistryError::UnknownAgent(42)))
    ));
    assert!(gateway.disconnect_from_agent(&AgentSelector::Id(42)).await.is_empty());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_roster_refresh_connects_agents() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut gateway, mut events) = Gateway::start(config()).unwrap();
    gateway.spawn_roster_refresh(Arc::new(StaticRoster(vec![agent_at(5, &listener)])));

    let (_stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    match timeout(WAIT, events.recv()).await.unwrap() {
        Some(AgentEvent::Status { agent_id, update }) => {
            assert_eq!(agent_id, 5);
            assert_eq!(update.status, Some(AgentStatus::Idle));
        }
        other => panic!("unexpected {:?}", other),
    }

    // Further refreshes do not reconnect
    time::sleep(Duration::from_millis(350)).await;
    assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
    assert_eq!(gateway.link_stats(5).await.unwrap().sessions, 1);

    assert_eq!(gateway.disconnect_from_agent(&"5".parse().unwrap()).await, vec![5]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut bad = GatewayConfig::default();
    bad.control.tick_interval_ms = 0;
    assert!(matches!(Gateway::start(bad), Err(GatewayError::Config(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_agent_does_not_block_others() {
    let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = config();
    config.connection.write_timeout_ms = 500;
    let (gateway, _events) = Gateway::start(config).unwrap();
    gateway.connect_to_agent(agent_at(1, &stalled)).await.unwrap();
    gateway.connect_to_agent(agent_at(2, &healthy)).await.unwrap();

    // Agent 1 accepts and never reads
    let (_silent, _) = timeout(WAIT, stalled.accept()).await.unwrap().unwrap();
    let (stream, _) = timeout(WAIT, healthy.accept()).await.unwrap().unwrap();
    let mut agent = CommandReader::new(stream);
    wait_connected(&gateway, 1).await;
    wait_connected(&gateway, 2).await;

    // Flood agent 1 until its socket backs up; every call must still return
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        assert!(Instant::now() < deadline, "stalled agent never pushed back");
        let sent = timeout(Duration::from_secs(1), gateway.send_navigation_cmd(1, 1.0, 2.0, None))
            .await
            .expect("command to stalled agent blocked")
            .unwrap();
        if !sent {
            break;
        }
    }

    let sent = timeout(Duration::from_secs(1), gateway.send_control_cmd(2, 0.5, 0.0))
        .await
        .expect("command to healthy agent blocked")
        .unwrap();
    assert!(sent);
    assert_eq!(agent.next().await, Some(AgentCommand::control(0.5, 0.0)));

    // The control tick still reaches the healthy agent, stop included
    gateway.set_direction(2, Direction::Left).await.unwrap();
    loop {
        match agent.next().await.expect("command stream ended") {
            AgentCommand::Control(c) if c.angular_z != 0.0 => {}
            AgentCommand::Control(c) => {
                assert_eq!((c.linear_x, c.angular_z), (0.0, 0.0));
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    gateway.shutdown().await;
}
