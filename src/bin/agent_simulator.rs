use fleetlink::codec::{FrameDecoder, FrameEncoder};
use fleetlink::config::{CodecConfig, DEFAULT_AGENT_PORT};
use fleetlink::protocol::AgentCommand;
use serde_json::{json, Value};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{error, info, warn};

const TELEMETRY_PERIOD: Duration = Duration::from_millis(500);
const COSTMAP_EVERY: u64 = 6;
const COSTMAP_SIZE: usize = 40;
const COSTMAP_RESOLUTION: f64 = 0.05;

/// Simulated robot body, shared by every connected gateway.
#[derive(Debug, Default)]
struct SimState {
    x: f64,
    y: f64,
    yaw: f64,
    linear: f64,
    angular: f64,
    goal: Option<(f64, f64)>,
}

impl SimState {
    fn step(&mut self, dt: f64) {
        if let Some((gx, gy)) = self.goal {
            let (dx, dy) = (gx - self.x, gy - self.y);
            let distance = dx.hypot(dy);
            if distance < 0.05 {
                self.goal = None;
                self.linear = 0.0;
                self.angular = 0.0;
            } else {
                self.yaw = dy.atan2(dx);
                self.linear = distance.min(0.5);
                self.angular = 0.0;
            }
        }

        self.yaw = (self.yaw + self.angular * dt + PI).rem_euclid(2.0 * PI) - PI;
        self.x += self.linear * self.yaw.cos() * dt;
        self.y += self.linear * self.yaw.sin() * dt;
    }

    fn apply(&mut self, command: &AgentCommand) {
        match command {
            AgentCommand::Control(c) => {
                self.goal = None;
                self.linear = c.linear_x;
                self.angular = c.angular_z;
            }
            AgentCommand::Navigate(n) => {
                self.goal = Some((n.x, n.y));
                self.yaw = n.heading.to_radians();
            }
        }
    }

    fn telemetry(&self) -> Value {
        let half = self.yaw / 2.0;
        json!({
            "type": "status",
            "payload": {
                "velocity": {
                    "linear": {"x": self.linear},
                    "angular": {"z": self.angular}
                },
                "pose": {"pose": {
                    "position": {"x": self.x, "y": self.y, "z": 0.0},
                    "orientation": {"x": 0.0, "y": 0.0, "z": half.sin(), "w": half.cos()}
                }}
            }
        })
    }

    /// Square costmap centred on the robot with a ring of obstacles and an
    /// unknown border.
    fn costmap(&self) -> Value {
        let n = COSTMAP_SIZE;
        let centre = (n as f64 - 1.0) / 2.0;
        let data: Vec<i32> = (0..n * n)
            .map(|i| {
                let (col, row) = ((i % n) as f64, (i / n) as f64);
                let r = (col - centre).hypot(row - centre);
                if col == 0.0 || row == 0.0 || col as usize == n - 1 || row as usize == n - 1 {
                    -1
                } else if (r - centre * 0.7).abs() < 1.0 {
                    100
                } else {
                    ((r / centre) * 30.0) as i32
                }
            })
            .collect();
        let span = n as f64 * COSTMAP_RESOLUTION;

        json!({
            "type": "costmap",
            "payload": {
                "global_costmap": {
                    "info": {
                        "width": n,
                        "height": n,
                        "resolution": COSTMAP_RESOLUTION,
                        "origin": {"position": {"x": self.x - span / 2.0, "y": self.y - span / 2.0, "z": 0.0}}
                    },
                    "data": data
                }
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let port = std::env::args()
        .nth(1)
        .map(|p| p.parse::<u16>())
        .transpose()?
        .unwrap_or(DEFAULT_AGENT_PORT);

    println!("🤖 Mock Fleet Agent");
    println!("===================");

    let state = Arc::new(Mutex::new(SimState::default()));

    let physics_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            physics_state.lock().await.step(0.1);
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("🌐 Agent listening on port {}", port);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("🔗 Gateway connected: {}", addr);
                    let client_state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_gateway(stream, client_state).await {
                            warn!("Gateway {} error: {}", addr, e);
                        }
                        info!("🔌 Gateway {} disconnected", addr);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("🛑 Mock agent stopped");
    Ok(())
}

async fn handle_gateway(
    stream: TcpStream,
    state: Arc<Mutex<SimState>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let codec = CodecConfig::default();
    let encoder = FrameEncoder::new(&codec);
    let mut decoder = FrameDecoder::new(&codec);
    let (mut reader, mut writer) = stream.into_split();

    let telemetry_state = Arc::clone(&state);
    let telemetry_task = tokio::spawn(async move {
        let mut interval = time::interval(TELEMETRY_PERIOD);
        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            let messages = {
                let state = telemetry_state.lock().await;
                let mut messages = vec![state.telemetry()];
                if tick % COSTMAP_EVERY == 0 {
                    messages.push(state.costmap());
                }
                messages
            };
            tick += 1;

            for message in messages {
                let frame = match encoder.encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to encode telemetry: {}", e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("Failed to send telemetry: {}", e);
                    return;
                }
            }
        }
    });

    let mut buffer = vec![0u8; 4096];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        for frame in decoder.feed(&buffer[..n]) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping bad frame: {}", e);
                    continue;
                }
            };
            match serde_json::from_value::<AgentCommand>(frame.clone()) {
                Ok(command) => {
                    info!("📥 COMMAND: {:?}", command);
                    state.lock().await.apply(&command);
                }
                Err(_) => warn!("Unknown frame: {}", frame),
            }
        }
    }

    telemetry_task.abort();
    Ok(())
}
