use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use fleetlink::config::GatewayConfig;
use fleetlink::integrity::{IntegrityGateway, TransformDirection};
use fleetlink::registry::{AgentEndpoint, FileRoster};
use fleetlink::{AgentEvent, AgentStatus, Direction, Gateway, LinkState, MapKind, StatusUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing_subscriber::EnvFilter;

const CONNECT_WAIT: Duration = Duration::from_secs(10);
const DRIVE_REPEAT: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("fleetlink")
        .version("0.1.0")
        .author("Fleet Systems Engineering Team")
        .about("🤖 Fleetlink - Robot fleet gateway")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Gateway configuration file (JSON)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("🚀 Run the gateway and print agent events")
                .arg(
                    Arg::with_name("roster")
                        .short("r")
                        .long("roster")
                        .value_name("FILE")
                        .help("Roster file, re-read periodically")
                        .takes_value(true),
                )
                .arg(agent_arg().multiple(true).number_of_values(1)),
        )
        .subcommand(
            SubCommand::with_name("drive")
                .about("🕹️  Hold a direction for a while, then let the watchdog stop the agent")
                .arg(agent_arg().required(true))
                .arg(
                    Arg::with_name("direction")
                        .help("Direction to drive")
                        .required(true)
                        .possible_values(&["forward", "backward", "left", "right"]),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("How long to hold the direction")
                        .takes_value(true)
                        .default_value("2"),
                ),
        )
        .subcommand(
            SubCommand::with_name("goto")
                .about("📍 Send a navigation goal")
                .arg(agent_arg().required(true))
                .arg(Arg::with_name("x").help("Target x").required(true).allow_hyphen_values(true))
                .arg(Arg::with_name("y").help("Target y").required(true).allow_hyphen_values(true))
                .arg(
                    Arg::with_name("heading")
                        .long("heading")
                        .value_name("DEGREES")
                        .help("Target heading (default 0)")
                        .takes_value(true)
                        .allow_hyphen_values(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("integrity")
                .about("🔐 Round-trip a payload through the integrity service")
                .arg(
                    Arg::with_name("direction")
                        .help("Transform direction")
                        .required(true)
                        .possible_values(&["seal", "unseal"]),
                )
                .arg(Arg::with_name("payload").help("Payload text").required(true)),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    init_tracing(verbose);

    let mut config = match matches.value_of("config") {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env();
    let format = matches.value_of("format").unwrap_or("table").to_string();

    match matches.subcommand() {
        ("run", Some(sub)) => handle_run(sub, config, &format).await?,
        ("drive", Some(sub)) => handle_drive(sub, config, &format).await?,
        ("goto", Some(sub)) => handle_goto(sub, config).await?,
        ("integrity", Some(sub)) => handle_integrity(sub, config).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start a mock agent", "fleetlink-agent-simulator".bright_cyan());
            println!("  {} Watch its telemetry", "fleetlink run --agent 1@127.0.0.1".bright_cyan());
            println!("  {} Drive it", "fleetlink drive --agent 1@127.0.0.1 forward".bright_cyan());
        }
    }

    Ok(())
}

fn agent_arg() -> Arg<'static, 'static> {
    Arg::with_name("agent")
        .short("a")
        .long("agent")
        .value_name("ID@HOST[:PORT]")
        .help("Agent to connect to")
        .takes_value(true)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "fleetlink=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `7@10.0.0.7` or `7@10.0.0.7:9000`.
fn parse_agent(arg: &str) -> Result<AgentEndpoint, String> {
    let (id, address) = arg
        .split_once('@')
        .ok_or_else(|| format!("expected ID@HOST[:PORT], got '{}'", arg))?;
    let id = id
        .parse()
        .map_err(|_| format!("invalid agent id '{}'", id))?;

    let mut entry = AgentEndpoint::new(id, None);
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| format!("invalid port '{}'", port))?;
            entry.ip_address = Some(host.to_string());
            entry.port = Some(port);
        }
        None => entry.ip_address = Some(address.to_string()),
    }
    Ok(entry)
}

fn required_agent(matches: &ArgMatches<'_>) -> Result<AgentEndpoint, Box<dyn std::error::Error>> {
    let arg = matches.value_of("agent").ok_or("--agent is required")?;
    Ok(parse_agent(arg)?)
}

async fn handle_run(matches: &ArgMatches<'_>, config: GatewayConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let roster_path = matches
        .value_of("roster")
        .map(str::to_string)
        .or_else(|| config.roster.path.clone());

    let (mut gateway, events) = Gateway::start(config)?;
    println!("{}", "📡 Gateway running (Press Ctrl+C to stop)...".bright_blue().bold());

    if let Some(agents) = matches.values_of("agent") {
        for arg in agents {
            gateway.connect_to_agent(parse_agent(arg)?).await?;
        }
    }
    if let Some(path) = roster_path {
        println!("{} {}", "Roster:".dimmed(), path);
        gateway.spawn_roster_refresh(Arc::new(FileRoster::new(path)));
    }

    tokio::select! {
        _ = print_events(events, format.to_string()) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    gateway.shutdown().await;
    println!("{}", "🛑 Gateway stopped".bright_yellow());
    Ok(())
}

async fn handle_drive(matches: &ArgMatches<'_>, config: GatewayConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let agent = required_agent(matches)?;
    let direction: Direction = matches.value_of("direction").unwrap_or("forward").parse()?;
    let seconds: f64 = matches.value_of("duration").unwrap_or("2").parse()?;
    let staleness = config.control.staleness() + config.control.tick_interval();
    let agent_id = agent.id;

    let (gateway, events) = Gateway::start(config)?;
    gateway.connect_to_agent(agent).await?;
    let printer = tokio::spawn(print_events(events, format.to_string()));

    if !wait_connected(&gateway, agent_id).await {
        println!("{} agent {} did not connect within {:?}", "❌".red(), agent_id, CONNECT_WAIT);
        gateway.shutdown().await;
        printer.abort();
        return Ok(());
    }

    println!("{} driving agent {} {:?} for {}s", "🕹️".bright_blue(), agent_id, direction, seconds);
    let deadline = time::Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    while time::Instant::now() < deadline {
        gateway.set_direction(agent_id, direction).await?;
        time::sleep(DRIVE_REPEAT).await;
    }

    // Let the watchdog send its stop
    time::sleep(staleness).await;
    println!("{} released, agent stopped by watchdog", "✅".green());

    gateway.shutdown().await;
    printer.abort();
    Ok(())
}

async fn handle_goto(matches: &ArgMatches<'_>, config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let agent = required_agent(matches)?;
    let x: f64 = matches.value_of("x").unwrap_or("0").parse()?;
    let y: f64 = matches.value_of("y").unwrap_or("0").parse()?;
    let heading = matches.value_of("heading").map(str::parse::<f64>).transpose()?;
    let agent_id = agent.id;

    let (gateway, _events) = Gateway::start(config)?;
    gateway.connect_to_agent(agent).await?;

    if wait_connected(&gateway, agent_id).await
        && gateway.set_target_position(agent_id, x, y, heading).await?
    {
        println!("{} goal ({}, {}) sent to agent {}", "✅".green(), x, y, agent_id);
    } else {
        println!("{} goal not delivered to agent {}", "❌".red(), agent_id);
    }

    gateway.shutdown().await;
    Ok(())
}

async fn handle_integrity(matches: &ArgMatches<'_>, mut config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let direction = match matches.value_of("direction") {
        Some("unseal") => TransformDirection::Unseal,
        _ => TransformDirection::Seal,
    };
    let payload = matches.value_of("payload").unwrap_or_default();

    config.integrity.enabled = true;
    let integrity = IntegrityGateway::connect(&config.integrity, &config.connection)?;

    let wait = time::Instant::now() + config.connection.connect_timeout();
    while !integrity.is_ready() && time::Instant::now() < wait {
        time::sleep(Duration::from_millis(50)).await;
    }

    match integrity.transform(direction, payload).await {
        Some(result) => println!("{}", result.escape_debug()),
        None => println!("{} integrity service unavailable", "❌".red()),
    }
    integrity.close();
    Ok(())
}

async fn wait_connected(gateway: &Gateway, agent_id: u64) -> bool {
    let deadline = time::Instant::now() + CONNECT_WAIT;
    while time::Instant::now() < deadline {
        if matches!(gateway.link_state(agent_id).await, Ok(LinkState::Connected)) {
            return true;
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn print_events(mut events: mpsc::Receiver<AgentEvent>, format: String) {
    while let Some(event) = events.recv().await {
        match format.as_str() {
            "json" => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("{} {}", "Failed to serialize event:".red(), e),
            },
            "compact" => print_compact(&event),
            _ => print_table(&event),
        }
    }
}

fn print_compact(event: &AgentEvent) {
    match event {
        AgentEvent::Status { agent_id, update } => {
            let status = update.status.map(status_label).unwrap_or("-");
            println!(
                "{} {} v={:.2} w={:.2} hdg={:.1}",
                agent_id,
                status,
                update.linear_velo.unwrap_or(0.0),
                update.angular_velo.unwrap_or(0.0),
                update.heading.unwrap_or(0.0)
            );
        }
        AgentEvent::Map { agent_id, grid } => {
            println!("{} {} {}x{}", agent_id, kind_label(grid.kind), grid.width, grid.height);
        }
    }
}

fn print_table(event: &AgentEvent) {
    match event {
        AgentEvent::Status { agent_id, update } => print_status(*agent_id, update),
        AgentEvent::Map { agent_id, grid } => {
            println!("{}", format!("🗺️  AGENT {} MAP", agent_id).bright_white().bold());
            println!("├─ Kind:       {}", kind_label(grid.kind).bright_cyan());
            println!("├─ Size:       {}x{}", grid.width, grid.height);
            println!("├─ Resolution: {:.3} m/cell", grid.resolution);
            println!(
                "└─ Origin:     ({:.2}, {:.2})",
                grid.origin[0], grid.origin[1]
            );
        }
    }
}

fn print_status(agent_id: u64, update: &StatusUpdate) {
    println!("{}", format!("🤖 AGENT {} STATUS", agent_id).bright_white().bold());
    if let Some(status) = update.status {
        let label = match status {
            AgentStatus::Active => status_label(status).bright_green(),
            AgentStatus::Idle => status_label(status).bright_yellow(),
            AgentStatus::Offline => status_label(status).bright_red(),
        };
        println!("├─ Status:  {}", label);
    }
    if let (Some(linear), Some(angular)) = (update.linear_velo, update.angular_velo) {
        println!("├─ Velocity: {:.2} m/s, {:.2} rad/s", linear, angular);
    }
    if let Some(heading) = update.heading {
        println!("├─ Heading: {:.1}°", heading);
    }
    match update.position {
        Some([x, y]) => println!("└─ Position: ({:.2}, {:.2})", x, y),
        None => println!("└─ Position: {}", "unknown".dimmed()),
    }
}

fn status_label(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Active => "active",
        AgentStatus::Idle => "idle",
        AgentStatus::Offline => "offline",
    }
}

fn kind_label(kind: MapKind) -> &'static str {
    match kind {
        MapKind::Static => "static",
        MapKind::GlobalCostmap => "globalCostmap",
        MapKind::LocalCostmap => "localCostmap",
    }
}
