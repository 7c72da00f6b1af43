use cansim::control::{ControlHandler, Outbound};
use cansim::message::ByteOrder;
use cansim::{MessageDefinition, Node, NodeRole, SignalDefinition, SimConfig, SimulationEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

const TCP_PORT: u16 = 8080;
const BROADCAST_BUFFER_SIZE: usize = 1024;
const TICK_INTERVAL_MS: u64 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("CAN Bus Simulator");
    println!("=================");

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SimConfig::from_path(&path)?,
        None => demo_config(),
    };
    let speed = match args.next() {
        Some(speed) => speed.parse::<f64>()?,
        None => 1.0,
    };

    let (bus_tx, _) = broadcast::channel::<String>(BROADCAST_BUFFER_SIZE);

    let mut engine = SimulationEngine::new(config)?;
    let stats_tx = bus_tx.clone();
    engine.on_statistics(move |snapshot| {
        if let Ok(line) = serde_json::to_string(&Outbound::Statistics(snapshot)) {
            // No subscribers is not an error.
            let _ = stats_tx.send(line);
        }
    });
    engine.start(speed)?;
    let engine = Arc::new(Mutex::new(engine));

    let tcp_engine = Arc::clone(&engine);
    let tcp_bus_tx = bus_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(tcp_engine, tcp_bus_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let mut interval = time::interval(Duration::from_millis(TICK_INTERVAL_MS));
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let delta_ms = take_elapsed_ms(&mut last, Instant::now());
                if delta_ms == 0 {
                    continue;
                }

                let frames = {
                    let mut guard = engine.lock().await;
                    guard.tick(delta_ms);
                    guard.drain_events()
                };
                for frame in &frames {
                    match serde_json::to_string(&Outbound::Frame(frame)) {
                        Ok(line) => {
                            let _ = bus_tx.send(line);
                        }
                        Err(e) => warn!("Failed to serialize frame: {}", e),
                    }
                    if let Some(fault) = &frame.error {
                        info!(id = frame.id, fault = %fault.tag, "Error frame on bus");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    {
        let mut guard = engine.lock().await;
        guard.stop();
        let stats = guard.statistics();
        info!(
            frames = stats.message_count,
            errors = stats.error_count,
            bus_load = stats.bus_load,
            "Final statistics"
        );
    }

    tcp_server.abort();
    println!("CAN Bus Simulator stopped");
    Ok(())
}

/// Two ECUs on plain CAN, used when no configuration file is given.
fn demo_config() -> SimConfig {
    SimConfig::default()
        .with_node(Node::new("engine", "Engine ECU", 1, NodeRole::Ecu).with_color("#e06c75"))
        .with_node(Node::new("brake", "Brake ECU", 2, NodeRole::Ecu).with_color("#61afef"))
        .with_message(
            MessageDefinition::new(0x100, "EngineData", 8)
                .with_cycle_time(100)
                .with_node("engine")
                .with_signal(
                    SignalDefinition::new("RPM", 0, 16)
                        .with_scaling(0.25, 0.0)
                        .with_range(600.0, 6500.0)
                        .with_unit("rpm"),
                )
                .with_signal(
                    SignalDefinition::new("CoolantTemp", 16, 8)
                        .with_scaling(1.0, -40.0)
                        .with_range(70.0, 110.0)
                        .with_unit("degC"),
                ),
        )
        .with_message(
            MessageDefinition::new(0x200, "BrakeStatus", 4)
                .with_cycle_time(50)
                .with_node("brake")
                .with_signal(
                    SignalDefinition::new("Pressure", 7, 16)
                        .with_byte_order(ByteOrder::BigEndian)
                        .with_scaling(0.1, 0.0)
                        .with_range(0.0, 200.0)
                        .with_unit("bar"),
                ),
        )
}

/// Whole milliseconds elapsed since `last`. `last` only moves by what is
/// returned, so the sub-millisecond remainder carries into the next call.
fn take_elapsed_ms(last: &mut Instant, now: Instant) -> u64 {
    let delta_ms = now.saturating_duration_since(*last).as_millis() as u64;
    *last += Duration::from_millis(delta_ms);
    delta_ms
}

async fn start_tcp_server(
    engine: Arc<Mutex<SimulationEngine>>,
    bus_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", TCP_PORT)).await?;
    info!("TCP server listening on port {}", TCP_PORT);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New client connected: {}", addr);
                let client_engine = Arc::clone(&engine);
                let client_rx = bus_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_engine, client_rx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    engine: Arc<Mutex<SimulationEngine>>,
    mut bus_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let bus_writer = Arc::clone(&writer);
    let bus_task = tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(line) => {
                    let mut guard = bus_writer.lock().await;
                    if guard.write_all(line.as_bytes()).await.is_err() || guard.write_all(b"\n").await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Client lagging, {} lines skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut handler = ControlHandler::new();
    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = {
                    let mut guard = engine.lock().await;
                    handler.handle_line(&mut guard, trimmed)
                };
                let response_json = serde_json::to_string(&Outbound::Response(&response))?;
                {
                    let mut guard = writer.lock().await;
                    guard.write_all(response_json.as_bytes()).await?;
                    guard.write_all(b"\n").await?;
                }
                info!(id = response.id, status = ?response.status, "Command handled");
            }
            Err(e) => {
                error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    bus_task.abort();
    Ok(())
}
