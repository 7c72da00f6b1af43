use cansim::config::ProtocolKind;
use cansim::{FrameEvent, SimConfig, SimulationEngine, StatisticsSnapshot};
use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use std::sync::{Arc, Mutex};

const DEFAULT_DURATION_MS: &str = "10000";
const DEFAULT_SPEED: &str = "1.0";
/// Host step used to drive the virtual clock in batch runs.
const TICK_MS: u64 = 10;

fn main() {
    let matches = App::new("cansim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("CAN bus simulator - virtual ECUs with J1939, CANopen and UDS behaviour")
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a configuration for a fixed span of simulated time")
                .arg(
                    Arg::with_name("config")
                        .help("Path to a JSON session configuration")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("MS")
                        .help("Simulated milliseconds to run")
                        .takes_value(true)
                        .default_value(DEFAULT_DURATION_MS)
                        .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "Duration must be a whole number of ms".into())),
                )
                .arg(
                    Arg::with_name("speed")
                        .short("s")
                        .long("speed")
                        .value_name("FACTOR")
                        .help("Simulated time per host time")
                        .takes_value(true)
                        .default_value(DEFAULT_SPEED)
                        .validator(|v| match v.parse::<f64>() {
                            Ok(s) if s.is_finite() && s > 0.0 => Ok(()),
                            _ => Err("Speed must be a positive number".into()),
                        }),
                )
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .value_name("SEED")
                        .help("Override the configured RNG seed")
                        .takes_value(true)
                        .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "Seed must be an unsigned integer".into())),
                )
                .arg(
                    Arg::with_name("fault")
                        .long("fault")
                        .value_name("TAG@MS")
                        .help("Inject a fault at a simulated time, e.g. crc@2500 (repeatable)")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1),
                )
                .arg(
                    Arg::with_name("tail")
                        .long("tail")
                        .value_name("N")
                        .help("Print only the last N frames")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("quiet")
                        .short("q")
                        .long("quiet")
                        .help("Suppress frames; print statistics only"),
                ),
        )
        .subcommand(
            SubCommand::with_name("describe")
                .about("Show the nodes and messages a configuration defines")
                .arg(
                    Arg::with_name("config")
                        .help("Path to a JSON session configuration")
                        .required(true)
                        .index(1),
                ),
        )
        .get_matches();

    let json = matches.value_of("format") == Some("json");
    let result = match matches.subcommand() {
        ("run", Some(sub)) => run(sub, json),
        ("describe", Some(sub)) => describe(sub, json),
        _ => {
            eprintln!("{}", matches.usage());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(matches: &ArgMatches) -> Result<SimConfig, Box<dyn std::error::Error>> {
    let path = matches.value_of("config").ok_or("missing configuration path")?;
    Ok(SimConfig::from_path(path)?)
}

fn parse_fault(arg: &str) -> Result<(String, u64), String> {
    let (tag, at) = arg
        .split_once('@')
        .ok_or_else(|| format!("Fault '{}' must look like TAG@MS", arg))?;
    let at = at
        .parse::<u64>()
        .map_err(|_| format!("Fault time '{}' is not a whole number of ms", at))?;
    Ok((tag.to_string(), at))
}

fn run(matches: &ArgMatches, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(matches)?;
    if let Some(seed) = matches.value_of("seed") {
        config.seed = Some(seed.parse()?);
    }
    let duration: f64 = matches.value_of("duration").unwrap_or(DEFAULT_DURATION_MS).parse()?;
    let speed: f64 = matches.value_of("speed").unwrap_or(DEFAULT_SPEED).parse()?;
    let mut faults = matches
        .values_of("fault")
        .map(|values| values.map(parse_fault).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();
    faults.sort_by_key(|(_, at)| *at);
    let tail = matches.value_of("tail").map(str::parse::<usize>).transpose()?;
    let quiet = matches.is_present("quiet");

    let mut engine = SimulationEngine::new(config)?;
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    engine.on_statistics(move |snapshot| {
        if let Ok(mut sink) = sink.lock() {
            sink.push(*snapshot);
        }
    });

    if !json {
        println!(
            "{} {} session, {} nodes, {} messages, speed {}x",
            "▶".green().bold(),
            engine.protocol_kind().to_string().cyan(),
            engine.nodes().len(),
            engine.messages().count(),
            speed
        );
    }

    engine.start(speed)?;
    let mut frames: Vec<FrameEvent> = Vec::new();
    let mut pending = faults.into_iter().peekable();
    while engine.now_ms() < duration {
        let now = engine.now_ms();
        while let Some((tag, _)) = pending.next_if(|(_, at)| (*at as f64) <= now) {
            engine.inject_error(&tag)?;
        }
        engine.tick(TICK_MS);
        frames.extend(engine.drain_events());
    }
    engine.stop();

    if !quiet {
        let skip = tail.map_or(0, |n| frames.len().saturating_sub(n));
        for frame in &frames[skip..] {
            if json {
                println!("{}", serde_json::to_string(frame)?);
            } else {
                print_frame(frame);
            }
        }
    }

    let summary = engine.statistics();
    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        if let Ok(snapshots) = snapshots.lock() {
            println!("\n{}", "Statistics".bold());
            for snapshot in snapshots.iter() {
                print_snapshot(snapshot);
            }
        }
        println!("{}", "Final".bold());
        print_snapshot(&summary);
        let state = engine.get_state();
        if let Some(err) = &state.last_error {
            println!("{} {}", "Last error:".yellow(), err);
        }
        let faults = engine.get_fault_injection_stats();
        if faults.total_faults_injected > 0 {
            println!(
                "{} {} injected ({} follow-ups)",
                "Faults:".yellow(),
                faults.total_faults_injected,
                faults.follow_ups_scheduled
            );
        }
    }
    Ok(())
}

fn print_frame(frame: &FrameEvent) {
    let id = if frame.extended {
        format!("{:08X}", frame.id)
    } else {
        format!("{:03X}", frame.id)
    };
    let bytes: Vec<String> = frame.data.iter().map(|b| format!("{:02X}", b)).collect();
    let line = format!(
        "{:>10.1}  {:>8}  [{}]  {:<23}  {:<18} {}",
        frame.timestamp_ms,
        id,
        frame.length,
        bytes.join(" "),
        frame.name,
        frame.source.dimmed()
    );
    match &frame.error {
        Some(error) => println!("{}  {}", line.red(), error.tag.red().bold()),
        None => println!("{}", line),
    }
    for signal in &frame.signals {
        println!("{:>36} = {:.3} {}", signal.name.dimmed(), signal.physical, signal.unit);
    }
}

fn print_snapshot(snapshot: &StatisticsSnapshot) {
    let load = format!("{:5.1}%", snapshot.bus_load);
    let load = if snapshot.bus_load > 80.0 {
        load.red()
    } else if snapshot.bus_load > 50.0 {
        load.yellow()
    } else {
        load.green()
    };
    println!(
        "  t={:>9.1} ms  load {}  {:>7.1} kbit/s  {:>7.1} fps  frames {}  errors {}",
        snapshot.timestamp_ms,
        load,
        snapshot.throughput_kbps,
        snapshot.frames_per_second,
        snapshot.message_count,
        snapshot.error_count
    );
}

fn describe(matches: &ArgMatches, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let engine = SimulationEngine::new(load_config(matches)?)?;
    if json {
        let messages: Vec<_> = engine.messages().collect();
        let value = serde_json::json!({
            "protocol": engine.protocol_kind(),
            "nodes": engine.nodes(),
            "messages": messages,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} {}", "Protocol:".bold(), engine.protocol_kind().to_string().cyan());
    if engine.protocol_kind() == ProtocolKind::J1939 {
        if let Some(controller) = engine.protocol().j1939() {
            println!("  preferred address {:#04x}, NAME {:#018x}", controller.preferred_address(), controller.name());
        }
    }
    println!("{}", "Nodes:".bold());
    for node in engine.nodes() {
        println!("  {:<12} {:<20} addr {:<5} {:?}", node.id, node.display_name(), node.address, node.role);
    }
    println!("{}", "Messages:".bold());
    for message in engine.messages() {
        let cycle = if message.is_periodic() {
            format!("{} ms", message.cycle_time_ms)
        } else {
            "on demand".to_string()
        };
        println!(
            "  {:#010x} {:<20} dlc {:<2} {:<10} {}",
            message.id,
            message.name,
            message.length,
            cycle,
            message.node.as_deref().unwrap_or("-").dimmed()
        );
        for signal in &message.signals {
            println!(
                "      {:<18} bit {:<3} len {:<2} x{} +{} {}",
                signal.name, signal.start_bit, signal.bit_length, signal.scale, signal.offset, signal.unit
            );
        }
    }
    Ok(())
}
