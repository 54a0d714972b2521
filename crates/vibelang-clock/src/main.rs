//! vibe-clock - JACK transport bridge for VibeLang
//!
//! Follows the JACK transport from the terminal: prints position, sample
//! rate, state changes and loop wraps, and reads commands from stdin.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{select, tick, unbounded, Receiver};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use vibelang_clock::{
    config::Config,
    is_jack_running, Bridge, Command, JackServer, LoopMode, Outlets, SimulatedClock, SimulatedServer, TransportServer,
    TransportState,
};

#[derive(Parser)]
#[command(name = "vibe-clock")]
#[command(author, version, about = "JACK transport bridge for VibeLang", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (default: ~/.config/vibe-clock/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JACK client name
    #[arg(long)]
    client_name: Option<String>,

    /// Transport poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Loop-end crossing detection
    #[arg(long, value_enum)]
    loop_mode: Option<LoopModeArg>,

    /// Run against an in-process simulated transport instead of JACK
    #[arg(long)]
    simulate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file
    Init,
    /// Show the configuration file path
    ConfigPath,
    /// Check whether a JACK server is running
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum LoopModeArg {
    Alternating,
    Edge,
}

impl From<LoopModeArg> for LoopMode {
    fn from(arg: LoopModeArg) -> Self {
        match arg {
            LoopModeArg::Alternating => LoopMode::Alternating,
            LoopModeArg::Edge => LoopMode::EdgeTriggered,
        }
    }
}

/// Prints bridge output, one value per line.
struct StdoutOutlets;

impl Outlets for StdoutOutlets {
    fn position_ms(&mut self, ms: f64) {
        println!("position {:.1}", ms);
    }

    fn sample_rate(&mut self, rate: u32) {
        println!("samplerate {}", rate);
    }

    fn transport_state(&mut self, ordinal: u8) {
        println!("state {} ({})", ordinal, TransportState::from_ordinal(ordinal));
    }

    fn loop_wrap(&mut self) {
        println!("loop");
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            return Ok(());
        }
        Some(Commands::ConfigPath) => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            return Ok(());
        }
        Some(Commands::Status) => {
            if is_jack_running() {
                println!("JACK is running");
            } else {
                println!("JACK is not running");
            }
            return Ok(());
        }
        None => {}
    }

    // Load config
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_default(),
    };

    // Apply CLI overrides
    if let Some(name) = cli.client_name {
        config.client.client_name = name;
    }
    if let Some(ms) = cli.poll_ms {
        config.host.poll_interval_ms = ms.max(1);
    }
    if let Some(mode) = cli.loop_mode {
        config.looping.mode = mode.into();
    }
    config.validate()?;

    run(config, cli.simulate)
}

fn run(config: Config, simulate: bool) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    // The simulated clock runs until `_clock` is dropped at the end of `run`.
    let (server, _clock): (Arc<dyn TransportServer>, Option<SimulatedClock>) = if simulate {
        let server = SimulatedServer::new(48000).with_host_audio(config.host.audio_via_jack);
        let clock = server.spawn_clock(256);
        log::info!("Running against the simulated transport at 48000 Hz");
        (Arc::new(server), Some(clock))
    } else {
        if !is_jack_running() {
            log::info!("JACK is not running yet, waiting for it...");
        }
        (Arc::new(JackServer::new(config.host.audio_via_jack)), None)
    };

    let bridge = Bridge::new(server, &config)?;
    let commands = spawn_stdin_reader()?;
    let ticker = tick(config.poll_interval());
    let mut outlets = StdoutOutlets;

    log::info!("Commands: locate <ms>, locateframe <n>, start, stop, loop <ms> <ms>, loopframe <n> <n>, unloop, freewheel <0|1>, bang");

    while !shutdown.load(Ordering::Relaxed) {
        if !step(&bridge, &commands, &ticker, &mut outlets) {
            log::info!("stdin closed, exiting");
            break;
        }
    }

    let dropped = bridge.dropped_loop_wraps();
    if dropped > 0 {
        log::warn!("{} loop wrap events were dropped", dropped);
    }
    bridge.close();
    log::info!("Bye");
    Ok(())
}

/// Serve one command or one poll tick, then forward pending loop wraps.
///
/// Polling runs off its own ticker so a busy command stream cannot starve
/// it. Returns false once the command sender is gone.
fn step(bridge: &Bridge, commands: &Receiver<Command>, ticker: &Receiver<Instant>, outlets: &mut dyn Outlets) -> bool {
    let open = select! {
        recv(ticker) -> _ => {
            bridge.poll(outlets);
            true
        },
        recv(commands) -> command => match command {
            Ok(command) => {
                bridge.handle(command, outlets);
                true
            }
            Err(_) => false,
        },
    };
    bridge.drain_loop_wraps(outlets);
    open
}

/// Read commands from stdin on a background thread.
fn spawn_stdin_reader() -> io::Result<Receiver<Command>> {
    let (tx, rx) = unbounded();
    thread::Builder::new().name("vibe-clock-stdin".to_string()).spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("{}", e),
            }
        }
    })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vibelang_clock::{BridgeEvent, ConnectionSettings};

    fn connected_bridge(server: &SimulatedServer) -> Bridge {
        let settings = ConnectionSettings {
            client_name: "main-test".to_string(),
            retry_interval: Duration::from_millis(10),
            reconnect_on_shutdown: false,
            loop_mode: LoopMode::Alternating,
            wrap_queue: 16,
        };
        let bridge = Bridge::with_settings(Arc::new(server.clone()), settings).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !bridge.is_connected() {
            assert!(Instant::now() < deadline, "timed out waiting for connection");
            thread::sleep(Duration::from_millis(2));
        }
        bridge
    }

    #[test]
    fn test_busy_command_stream_still_polls() {
        let server = SimulatedServer::new(48000);
        let bridge = connected_bridge(&server);
        let (tx, commands) = unbounded();
        let ticker = tick(Duration::from_millis(1));
        let mut events: Vec<BridgeEvent> = Vec::new();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !events.iter().any(|e| matches!(e, BridgeEvent::Position(_))) {
            assert!(Instant::now() < deadline, "command stream starved polling");
            // Keep a command waiting on every step
            tx.send(Command::Unloop).unwrap();
            assert!(step(&bridge, &commands, &ticker, &mut events));
        }
        bridge.close();
    }

    #[test]
    fn test_closed_command_stream_ends_loop() {
        let server = SimulatedServer::new(48000);
        let bridge = connected_bridge(&server);
        let (tx, commands) = unbounded::<Command>();
        drop(tx);
        let ticker = tick(Duration::from_secs(60));
        let mut events: Vec<BridgeEvent> = Vec::new();

        assert!(!step(&bridge, &commands, &ticker, &mut events));
        bridge.close();
    }
}
