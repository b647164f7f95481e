use clap::Parser;
use serial_bridge::config::ConfigLoader;
use serial_bridge::logging::init_tracing;
use serial_bridge::{Bridge, BridgeResult};
use std::future::Future;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

/// How often the stdin loop checks that the bridge still owns the port.
const LIVENESS_CHECK: Duration = Duration::from_millis(250);

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Bridge a serial device to stdin/stdout.",
    long_about = "Claims the serial port, writes every stdin line to the device and prints every line the device sends. A newer serial-bridge started for the same port takes the device over, and this one exits."
)]
struct Args {
    /// Path to a TOML config file. Overrides the usual lookup.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port to open, e.g. /dev/ttyACM0 or COM3.
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long)]
    baud: Option<u32>,

    /// Log level or RUST_LOG-style filter.
    #[arg(long)]
    log_level: Option<String>,
}

/// Why the stdin loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    StdinClosed,
    Interrupted,
    /// The forwarder stopped: taken over or failed.
    Displaced,
}

/// Read stdin on a plain thread. A blocking read parked on the runtime's
/// blocking pool would hold up runtime shutdown until the next line.
fn spawn_stdin_reader() -> io::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Forward `lines` to the device until stdin closes, `interrupt` fires or
/// the bridge loses the port.
async fn pump(
    bridge: &Bridge,
    mut lines: mpsc::UnboundedReceiver<String>,
    interrupt: impl Future<Output = ()>,
    check_every: Duration,
) -> BridgeResult<Exit> {
    tokio::pin!(interrupt);
    let mut liveness = time::interval(check_every);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => bridge.write(format!("{line}\n"))?,
                None => return Ok(Exit::StdinClosed),
            },
            _ = &mut interrupt => return Ok(Exit::Interrupted),
            _ = liveness.tick() => {
                if !bridge.is_running() {
                    return Ok(Exit::Displaced);
                }
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Ctrl-C handling unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    let mut config = loader.into_config();
    if let Some(port) = args.port {
        config.serial.port = Some(port);
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging);
    let settings = config.port_settings()?;
    info!("Bridging {} at {}", settings.port, settings.line);

    let bridge = Bridge::new(settings);
    bridge.register_handler(None, |line| print!("{line}"));
    bridge.run_serial()?;

    let lines = spawn_stdin_reader()?;
    match pump(&bridge, lines, ctrl_c(), LIVENESS_CHECK).await? {
        Exit::StdinClosed => info!("stdin closed, shutting down"),
        Exit::Interrupted => info!("Interrupted, shutting down"),
        Exit::Displaced => warn!("Forwarder stopped, exiting"),
    }

    bridge.shutdown()?;
    Ok(())
}
