use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use command_link::config::LinkConfig;
use command_link::driver::{DeviceEvent, Driver};
use command_link::gamepad::SharedGamepads;
use command_link::link::connection::ConnectionActor;
use command_link::link::link_error::Direction;
use command_link::link::observer::LinkObserver;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, trace, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Sends every line typed on the console as a command to the remote device, and prints whatever
///  the device sends back. With `--gamepad`, a connected gamepad drives the device as well,
///  until the console input ends.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:9000")]
    local: SocketAddr,

    #[clap(long, default_value = "192.168.10.1:8889")]
    remote: SocketAddr,

    #[clap(long, default_value_t = 1518)]
    receive_buffer_size: usize,

    /// drop datagrams that do not come from the remote address
    #[clap(long, default_value_t = false)]
    filter_by_source: bool,

    /// poll a gamepad and send its buttons and sticks as commands (needs the `gamepad` feature)
    #[clap(long, default_value_t = false)]
    gamepad: bool,

    #[clap(long, default_value_t = 10)]
    poll_interval_ms: u64,

    /// write log output to this file in addition to stderr
    #[clap(long)]
    log_file: Option<PathBuf>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const PROMPT: &str = "> ";

struct ConsoleObserver;

impl LinkObserver for ConsoleObserver {
    fn on_message(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}\n{}", text, PROMPT);
        let _ = stdout.flush();
    }

    fn on_error(&self, direction: Direction, message: &str) {
        eprintln!("{} error: {}", direction, message);
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    let file_layer = match &args.log_file {
        Some(path) => Some(fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(File::create(path)?))),
        None => None,
    };

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .ok();
    Ok(())
}

#[cfg(feature = "gamepad")]
fn start_gamepad_input(device_events: mpsc::Sender<DeviceEvent>, config: &LinkConfig) -> anyhow::Result<SharedGamepads> {
    command_link::gamepad::spawn_gilrs_backend(device_events, config.poll_interval)
}

#[cfg(not(feature = "gamepad"))]
fn start_gamepad_input(_device_events: mpsc::Sender<DeviceEvent>, _config: &LinkConfig) -> anyhow::Result<SharedGamepads> {
    anyhow::bail!("this binary was built without gamepad support, rebuild with `--features gamepad`")
}

/// Sends console lines until the console input ends
async fn run_console(actor: &ConnectionActor) -> anyhow::Result<()> {
    print!("{}", PROMPT);
    std::io::stdout().flush()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            print!("{}", PROMPT);
            std::io::stdout().flush()?;
            continue;
        }

        trace!("command: {}", line);
        actor.send(line.to_string());
    }
    Ok(())
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = LinkConfig::new(args.local, args.remote);
    config.receive_buffer_size = args.receive_buffer_size;
    config.filter_by_source = args.filter_by_source;
    config.poll_interval = Duration::from_millis(args.poll_interval_ms);

    let actor = ConnectionActor::bind(&config, Arc::new(ConsoleObserver)).await?;
    info!("sending commands to {:?}", actor.remote_addr());

    if args.gamepad {
        let (event_sender, event_receiver) = mpsc::channel(16);
        let gamepads = start_gamepad_input(event_sender, &config)?;
        let driver = Driver::new(gamepads, event_receiver, None, &config);

        select! {
            _ = driver.run(&actor) => {}
            result = run_console(&actor) => result?,
        }
    }
    else {
        run_console(&actor).await?;
    }

    // give queued commands a chance to go out before the runtime shuts down
    for _ in 0..100 {
        if actor.pending_sends() == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    warn!("{} commands were still pending on exit", actor.pending_sends());
    Ok(())
}
