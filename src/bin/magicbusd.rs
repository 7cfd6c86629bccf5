//! magicbusd — a small demonstrator process driven by a [`ProcessBus`].
//!
//! Walks the bus through `ENTER -> IDLE -> RUN`, then blocks the main
//! thread until something external transitions it to `EXITED` (another
//! thread calling `restart`/`graceful`, or the process simply being
//! killed). Wiring an actual OS signal handler to request that transition
//! is left to a caller that needs it — see the design notes on why signal
//! dispatch isn't part of this crate.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use magicbus::{ListenerError, Payload, ProcessBus};

#[derive(Parser)]
#[command(name = "magicbusd")]
#[command(about = "Demonstrator process driven by a ProcessBus state machine")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short = 'V', long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enter RUN and block until the bus reaches EXITED.
    Run {
        /// Seconds between heartbeat publishes on the `main` channel while blocked.
        #[arg(short, long, default_value_t = 1.0)]
        interval: f64,
    },
    /// Walk the full lifecycle once (IDLE -> RUN -> IDLE -> EXITED) and exit.
    Smoke,
    /// Transition straight to STATE, failing loudly if it isn't reachable
    /// from the bus's current state instead of silently stopping short —
    /// useful for catching a typo'd state name from a script.
    Goto {
        state: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let result = match cli.command {
        Commands::Run { interval } => run(interval),
        Commands::Smoke => smoke(),
        Commands::Goto { state } => goto(state),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        if cli.verbose || cli.debug {
            for cause in e.chain().skip(1) {
                eprintln!("  Caused by: {cause}");
            }
        }
        std::process::exit(1);
    }
}

fn run(interval: f64) -> Result<()> {
    let bus = ProcessBus::new();

    bus.subscribe(
        "main",
        "magicbusd::heartbeat",
        None,
        |_: &Payload| -> Result<(), ListenerError> {
            log::debug!("heartbeat");
            Ok(())
        },
    );

    bus.transition("IDLE")?;
    bus.transition("RUN")?;
    log::info!("magicbusd running, state = {:?}", bus.state());

    bus.block(Duration::from_secs_f64(interval), false)?;
    log::info!("magicbusd shut down, state = {:?}", bus.state());
    Ok(())
}

fn smoke() -> Result<()> {
    let bus = ProcessBus::new();
    bus.transition("IDLE")?;
    bus.transition("RUN")?;
    bus.transition("IDLE")?;
    bus.transition("EXITED")?;
    log::info!("smoke test reached state = {:?}", bus.state());
    Ok(())
}

fn goto(state: String) -> Result<()> {
    let bus = ProcessBus::new();
    bus.transition_checked(state.as_str())?;
    log::info!("reached state = {:?}", bus.state());
    Ok(())
}
