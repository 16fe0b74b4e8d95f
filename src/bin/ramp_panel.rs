use std::sync::Arc;

use clap::Parser;
use daq_ramp::{control_interface, parse_command, ControlCommand, PanelConfig, RampEngine, SimulatedDaq};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Builder;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(author, version, about = "Analog output voltage ramp panel")]
struct Args {
    /// Path to config TOML
    #[arg(long, default_value = "ramp_panel.toml")]
    config: String,

    /// Number of simulated devices to offer on discovery (overrides config)
    #[arg(long)]
    devices: Option<usize>,
}

const HELP: &str = "commands: discover | select N | initiate START TARGET RATE | up | down | \
quick-up V | quick-down V | ground | pause | resume | actions | status | quit  (use - for an empty field)";

fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let runtime = Builder::new_multi_thread()
        .thread_name("ramp-panel")
        .enable_all()
        .worker_threads(2)
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = PanelConfig::load_or_default(&args.config);
    let settings = config.engine_settings()?;
    let device_count = args.devices.unwrap_or(config.simulation.device_count);
    info!("Starting ramp panel with {} simulated device(s)", device_count);

    let daq = Arc::new(SimulatedDaq::new(device_count));
    let engine = Arc::new(RampEngine::new(daq, settings));

    // Status feed
    let mut status_rx = engine.subscribe();
    let status_task = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(update) => println!("[{}] {}", update.state, update.label),
                Err(RecvError::Lagged(n)) => warn!("Status display lagged by {} updates", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (control_tx, control_rx) = mpsc::channel(10);
    let control_engine = engine.clone();
    let control_task = tokio::spawn(async move {
        if let Err(e) = control_interface(control_rx, control_engine).await {
            error!("Control interface error: {}", e);
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "help" => println!("{}", HELP),
            "actions" => println!("{:?}", engine.available_actions().await),
            "status" => println!(
                "{} at {:.3} V (code {})",
                engine.state(),
                engine.current_voltage(),
                engine.current_code()
            ),
            _ => match parse_command(line) {
                Ok(command) => {
                    let quit = command == ControlCommand::Quit;
                    if control_tx.send(command).await.is_err() {
                        break;
                    }
                    if quit {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            },
        }
    }

    // Clean up
    drop(control_tx);
    if let Err(e) = control_task.await {
        error!("Control task failed: {}", e);
    }
    drop(engine);
    status_task.abort();
    info!("Ramp panel closed");
    Ok(())
}
