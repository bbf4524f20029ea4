use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quadrotor_runtime::messages::{RuntimeHealth, Telemetry};
use quadrotor_runtime::{config, runtime};

#[derive(Parser, Debug)]
#[command(name = "quadrotor-runtime", about = "Attitude estimation and ESC actuation core")]
struct Opts {
    /// I2C bus device
    #[arg(long, default_value = config::DEFAULT_BUS_PATH)]
    bus: String,

    /// Fusion update rate in Hz
    #[arg(long, default_value_t = config::SAMPLE_HZ)]
    sample_hz: f64,

    /// Use the 9-axis MPU-9250 instead of the ADXL345 + ITG-3200 pair
    #[arg(long)]
    nine_axis: bool,

    /// Number of ESC channels
    #[arg(long, default_value_t = config::MOTOR_COUNT)]
    motors: usize,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let opts = Opts::parse();
    let runtime_opts = runtime::RuntimeOptions {
        bus_path: opts.bus,
        sample_hz: opts.sample_hz,
        nine_axis: opts.nine_axis,
        motors: opts.motors,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (telemetry_tx, telemetry_rx) = watch::channel(Telemetry::default());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping");
            let _ = shutdown_tx.send(true);
        }
    });
    tokio::spawn(print_telemetry(telemetry_rx));

    if let Err(e) = runtime::run(runtime_opts, shutdown_rx, telemetry_tx).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

/// Emit the latest attitude once a second while the runtime is up
async fn print_telemetry(rx: watch::Receiver<Telemetry>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let telemetry = *rx.borrow();
        if telemetry.health == RuntimeHealth::Running {
            match serde_json::to_string(&telemetry) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("telemetry encode error: {}", e),
            }
        }
    }
}
