/// Modbus TCP Device Simulator
///
/// Serves a simulated device on a TCP port so `modbus_console` (or any
/// other Modbus TCP client) has something to talk to. The register bank is
/// seeded with recognisable values:
///
/// - Holding registers 0-9: 0, 10, 20, ... 90
/// - Input registers 0-9: 1000-1009
/// - Coils and discrete inputs 0-7: alternating ON/OFF

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modbus_engine::{DeviceSimulator, ModbusRegisterBank, ModbusResult};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated Modbus TCP device", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5020")]
    bind: String,

    /// Unit id the device answers to
    #[arg(short, long, default_value_t = 1)]
    unit_id: u8,

    /// Number of addresses in each table
    #[arg(long, default_value_t = 10_000)]
    size: usize,

    /// Delay before every response, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

fn seed(bank: &ModbusRegisterBank) -> ModbusResult<()> {
    let holding: Vec<u16> = (0..10).map(|i| i * 10).collect();
    let input: Vec<u16> = (1000..1010).collect();
    let bits: Vec<bool> = (0..8).map(|i| i % 2 == 0).collect();

    bank.write_10(0, &holding)?;
    bank.set_input_registers(0, &input)?;
    bank.write_0f(0, &bits)?;
    for (address, &bit) in bits.iter().enumerate() {
        bank.set_discrete_input(address as u16, bit)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bank = Arc::new(ModbusRegisterBank::with_size(args.size));
    seed(&bank).context("Failed to seed the register bank")?;

    let device = DeviceSimulator::new(args.unit_id, bank)
        .with_response_delay(Duration::from_millis(args.delay_ms));

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", args.bind))?;

    info!("Simulated device ready: unit {}, {} addresses per table", args.unit_id, args.size);
    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = device.listen(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = device.get_stats().await;
            info!(
                "Stopping: {} connections, {} requests, {} exceptions",
                stats.connections_count, stats.total_requests, stats.exception_responses
            );
        },
    }
    Ok(())
}
