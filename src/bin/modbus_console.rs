/// Modbus Console
///
/// Interactive client for exercising a Modbus device by hand. Reads its
/// connection settings from `appsettings.json` (or the file given with
/// `--config`), connects over TCP or RTU, then loops reading operation
/// codes from stdin.
///
/// Addresses are entered 0-based, as they go on the wire, and printed
/// 1-based, as device manuals list them.

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use modbus_engine::config::DEFAULT_SETTINGS_FILE;
use modbus_engine::protocol::UNSUPPORTED_FUNCTIONS;
use modbus_engine::utils::format::display_address;
use modbus_engine::{
    AppSettings, CallbackLogger, Connection, ModbusClient, ModbusFunction, RtuTransport, TcpTransport,
    TransportKind,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive Modbus TCP/RTU client console", long_about = None)]
struct Args {
    /// Settings file (JSON or YAML)
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    /// Override ClientSettings:IP
    #[arg(long)]
    ip: Option<String>,

    /// Override ClientSettings:Port
    #[arg(long)]
    port: Option<u16>,

    /// Use Modbus RTU on this serial port
    #[arg(long, value_name = "PORT")]
    serial: Option<String>,

    /// Override ClientSettings:BaudRate
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Override ClientSettings:UnitId
    #[arg(short, long)]
    unit_id: Option<u8>,

    /// Print every request and response
    #[arg(long)]
    trace_transactions: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "warn", env = "RUST_LOG")]
    log_level: String,
}

/// What an entered operation code asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Quit,
    PrintFunctions,
    Execute(ModbusFunction),
    /// A Modbus function the engine recognises but does not implement
    NotImplemented(u8),
    Unsupported,
    Invalid,
}

fn parse_command(input: &str) -> Command {
    let input = input.trim();
    // Read Device Identification is listed as 43/14
    let code = input.split('/').next().unwrap_or_default();

    match code.parse::<u16>() {
        Ok(0) => Command::Quit,
        Ok(100) => Command::PrintFunctions,
        Ok(code) => match u8::try_from(code) {
            Ok(code) => match ModbusFunction::from_u8(code) {
                Ok(function) => Command::Execute(function),
                Err(_) if UNSUPPORTED_FUNCTIONS.iter().any(|(c, _)| *c == code) => Command::NotImplemented(code),
                Err(_) => Command::Unsupported,
            },
            Err(_) => Command::Unsupported,
        },
        Err(_) => Command::Invalid,
    }
}

fn print_functions_list() {
    println!("\nFUNCTIONS");
    println!("1 - Read coils");
    println!("2 - Read discrete inputs");
    println!("3 - Read holding registers");
    println!("4 - Read input registers");
    println!("5 - Write single coil");
    println!("6 - Write single register");
    println!("8 - Diagnostics (Serial Line only - not yet supported)");
    println!("11 - Get comm event counter (Serial Line only - not yet supported)");
    println!("15 - Write multiple coils");
    println!("16 - Write multiple registers");
    println!("17 - Report Server ID (Serial Line only - not yet supported)");
    println!("22 - Mask write register (not yet supported)");
    println!("23 - Read/write multiple registers");
    println!("43/14 - Read device identification (not yet supported)");
    println!("0 - Quit");
}

/// Coil input: `1` is ON, any other number OFF
fn parse_coil(token: &str) -> Result<bool> {
    let value: i64 = token.trim().parse().with_context(|| format!("'{}' is not a number", token.trim()))?;
    Ok(value == 1)
}

/// Parse exactly `count` values separated by spaces or commas
fn parse_values<T, F>(line: &str, count: usize, parse: F) -> Result<Vec<T>>
where
    F: Fn(&str) -> Result<T>,
{
    let values = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(parse)
        .collect::<Result<Vec<T>>>()?;

    if values.len() != count {
        bail!("Expected {} values, got {}", count, values.len());
    }
    Ok(values)
}

fn parse_number<T>(token: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    token.trim().parse::<T>().with_context(|| format!("'{}' is not a valid number", token.trim()))
}

/// Line-oriented prompts over an async reader
struct Prompt<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> Prompt<R> {
    fn new(reader: R) -> Self {
        Self { lines: reader.lines() }
    }

    /// Next input line; `None` at end of input
    async fn next_line(&mut self, label: &str) -> Result<Option<String>> {
        print!("{}", label);
        std::io::stdout().flush()?;
        Ok(self.lines.next_line().await?)
    }

    async fn line(&mut self, label: &str) -> Result<String> {
        self.next_line(label).await?.ok_or_else(|| anyhow!("Unexpected end of input"))
    }

    async fn number<T>(&mut self, label: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        parse_number(&self.line(label).await?)
    }
}

fn range_label(address: u16, count: usize) -> String {
    let last = address as usize + count.max(1) - 1;
    format!(
        "{}-{} (0x{:04X}-0x{:04X})",
        display_address(address, 0), last + 1, address, last
    )
}

async fn execute<C, R>(client: &C, prompt: &mut Prompt<R>, function: ModbusFunction) -> Result<()>
where
    C: ModbusClient + ?Sized,
    R: AsyncBufRead + Unpin,
{
    match function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            let (what, label) = if function == ModbusFunction::ReadCoils {
                ("coil", "Coil")
            } else {
                ("discrete input", "Discrete input")
            };
            let address: u16 = prompt.number(&format!("Start {} address: ", what)).await?;
            let quantity: u16 = prompt.number(&format!("Number of {}s: ", what)).await?;

            println!("\nReading {}s...", what);
            let bits = if function == ModbusFunction::ReadCoils {
                client.read_coils(address, quantity).await?
            } else {
                client.read_discrete_inputs(address, quantity).await?
            };
            for (i, bit) in bits.iter().enumerate() {
                println!("{} {}: {}", label, display_address(address, i), bit);
            }
        },
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            let address: u16 = prompt.number("Start register address: ").await?;
            let quantity: u16 = prompt.number("Number of registers: ").await?;

            let (values, label) = if function == ModbusFunction::ReadHoldingRegisters {
                println!("\nReading holding registers...");
                (client.read_holding_registers(address, quantity).await?, "Holding register")
            } else {
                println!("\nReading input registers...");
                (client.read_input_registers(address, quantity).await?, "Input register")
            };
            for (i, value) in values.iter().enumerate() {
                println!("{} {}: {}", label, display_address(address, i), value);
            }
        },
        ModbusFunction::WriteSingleCoil => {
            let address: u16 = prompt.number("Coil to write address: ").await?;
            let value = parse_coil(&prompt.line(&format!(
                "\nWrite a value in coil {} (0x{:04X}): ", display_address(address, 0), address
            )).await?)?;

            println!("Writing coil...");
            client.write_single_coil(address, value).await?;
            println!("Done!");
        },
        ModbusFunction::WriteSingleRegister => {
            let address: u16 = prompt.number("Register to write address: ").await?;
            let value: u16 = prompt.number(&format!(
                "\nWrite a value in register {} (0x{:04X}): ", display_address(address, 0), address
            )).await?;

            println!("Writing register...");
            client.write_single_register(address, value).await?;
            println!("Done!");
        },
        ModbusFunction::WriteMultipleCoils => {
            let address: u16 = prompt.number("Start coil to write address: ").await?;
            let count: usize = prompt.number("Number of coils to write: ").await?;
            let line = prompt.line(&format!(
                "\nWrite {} values in coils {} on one line: ", count, range_label(address, count)
            )).await?;
            let values = parse_values(&line, count, parse_coil)?;

            println!("Writing coils...");
            client.write_multiple_coils(address, &values).await?;
            println!("Done!");
        },
        ModbusFunction::WriteMultipleRegisters => {
            let address: u16 = prompt.number("Start register to write address: ").await?;
            let count: usize = prompt.number("Number of registers to write: ").await?;
            let line = prompt.line(&format!(
                "\nWrite {} values in registers {} on one line: ", count, range_label(address, count)
            )).await?;
            let values = parse_values(&line, count, parse_number::<u16>)?;

            println!("Writing holding registers...");
            client.write_multiple_registers(address, &values).await?;
            println!("Done!");
        },
        ModbusFunction::ReadWriteMultipleRegisters => {
            let read_address: u16 = prompt.number("Start register to read address: ").await?;
            let read_quantity: u16 = prompt.number("Number of registers: ").await?;
            let write_address: u16 = prompt.number("Start register to write address: ").await?;
            let count: usize = prompt.number("Number of registers to write: ").await?;
            let line = prompt.line(&format!(
                "\nWrite {} values in registers {} on one line: ", count, range_label(write_address, count)
            )).await?;
            let values = parse_values(&line, count, parse_number::<u16>)?;

            println!("Writing and reading holding registers...");
            let registers = client
                .read_write_multiple_registers(read_address, read_quantity, write_address, &values)
                .await?;
            for (i, value) in registers.iter().enumerate() {
                println!("Holding register {}: {}", display_address(read_address, i), value);
            }
            println!("Done!");
        },
    }
    Ok(())
}

async fn connect(settings: &AppSettings, trace_transactions: bool) -> Result<Box<dyn ModbusClient>> {
    let client = &settings.client_settings;
    let logger = if trace_transactions { CallbackLogger::console() } else { CallbackLogger::disabled() };

    let connection: Box<dyn ModbusClient> = match client.transport {
        TransportKind::Tcp => {
            let address = settings.tcp_address();
            let transport = TcpTransport::connect(address.clone(), settings.timeout())
                .await
                .with_context(|| format!("Failed to connect to {}", address))?
                .with_packet_logging(client.packet_logging);
            println!("Connected to Modbus server {}(port: {})", client.ip, client.port);
            Box::new(
                Connection::new(transport)
                    .with_unit_id(client.unit_id)
                    .with_timeout(settings.timeout())
                    .with_logger(logger),
            )
        },
        TransportKind::Rtu => {
            let serial = settings.serial_config();
            let transport = RtuTransport::open(serial.clone())
                .with_context(|| format!("Failed to open {}", serial.port))?
                .with_packet_logging(client.packet_logging);
            println!("Opened serial port {} at {} baud", serial.port, serial.baud_rate);
            Box::new(
                Connection::new(transport)
                    .with_unit_id(client.unit_id)
                    .with_timeout(settings.timeout())
                    .with_logger(logger),
            )
        },
    };
    Ok(connection)
}

fn load_settings(args: &Args) -> Result<AppSettings> {
    let mut settings = if args.config.exists() {
        AppSettings::load(&args.config)?
    } else {
        warn!("{} not found, using default settings", args.config.display());
        AppSettings::default()
    };

    let client = &mut settings.client_settings;
    if let Some(ip) = &args.ip {
        client.ip = ip.clone();
    }
    if let Some(port) = args.port {
        client.port = port;
    }
    if let Some(serial) = &args.serial {
        client.transport = TransportKind::Rtu;
        client.serial_port = serial.clone();
    }
    if let Some(baud_rate) = args.baud_rate {
        client.baud_rate = baud_rate;
    }
    if let Some(unit_id) = args.unit_id {
        client.unit_id = unit_id;
    }

    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let settings = load_settings(&args)?;
    info!("{}", modbus_engine::info());

    println!("Application started.");
    let client = connect(&settings, args.trace_transactions).await?;
    print_functions_list();

    let mut prompt = Prompt::new(BufReader::new(tokio::io::stdin()));
    loop {
        println!("\nWhich operation do you want to execute? (100 to print functions list)");
        let Some(line) = prompt.next_line("Type operation code: ").await? else {
            break;
        };
        println!();

        match parse_command(&line) {
            Command::Quit => break,
            Command::PrintFunctions => print_functions_list(),
            Command::Execute(function) => {
                if let Err(e) = execute(client.as_ref(), &mut prompt, function).await {
                    println!("Error: {:#}", e);
                }
            },
            Command::NotImplemented(code) => {
                let name = UNSUPPORTED_FUNCTIONS
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map_or("Unknown Function", |(_, name)| *name);
                println!("{} ({}) is not yet supported.", name, code);
            },
            Command::Unsupported => println!("Unsupported function."),
            Command::Invalid => println!("Invalid selection."),
        }
    }

    let stats = client.get_stats().await;
    info!(
        "Session finished: {} requests, {} responses, {} errors",
        stats.requests_sent, stats.responses_received, stats.errors
    );
    client.close().await?;
    Ok(())
}
