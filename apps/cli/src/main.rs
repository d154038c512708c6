use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use mdt_core::command::data_length;
use mdt_core::{
    BuildConfig, Debugger, DeviceMetadata, LogicalCommand, SerialConnector, build_device_metadata,
    validate,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "MCU memory debug tool", long_about = None)]
struct Args {
    /// Path to the board configuration (TOML)
    #[arg(short, long, default_value = "mdt.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Summarize the device descriptor
    Info,
    /// Validate a command against the descriptor without touching the port
    Check(CommandArgs),
    /// Open the port and run one command
    Exec(CommandArgs),
}

#[derive(ClapArgs, Debug)]
struct CommandArgs {
    /// Command name, e.g. read_mem, write_mem, read_reg, ping
    name: String,

    /// Memory type: ram, flash or eeprom
    #[arg(long)]
    mem: Option<String>,

    /// Target address in hex
    #[arg(long)]
    address: Option<String>,

    /// Number of bytes
    #[arg(long)]
    length: Option<u16>,

    /// Payload as hex digits, no 0x prefix
    #[arg(long)]
    data: Option<String>,
}

impl CommandArgs {
    fn to_command(&self) -> Result<LogicalCommand> {
        let mut command = LogicalCommand::from_parts(
            &self.name,
            self.mem.as_deref(),
            self.address.as_deref(),
            self.length,
            self.data.as_deref(),
        )?;
        if let (None, Some(data)) = (command.length, &command.data) {
            command.length = Some(data_length(data)?);
        }
        Ok(command)
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = BuildConfig::load_from_file(&args.config)?;
    info!(mcu = %config.mcu, platform = %config.platform, "Loaded board configuration");

    match args.action {
        Action::Info => {
            let metadata = load_metadata(&config)?;
            print_summary(&metadata);
        }
        Action::Check(cmd) => {
            let metadata = load_metadata(&config)?;
            let command = cmd.to_command()?;
            let report = validate(&command, &metadata)?;
            println!("{}: OK -> {:?}", command, report.target);
            for advisory in &report.advisories {
                println!("  note: {}", advisory);
            }
        }
        Action::Exec(cmd) => {
            let command = cmd.to_command()?;
            let mut debugger = Debugger::from_config(&config, SerialConnector)?;
            let outcome = debugger
                .open()
                .with_context(|| format!("opening {}", config.port))?;
            if !outcome.is_clean() {
                warn!(?outcome, "Continuing without a clean startup echo");
            }

            let execution = debugger.execute(&command)?;
            debugger.close();

            for exchange in &execution.exchanges {
                match &exchange.response {
                    Ok(frame) => println!("seq {:3}: {}", exchange.sequence, frame),
                    Err(e) => println!("seq {:3}: {}", exchange.sequence, e),
                }
            }
            if !execution.is_success() {
                bail!(
                    "{} failed after {} of {} frames",
                    command.name,
                    execution.exchanges.len(),
                    execution.frames_total
                );
            }
            let data = execution.response_data();
            if !data.is_empty() {
                println!("data: {:02X?}", data);
            }
        }
    }
    Ok(())
}

fn load_metadata(config: &BuildConfig) -> Result<DeviceMetadata> {
    build_device_metadata(&config.mcu, config.platform, &config.descriptor_root)
        .with_context(|| format!("loading descriptor for {}", config.mcu))
}

fn print_summary(metadata: &DeviceMetadata) {
    println!("Device: {}", metadata.device_name);
    println!("Memories:");
    for (name, seg) in &metadata.memories {
        println!(
            "  {:<12} {:<6} 0x{:08X}..0x{:08X}",
            name,
            seg.kind.to_string(),
            seg.start,
            seg.end()
        );
    }
    println!("Modules:");
    for (name, module) in &metadata.modules {
        let registers: usize = module
            .register_groups
            .values()
            .map(|g| g.registers.len())
            .sum();
        println!("  {:<12} {} registers  {}", name, registers, module.caption);
    }
    println!("Interrupts: {}", metadata.interrupts.len());
    println!("Peripherals: {}", metadata.peripherals.len());
}
