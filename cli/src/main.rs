// legap-cli: offline driver for the LE GAP engine
//
// Replays recorded controller traffic and operations against the engine and
// prints the HCI commands and upper-layer notifications it produces.

mod trace;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use legap_core::gap::ad;
use legap_core::gap::topology::{GapRole, COMBO_TABLE, UNSUPPORTED};
use legap_core::gap::ManualTimers;
use legap_core::{
    ControllerCapabilities, GapConfig, GapNotification, GapSubsystem, HciCommand, RecordingSink,
};
use std::path::PathBuf;
use trace::Step;
use tracing::debug;

#[derive(Parser)]
#[command(name = "legap")]
#[command(about = "LE GAP engine trace replay and inspection", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Controller capabilities (JSON)
    #[arg(long, global = true)]
    caps: Option<PathBuf>,

    /// Log engine internals at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON trace of operations, controller events and timer expiries
    Replay {
        trace: PathBuf,
        /// Print commands and notifications as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the role combination table against the controller capabilities
    Table,
    /// Decode an advertising payload given as hex
    ParseAd { hex: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "legap_core=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => GapConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GapConfig::default(),
    };
    let caps = load_caps(cli.caps.as_ref())?;

    match cli.command {
        Commands::Replay { trace, json } => cmd_replay(config, caps, trace, json),
        Commands::Table => cmd_table(&caps),
        Commands::ParseAd { hex } => cmd_parse_ad(&hex),
    }
}

fn load_caps(path: Option<&PathBuf>) -> Result<ControllerCapabilities> {
    let Some(path) = path else {
        return Ok(ControllerCapabilities::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read capabilities {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid capabilities {}", path.display()))
}

fn cmd_replay(
    config: GapConfig,
    caps: ControllerCapabilities,
    path: PathBuf,
    json: bool,
) -> Result<()> {
    let steps = trace::load(&path)?;
    debug!("Loaded {} steps from {}", steps.len(), path.display());
    let sink = RecordingSink::new();
    let timers = ManualTimers::new();
    let mut gap = GapSubsystem::new(config, caps, Box::new(sink.clone()), Box::new(timers.clone()))
        .context("Failed to start engine")?;

    if !json {
        println!(
            "{} ({} steps)",
            format!("Replaying {}", path.display()).bold(),
            steps.len()
        );
        println!();
    }

    let mut failures = 0usize;
    for (i, step) in steps.into_iter().enumerate() {
        match step {
            Step::Op(op) => {
                let label = format!("{:?}", op);
                if let Some(result) = op.apply(&mut gap) {
                    match result {
                        Ok(status) if !json => {
                            println!("{:>4} {} {} → {:?}", i, "op".bright_blue(), label, status)
                        }
                        Err(e) => {
                            failures += 1;
                            if json {
                                println!(
                                    "{}",
                                    serde_json::json!({ "step": i, "error": e.to_string(), "status": e.status() })
                                );
                            } else {
                                println!("{:>4} {} {} → {}", i, "op".bright_blue(), label, e.to_string().red());
                            }
                        }
                        Ok(_) => {}
                    }
                } else if !json {
                    println!("{:>4} {} {}", i, "op".bright_blue(), label);
                }
            }
            Step::Fire { fire } => match timers.fire(fire) {
                Some(event) => {
                    if !json {
                        println!("{:>4} {} {:?}", i, "timer".yellow(), fire);
                    }
                    gap.dispatch(event);
                }
                None => {
                    if !json {
                        println!("{:>4} {} {:?} not running", i, "timer".yellow(), fire);
                    }
                }
            },
            Step::Event(event) => {
                if !json {
                    println!("{:>4} {} {}", i, "event".magenta(), serde_json::to_string(&event)?);
                }
                gap.dispatch(event);
            }
        }

        print_commands(&sink.take(), json)?;
        print_notifications(&gap.take_notifications(), json)?;
    }

    if !json {
        println!();
        println!("{}", "Final state".bold());
        println!("  Discoverability: {:?}", gap.read_discoverability());
        println!("  Connectability:  {:?}", gap.read_connectability());
        println!("  Active roles:    {:?}", gap.topology().active_roles());
        println!("  Inquiry DB:      {} devices", gap.inquiry_db().len());
        println!("  Sync queue:      {}", gap.sync().queue_len());
    }

    if failures > 0 && !json {
        println!("{} {} operation(s) failed", "!".red(), failures);
    }
    Ok(())
}

fn print_commands(commands: &[HciCommand], json: bool) -> Result<()> {
    for command in commands {
        let line = serde_json::to_string(command)?;
        if json {
            println!("{}", line);
        } else {
            println!("       {} {}", "→ hci".bright_green(), line.dimmed());
        }
    }
    Ok(())
}

fn print_notifications(notifications: &[GapNotification], json: bool) -> Result<()> {
    for notification in notifications {
        let line = serde_json::to_string(notification)?;
        if json {
            println!("{}", line);
        } else {
            println!("       {} {}", "← app".bright_cyan(), line);
        }
    }
    Ok(())
}

fn cmd_table(caps: &ControllerCapabilities) -> Result<()> {
    println!("{}", "LE role combinations".bold());
    println!("  {} supported   {} missing in controller   {} never", "●".green(), "○".yellow(), "·".dimmed());
    println!();

    print!("{:>16}", "");
    for role in GapRole::ALL {
        print!(" {:>3}", role as u8);
    }
    println!();

    let mut rows = vec![("alone".to_string(), COMBO_TABLE[0])];
    for role in GapRole::ALL {
        rows.push((format!("{:?}", role), COMBO_TABLE[role as usize]));
    }

    for (name, row) in rows {
        print!("{:>16}", name);
        for bit in row {
            let cell = if bit == UNSUPPORTED {
                "·".dimmed()
            } else if caps.supports_state(bit) {
                "●".green()
            } else {
                "○".yellow()
            };
            print!(" {:>3}", cell);
        }
        println!();
    }
    Ok(())
}

fn cmd_parse_ad(input: &str) -> Result<()> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let data = hex::decode(&compact).context("Payload is not valid hex")?;
    if data.is_empty() {
        bail!("Empty payload");
    }

    let valid = ad::is_valid(&data);
    println!(
        "{} ({} bytes) {}",
        "Advertising data".bold(),
        data.len(),
        if valid { "✓".green() } else { "✗ malformed".red() }
    );

    for (ad_type, value) in ad::fields(&data) {
        println!(
            "  {} 0x{:02x} {:<24} {}",
            "•".bright_green(),
            ad_type,
            ad_type_name(ad_type),
            hex::encode(value).bright_yellow()
        );
        if ad_type == ad::AD_TYPE_FLAGS {
            if let Some(flags) = value.first() {
                print_flags(*flags);
            }
        }
    }
    Ok(())
}

fn ad_type_name(ad_type: u8) -> &'static str {
    match ad_type {
        0x01 => "Flags",
        0x02 => "16-bit UUIDs (partial)",
        0x03 => "16-bit UUIDs",
        0x08 => "Shortened name",
        0x09 => "Complete name",
        0x0A => "TX power",
        0x16 => "Service data",
        0x19 => "Appearance",
        0x2E => "Resolvable set id",
        0xFF => "Manufacturer data",
        _ => "",
    }
}

fn print_flags(flags: u8) {
    let names = [
        (ad::FLAG_LE_LIMITED_DISC, "LE limited discoverable"),
        (ad::FLAG_LE_GENERAL_DISC, "LE general discoverable"),
        (ad::FLAG_BREDR_NOT_SUPPORTED, "BR/EDR not supported"),
        (ad::FLAG_SIMULTANEOUS_CONTROLLER, "Simultaneous LE/BR/EDR (controller)"),
        (ad::FLAG_SIMULTANEOUS_HOST, "Simultaneous LE/BR/EDR (host)"),
    ];
    for (bit, name) in names {
        if flags & bit != 0 {
            println!("      {}", name.dimmed());
        }
    }
}
