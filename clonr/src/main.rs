use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser, Subcommand};
use clonr_core::catalog::{Catalog, Snapshot};
use clonr_core::clone::{
    CloneEvent, CloneOptions, DEFAULT_BLOCK_SIZE, DdTool, DestinationState, Orchestrator, Outcome,
    OutputStream,
};
use clonr_core::platform::HostDevices;
use clonr_core::privilege;
use clonr_core::validate::{ValidationOptions, requires_confirmation, validate_with};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::debug;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "clonr")]
#[command(about = "A safe, interactive whole-disk cloning tool", version)]
struct Cli {
    /// Increase log verbosity (-v for info, -vv for debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone one physical disk onto another, erasing the destination
    Clone {
        /// Index of the disk to copy from (asked interactively if omitted)
        #[arg(short, long)]
        source: Option<u32>,

        /// Index of the disk to overwrite (asked interactively if omitted)
        #[arg(short, long)]
        destination: Option<u32>,

        /// Block size passed to the copy tool, in bytes
        #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u64,

        /// Copy tool to run (must accept dd-style arguments)
        #[arg(long, default_value = "dd")]
        tool: PathBuf,

        /// Allow a destination smaller than the source (only what fits is copied)
        #[arg(long)]
        allow_smaller_destination: bool,
    },
    /// List physical disks and their partitions
    List,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// Presents an interactive menu for the user to select a disk.
fn select_disk(snapshot: &Snapshot, prompt: &str, exclude: Option<u32>) -> Result<u32> {
    let candidates: Vec<_> = snapshot
        .disks()
        .iter()
        .filter(|d| Some(d.index) != exclude)
        .collect();
    if candidates.is_empty() {
        return Err(anyhow!("No disks available to select."));
    }

    let items: Vec<String> = candidates.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(candidates[selection].index)
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn list(snapshot: &Snapshot) {
    if snapshot.is_empty() {
        println!("No physical disks found.");
        return;
    }

    println!("Found {} physical disks:", snapshot.disks().len());
    println!(
        "\n  {:<5} {:<20} {:>11}  {:<25} {}",
        "INDEX", "DEVICE", "SIZE", "MODEL", "BUS"
    );
    println!("  {:-<5} {:-<20} {:-<11}  {:-<25} {:-<8}", "", "", "", "", "");
    for disk in snapshot.disks() {
        println!(
            "  {:<5} {:<20} {:>8.1} GB  {:<25} {}",
            disk.index,
            disk.path.display(),
            disk.size_gb(),
            disk.display_model(),
            disk.interface_type
        );
        for part in &disk.partitions {
            println!("        └─ {part}");
        }
    }

    if !snapshot.unattributed().is_empty() {
        println!(
            "\n{} volumes reporting a disk that was not found:",
            style("WARNING:").yellow().bold()
        );
        for part in snapshot.unattributed() {
            println!("  {part} (disk {})", part.owner_index);
        }
    }
}

struct CloneArgs {
    source: Option<u32>,
    destination: Option<u32>,
    block_size: u64,
    tool: PathBuf,
    allow_smaller_destination: bool,
}

fn run_clone(snapshot: &Snapshot, args: CloneArgs) -> Result<()> {
    if snapshot.disks().len() < 2 {
        bail!(
            "Cloning needs at least two disks; found {}.",
            snapshot.disks().len()
        );
    }

    let source = match args.source {
        Some(index) => index,
        None => select_disk(snapshot, "Select the SOURCE disk to copy from", None)?,
    };
    let destination = match args.destination {
        Some(index) => index,
        None => select_disk(
            snapshot,
            "Select the DESTINATION disk to ERASE and overwrite",
            Some(source),
        )?,
    };

    let plan = validate_with(
        snapshot,
        source,
        destination,
        ValidationOptions {
            allow_smaller_destination: args.allow_smaller_destination,
        },
    )?;
    let prompt = requires_confirmation(&plan);

    println!("{} {}", style("WARNING:").red().bold(), prompt);
    println!("  Source:      {}", style(plan.source_path().display()).cyan());
    println!(
        "  Destination: {}",
        style(plan.destination_path().display()).cyan()
    );
    if let Some(disk) = snapshot.disk(destination) {
        for part in disk.partitions.iter().filter(|p| p.id.is_some()) {
            println!("  Will destroy: {}", style(part).yellow());
        }
    }
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Clone operation cancelled.");
        return Ok(());
    }
    println!();

    let orchestrator = Orchestrator::new(DdTool::new(&args.tool)).with_options(CloneOptions {
        block_size: args.block_size,
        ..CloneOptions::default()
    });
    let mut session = orchestrator.execute(&plan, Some(prompt.accept()))?;

    // Ctrl+C stops the copy instead of killing us before the outcome is reported.
    let cancel = session.cancel_handle();
    ctrlc::set_handler(move || cancel.cancel())?;

    let total = plan.copy_limit().unwrap_or(plan.source().size_bytes);
    let clone_pb = ProgressBar::new(total);
    clone_pb.set_prefix("Cloning");
    clone_pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )?
            .progress_chars("■ "),
    );
    clone_pb.enable_steady_tick(Duration::from_millis(250));

    let report = loop {
        match session.next_event() {
            Some(CloneEvent::Progress(event)) => match event.bytes_copied {
                Some(bytes) => clone_pb.set_position(bytes),
                None if event.stream == OutputStream::Stderr => clone_pb.println(&event.line),
                None => debug!("{}", event.line),
            },
            Some(CloneEvent::Finished(report)) => break report,
            None => bail!("Clone worker stopped without reporting an outcome"),
        }
    };

    match report.outcome {
        Outcome::Success => {
            clone_pb.finish_with_message("Clone complete.");
            if let Some(limit) = plan.copy_limit() {
                println!(
                    "{} Only the first {} of the source were copied.",
                    style("NOTE:").yellow().bold(),
                    HumanBytes(limit)
                );
            }
            println!(
                "\n✨ Successfully cloned {} onto {}.",
                style(plan.source_path().display()).cyan(),
                style(plan.destination_path().display()).cyan()
            );
            Ok(())
        }
        _ => {
            clone_pb.abandon_with_message("❌ Operation failed.");
            if report.destination_state == DestinationState::Undefined {
                let copied = report
                    .bytes_copied
                    .map(|b| format!(" after {}", HumanBytes(b)))
                    .unwrap_or_default();
                eprintln!(
                    "{} {} was only partially written{copied}; its contents are undefined.",
                    style("WARNING:").red().bold(),
                    plan.destination_path().display()
                );
            }
            report.into_result().with_context(|| {
                format!(
                    "Cloning onto {} did not complete",
                    plan.destination_path().display()
                )
            })
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !privilege::is_elevated() {
        bail!("clonr needs root/administrator privileges to read and write raw disks.");
    }

    let catalog = Catalog::new(HostDevices::new());
    let snapshot = catalog
        .refresh()
        .context("Could not enumerate physical disks")?;

    match cli.command {
        Commands::List => list(&snapshot),
        Commands::Clone {
            source,
            destination,
            block_size,
            tool,
            allow_smaller_destination,
        } => run_clone(
            &snapshot,
            CloneArgs {
                source,
                destination,
                block_size,
                tool,
                allow_smaller_destination,
            },
        )?,
    }

    Ok(())
}
