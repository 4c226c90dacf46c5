//! labelkit CLI - inspect, verify and edit partition tables in disk images
//!
//! Each invocation opens the image, probes its label, applies at most one
//! change and writes it back. Nothing is written unless the table changed.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use labelkit_core::{format_size, has_errors, DiskContext, Finding, Zone, ZoneTable};
use labelkit_pipeline::{open_device, DeviceConfig};
use labelkit_zones::{DiskLabel, LabelKind, PartitionRequest, PartitionType};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "labelkit")]
#[command(about = "Inspect, verify and edit DOS and GPT partition tables")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    device: DeviceArgs,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "warn", global = true)]
    log_level: String,
}

/// Topology overrides; an image file reports nothing of its own
#[derive(Args)]
struct DeviceArgs {
    /// Logical sector size in bytes
    #[arg(long, env = "LABELKIT_SECTOR_SIZE", default_value = "512", global = true)]
    sector_size: u32,

    /// Physical sector size in bytes
    #[arg(long, global = true)]
    phys_sector_size: Option<u32>,

    /// Optimal I/O size in bytes
    #[arg(long, default_value = "0", global = true)]
    optimal_io_size: u32,

    /// Heads for CHS translation
    #[arg(long, global = true)]
    heads: Option<u32>,

    /// Sectors per track for CHS translation
    #[arg(long, global = true)]
    sectors: Option<u32>,

    /// Memory-map images opened read-only
    #[arg(long, env = "LABELKIT_MMAP", global = true)]
    mmap: bool,

    /// DOS-compatible mode: track alignment and CHS checks
    #[arg(long, global = true)]
    compat: bool,
}

impl DeviceArgs {
    fn config(&self, writable: bool) -> DeviceConfig {
        DeviceConfig {
            sector_size: self.sector_size,
            phys_sector_size: self.phys_sector_size,
            optimal_io_size: self.optimal_io_size,
            heads: self.heads,
            sectors: self.sectors,
            use_mmap: self.mmap,
            writable,
            ..DeviceConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List the partitions of one or more images
    List {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check a partition table for consistency
    Verify {
        image: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Write a new, empty partition table
    Create {
        image: PathBuf,

        /// Label type (dos or gpt)
        #[arg(long, default_value = "gpt")]
        label: String,
    },

    /// Add a partition
    Add {
        image: PathBuf,

        /// Partition number (1-based); the first free one by default
        #[arg(long)]
        number: Option<usize>,

        /// First sector
        #[arg(long)]
        start: Option<u64>,

        /// Size in sectors
        #[arg(long)]
        size: Option<u64>,

        /// Hex DOS type ("83") or GPT type GUID
        #[arg(long = "type")]
        type_code: Option<String>,

        /// GPT partition name
        #[arg(long)]
        name: Option<String>,

        /// Create a logical partition (DOS)
        #[arg(long)]
        logical: bool,

        /// Align the end so the next partition starts aligned
        #[arg(long)]
        align_end: bool,
    },

    /// Delete a partition
    Delete {
        image: PathBuf,

        /// Partition number (1-based)
        number: usize,
    },

    /// Sort DOS partitions into disk order
    FixOrder { image: PathBuf },

    /// Change the number of GPT entries
    Resize { image: PathBuf, entries: u32 },

    /// Move the GPT backup header to the end of a grown image
    RelocateBackup { image: PathBuf },
}

#[derive(Serialize)]
struct Listing {
    path: PathBuf,
    label: LabelKind,
    total_sectors: u64,
    sector_size: u64,
    zones: Vec<Zone>,
}

#[derive(Serialize)]
struct Report {
    path: PathBuf,
    label: LabelKind,
    findings: Vec<Finding>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

/// Returns false when the command completed but found problems
fn run(cli: Cli) -> Result<bool> {
    let args = &cli.device;
    match cli.command {
        Command::List { images, json } => Ok(cmd_list(&images, args, json)),
        Command::Verify { image, json } => cmd_verify(&image, args, json),
        Command::Create { image, label } => {
            let kind: LabelKind = label.parse()?;
            with_device(&image, &args.config(true), |ctx| {
                let mut label = DiskLabel::create(ctx, kind)?;
                label.write(ctx)?;
                println!("Created a new {} disklabel on {}", kind, image.display());
                Ok(true)
            })
        }
        Command::Add {
            image,
            number,
            start,
            size,
            type_code,
            name,
            logical,
            align_end,
        } => {
            let index = match number {
                Some(0) => bail!("partition numbers start at 1"),
                Some(n) => Some(n - 1),
                None => None,
            };
            let type_code = type_code
                .map(|t| t.parse::<PartitionType>())
                .transpose()?;
            let req = PartitionRequest {
                index,
                start,
                size,
                align_end,
                type_code,
                name,
                logical,
            };
            edit(&image, args, |ctx, label| {
                let index = label.add_partition(ctx, &req)?;
                println!("Created partition {}", index + 1);
                Ok(())
            })
        }
        Command::Delete { image, number } => {
            if number == 0 {
                bail!("partition numbers start at 1");
            }
            edit(&image, args, |_, label| {
                label.delete_partition(number - 1)?;
                println!("Partition {} has been deleted", number);
                Ok(())
            })
        }
        Command::FixOrder { image } => edit(&image, args, |_, label| match label {
            DiskLabel::Mbr(table) => {
                if table.fix_order()? {
                    println!("Done.");
                } else {
                    println!("Nothing to do. Ordering is correct already.");
                }
                Ok(())
            }
            DiskLabel::Gpt(_) => bail!("fix-order applies to DOS labels only"),
        }),
        Command::Resize { image, entries } => edit(&image, args, |_, label| match label {
            DiskLabel::Gpt(table) => {
                table.resize_entries(entries)?;
                println!("Partition table now holds {} entries", entries);
                Ok(())
            }
            DiskLabel::Mbr(_) => bail!("resize applies to GPT labels only"),
        }),
        Command::RelocateBackup { image } => edit(&image, args, |_, label| match label {
            DiskLabel::Gpt(table) => {
                if table.relocate_backup()? {
                    println!("Backup header moved to the end of the device");
                } else {
                    println!("Backup header is already at the end of the device");
                }
                Ok(())
            }
            DiskLabel::Mbr(_) => bail!("relocate-backup applies to GPT labels only"),
        }),
    }
}

/// Open `path` and run `f` against a context over it
fn with_device<T>(
    path: &Path,
    config: &DeviceConfig,
    f: impl FnOnce(&mut DiskContext<'_>) -> Result<T>,
) -> Result<T> {
    let mut device = open_device(path, config)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut ctx = DiskContext::new(device.as_mut())?;
    f(&mut ctx)
}

fn probe(ctx: &mut DiskContext<'_>, args: &DeviceArgs) -> Result<DiskLabel> {
    let mut label = DiskLabel::probe(ctx)?;
    if let DiskLabel::Mbr(table) = &mut label {
        table.set_compatible(args.compat);
    }
    Ok(label)
}

/// Probe, apply `f`, and write the table back if it changed
fn edit(
    path: &Path,
    args: &DeviceArgs,
    f: impl FnOnce(&mut DiskContext<'_>, &mut DiskLabel) -> Result<()>,
) -> Result<bool> {
    with_device(path, &args.config(true), |ctx| {
        let mut label = probe(ctx, args)?;
        f(ctx, &mut label)?;
        if label.is_changed() {
            label.write(ctx)?;
            tracing::info!("Wrote {} label to {}", label.kind(), path.display());
        }
        Ok(true)
    })
}

/// Caller-level loop: a failing image is logged and the rest still listed
fn cmd_list(images: &[PathBuf], args: &DeviceArgs, json: bool) -> bool {
    let config = args.config(false);
    let mut listings = Vec::new();
    let mut ok = true;

    for path in images {
        let listing = with_device(path, &config, |ctx| {
            let label = probe(ctx, args)?;
            Ok(Listing {
                path: path.clone(),
                label: label.kind(),
                total_sectors: ctx.total_sectors(),
                sector_size: ctx.sector_size(),
                zones: label.zones(),
            })
        });
        match listing {
            Ok(listing) => listings.push(listing),
            Err(e) => {
                tracing::error!("{}: {:#}", path.display(), e);
                ok = false;
            }
        }
    }

    if json {
        match serde_json::to_string_pretty(&listings) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                tracing::error!("cannot encode listing: {}", e);
                ok = false;
            }
        }
    } else {
        for listing in &listings {
            print_listing(listing);
        }
    }
    ok
}

fn print_listing(listing: &Listing) {
    println!(
        "Disk {}: {}, {} sectors",
        listing.path.display(),
        format_size(listing.total_sectors.saturating_mul(listing.sector_size)),
        listing.total_sectors
    );
    println!("Sector size: {} bytes", listing.sector_size);
    println!("Disklabel type: {}", listing.label);
    println!();

    if listing.zones.is_empty() {
        println!("No partitions found.");
        println!();
        return;
    }

    println!(
        "{:<6} {:<5} {:>12} {:>12} {:>12} {:>10}  {}",
        "Number", "Boot", "Start", "End", "Sectors", "Size", "Type"
    );
    for zone in &listing.zones {
        let ty = match &zone.name {
            Some(name) => format!("{} ({})", zone.zone_type, name),
            None => zone.zone_type.clone(),
        };
        println!(
            "{:<6} {:<5} {:>12} {:>12} {:>12} {:>10}  {}",
            zone.index + 1,
            if zone.bootable { "*" } else { "" },
            zone.start,
            zone.end(),
            zone.size,
            format_size(zone.size.saturating_mul(listing.sector_size)),
            ty
        );
    }
    println!();
}

fn cmd_verify(path: &Path, args: &DeviceArgs, json: bool) -> Result<bool> {
    let report = with_device(path, &args.config(false), |ctx| {
        let label = probe(ctx, args)?;
        Ok(Report {
            path: path.to_path_buf(),
            label: label.kind(),
            findings: label.verify(),
        })
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Disklabel type: {}", report.label);
        for finding in &report.findings {
            println!("{}", finding);
        }
    }
    Ok(!has_errors(&report.findings))
}
