use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;
use uuid::Uuid;
use vmadedup::archive::{Archive, OptimizeOutcome, PackOptions};
use vmadedup::reorder::{ReorderConfig, CACHE_CEILING, SWITCH_THRESHOLD};

#[derive(Parser)]
#[command(name = "vmadedup", about = "Inspect, pack and dedup-optimize VMA archives")]
struct Cli {
    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory (configs plus drive-* images) into an archive
    Pack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Archive id as 32 hex digits (default: random)
        #[arg(long)]
        uuid: Option<String>,
        /// Creation time in seconds since the epoch (default: now)
        #[arg(long)]
        ctime: Option<i64>,
    },
    /// Unpack an archive into a directory
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Show archive metadata
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Read every extent and check all checksums
    Verify {
        input: PathBuf,
    },
    /// Restore per-device cluster order and stamp the canonical id
    Optimize {
        input: PathBuf,
        /// Defaults to rewriting the input in place
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = SWITCH_THRESHOLD)]
        switch_threshold: usize,
        #[arg(long, default_value_t = CACHE_CEILING)]
        ceiling: usize,
    },
    /// Print one key of a guest config blob
    GetConfig {
        input: PathBuf,
        key: String,
        #[arg(long, default_value = "qemu-server.conf")]
        config: String,
    },
    /// Set one key of a guest config blob, rewriting the archive
    SetConfig {
        input: PathBuf,
        key: String,
        value: String,
        #[arg(long, default_value = "qemu-server.conf")]
        config: String,
        /// Defaults to rewriting the input in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { input, output, uuid, ctime } => {
            let archive_id = match uuid {
                Some(s) => Some(parse_uuid(&s)?),
                None    => None,
            };
            let stats = Archive::pack_dir(&input, &output, &PackOptions { archive_id, ctime })?;
            println!("Created: {} ({} clusters, {} extents)", output.display(), stats.clusters, stats.extents);
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir } => {
            Archive::open(&input)?.extract_all(&output_dir)?;
            println!("Unpacked to: {}", output_dir.display());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let info = Archive::open(&input)?.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }
            println!("── VMA Archive ──────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  UUID           {}", info.uuid);
            println!("  Optimized      {}", info.canonical);
            println!("  Created        {}", info.created.as_deref().unwrap_or("?"));
            println!("  Configs ({}):", info.configs.len());
            for c in &info.configs {
                println!("    {:<26} {:>10} B", c.name, c.size);
            }
            println!("  Devices ({}):", info.devices.len());
            for d in &info.devices {
                println!("    {:>3} {:<22} {:>14} B {:>10} clusters", d.id, d.name, d.size, d.clusters);
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let stats = Archive::open(&input)?.verify()?;
            println!(
                "OK: {} extents, {} clusters, {} data blocks, {} holes",
                stats.extents, stats.clusters, stats.data_blocks, stats.hole_blocks
            );
        }

        // ── Optimize ─────────────────────────────────────────────────────────
        Commands::Optimize { input, output, switch_threshold, ceiling } => {
            let output = output.unwrap_or_else(|| input.clone());
            let config = ReorderConfig { switch_threshold, ceiling };
            config.validate()?;
            match Archive::open(&input)?.optimize(&output, config)? {
                OptimizeOutcome::AlreadyCanonical => println!("Already optimized: {}", input.display()),
                OptimizeOutcome::Optimized { stats, .. } => {
                    println!("Optimized → {} ({} clusters)", output.display(), stats.clusters)
                }
            }
        }

        // ── Guest config ─────────────────────────────────────────────────────
        Commands::GetConfig { input, key, config } => {
            match Archive::open(&input)?.config_value(&config, &key)? {
                Some(v) => println!("{v}"),
                None    => return Err(format!("{key} not set in {config}").into()),
            }
        }

        Commands::SetConfig { input, key, value, config, output } => {
            let output = output.unwrap_or_else(|| input.clone());
            Archive::open(&input)?.set_config_key(&output, &config, &key, &value)?;
            println!("Set {key} in {config} → {}", output.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Raw 16 bytes as hex, the same form `info` prints.
fn parse_uuid(s: &str) -> Result<Uuid, Box<dyn std::error::Error>> {
    let bytes = hex::decode(s.replace('-', ""))?;
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| format!("archive id must be 16 bytes: {s}"))?;
    Ok(Uuid::from_bytes(raw))
}
