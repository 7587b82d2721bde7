#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pfx_block::FileDevice;
use pfx_repair::{
    repair_volume, RepairContext, RepairEvent, RepairOptions, RepairPlan, ReportSink, TreeKind,
    Volume,
};
use serde::Serialize;
use std::env::VarError;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── Logging setup ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "PFX_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<()> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }
    Ok(())
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pfx", about = "PlusFix — HFS+-style volume repair engine")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `PFX_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TreeArg {
    Catalog,
    Extents,
    Attributes,
}

impl From<TreeArg> for TreeKind {
    fn from(arg: TreeArg) -> Self {
        match arg {
            TreeArg::Catalog => Self::Catalog,
            TreeArg::Extents => Self::Extents,
            TreeArg::Attributes => Self::Attributes,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print the volume header as JSON.
    Header {
        /// Volume image to inspect.
        image: PathBuf,
    },
    /// Execute a repair plan produced by the diagnosis phase.
    Repair {
        /// Volume image to repair in place.
        image: PathBuf,
        /// JSON repair plan (rebuilds, overlap items, repair orders).
        #[arg(long)]
        plan: PathBuf,
        /// Create placeholder files instead of symlinks under DamagedFiles.
        #[arg(long)]
        no_symlinks: bool,
    },
    /// Rebuild a single B-tree from its surviving leaf records.
    Rebuild {
        /// Volume image to repair in place.
        image: PathBuf,
        /// Which tree to rebuild.
        #[arg(long, value_enum, default_value = "catalog")]
        tree: TreeArg,
    },
}

// ── Header report ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HeaderReport {
    signature: String,
    case_sensitive: bool,
    block_size: u32,
    total_blocks: u32,
    free_blocks: u32,
    file_count: u32,
    folder_count: u32,
    next_catalog_id: u32,
    catalog_blocks: u32,
    extents_blocks: u32,
    attributes_blocks: u32,
    checked_date_unix: i64,
}

impl HeaderReport {
    fn from_volume(vol: &Volume<'_>) -> Self {
        let header = &vol.header;
        Self {
            signature: String::from_utf8_lossy(&header.signature.to_be_bytes()).into_owned(),
            case_sensitive: header.is_case_sensitive(),
            block_size: header.block_size,
            total_blocks: header.total_blocks,
            free_blocks: header.free_blocks,
            file_count: header.file_count,
            folder_count: header.folder_count,
            next_catalog_id: header.next_catalog_id.0,
            catalog_blocks: header.catalog_fork.total_blocks,
            extents_blocks: header.extents_fork.total_blocks,
            attributes_blocks: header.attributes_fork.total_blocks,
            checked_date_unix: pfx_types::mac_to_unix(header.checked_date),
        }
    }
}

// ── Event rendering ─────────────────────────────────────────────────────────

/// Renders engine events through tracing; the engine itself never formats
/// user-facing strings.
#[derive(Default)]
struct TracingSink {
    disk_full_seen: bool,
    symlink_failures: u32,
}

impl ReportSink for TracingSink {
    fn report(&mut self, event: RepairEvent) {
        match event {
            RepairEvent::DiskFull { requested_blocks } => {
                self.disk_full_seen = true;
                warn!(requested_blocks, "volume ran out of space during repair");
            }
            RepairEvent::TreeRebuilt {
                tree,
                records,
                skipped_nodes,
            } => {
                info!(%tree, records, skipped_nodes, "tree rebuilt");
            }
            RepairEvent::RebuildAborted { tree, reason } => {
                warn!(%tree, %reason, "tree rebuild abandoned");
            }
            RepairEvent::FileRelocated {
                file_id,
                old_start,
                new_start,
                blocks,
            } => {
                info!(file_id, old_start, new_start, blocks, "file data relocated");
            }
            RepairEvent::DamagedFilesCreated => info!("created DamagedFiles directory"),
            RepairEvent::DamagedFilesEntry { file_id, name } => {
                info!(file_id, %name, "left pointer to relocated file");
            }
            RepairEvent::SymlinkFallback { file_id } => {
                self.symlink_failures += 1;
                warn!(file_id, "could not create symlink; left placeholder");
            }
            RepairEvent::LostFoundCreated => info!("created lost+found directory"),
            RepairEvent::ThreadSynthesized { id } => info!(id, "thread record synthesized"),
            RepairEvent::OrphanThreadDeleted { id } => info!(id, "orphan thread deleted"),
            RepairEvent::LinkEntryDeleted { link_id, inode_id } => {
                info!(link_id, inode_id, "hard link without target deleted");
            }
            RepairEvent::InodeRelocated { inode_id } => {
                info!(inode_id, "linkless inode moved to lost+found");
            }
            RepairEvent::OrderRequeued { description } => {
                info!(%description, "repair order requeued until threads are consistent");
            }
            RepairEvent::OrderDropped { description } => {
                warn!(%description, "repair order dropped; target no longer exists");
            }
            RepairEvent::OrderFailed { description, error } => {
                warn!(%description, %error, "repair order failed");
            }
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_header(image: &PathBuf) -> Result<()> {
    let dev = FileDevice::open(image)
        .with_context(|| format!("opening image {}", image.display()))?;
    let vol = Volume::open(&dev).context("parsing volume header")?;
    let report = HeaderReport::from_volume(&vol);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_plan(path: &PathBuf) -> Result<RepairPlan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading repair plan {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing repair plan {}", path.display()))
}

fn run_repair(image: &PathBuf, plan: RepairPlan, symlinks_supported: bool) -> Result<()> {
    let dev = FileDevice::open(image)
        .with_context(|| format!("opening image {}", image.display()))?;
    let mut vol = Volume::open(&dev).context("parsing volume header")?;

    let mut ctx = RepairContext::new(RepairOptions {
        symlinks_supported,
        ..RepairOptions::default()
    });
    let mut sink = TracingSink::default();
    let summary = repair_volume(&mut ctx, &mut vol, plan, &mut sink)
        .context("repair run failed; volume left for the next full run")?;

    if sink.disk_full_seen {
        warn!("the volume is out of space; free some room and run the repair again");
    }
    if sink.symlink_failures > 0 {
        warn!(
            count = sink.symlink_failures,
            "some DamagedFiles pointers are placeholders, not symlinks"
        );
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.is_clean() {
        bail!(
            "repair incomplete: {} failed, {} unresolved",
            summary.orders_failed + summary.overlaps_failed,
            summary.orders_unresolved
        );
    }
    Ok(())
}

fn cmd_repair(image: &PathBuf, plan_path: &PathBuf, no_symlinks: bool) -> Result<()> {
    let plan = load_plan(plan_path)?;
    if plan.is_empty() {
        info!("plan is empty; running consistency passes only");
    }
    run_repair(image, plan, !no_symlinks)
}

fn cmd_rebuild(image: &PathBuf, tree: TreeArg) -> Result<()> {
    let plan = RepairPlan {
        rebuild: vec![tree.into()],
        ..RepairPlan::default()
    };
    run_repair(image, plan, true)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match &cli.command {
        Command::Header { image } => cmd_header(image),
        Command::Repair {
            image,
            plan,
            no_symlinks,
        } => cmd_repair(image, plan, *no_symlinks),
        Command::Rebuild { image, tree } => cmd_rebuild(image, *tree),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
