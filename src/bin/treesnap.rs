//! # Treesnap CLI
//!
//! Command-line access to a SQLite snapshot store.
//!
//! ## Usage
//! ```bash
//! # Load a scanner's patch document (registers the root if needed)
//! treesnap --db tree.db ingest scan-1.json
//!
//! # Inspect what is stored
//! treesnap --db tree.db roots
//! treesnap --db tree.db snapshots r:home
//! treesnap --db tree.db nodes s:1b2c... --prefix /docs
//!
//! # Compare two snapshots, pairing renames
//! treesnap --db tree.db diff s:1b2c... s:9f8e... --moves
//!
//! # Line up several snapshots by OS identity
//! treesnap --db tree.db align s:1b2c... s:9f8e... s:77aa... --key os-file-id
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use treesnap::align::{AlignKeyStrategy, AlignKeyType, Aligner, CellState};
use treesnap::compare::{CompareMode, CompareOptions, Comparer, Confidence, DiffEntryType, EvidenceType};
use treesnap::types::{
    CasePolicy, Coverage, NodeFilter, NodeQuery, ObservedNode, OsKind, Page, RootDescriptor, ScanRun, ScanScope,
    ScopeCompleteness, ScopeMode,
};
use treesnap::utils::format_bytes;
use treesnap::{SnapshotStore, SqliteSnapshotStore, StoreBuilder};

/// Nodes per upsert batch during ingest
const INGEST_BATCH: usize = 500;

/// Rows per page when listing nodes
const LIST_PAGE: usize = 1000;

/// Treesnap CLI - inspect and compare file tree snapshots
#[derive(Parser)]
#[command(name = "treesnap")]
#[command(version)]
#[command(about = "Coverage-aware file tree snapshots: ingest, diff and align")]
#[command(long_about = None)]
struct Cli {
    /// SQLite store file
    #[arg(short, long, global = true, default_value = "treesnap.db")]
    db: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered roots
    Roots,

    /// List snapshots of a root
    #[command(alias = "ls")]
    Snapshots {
        /// Root id
        root: String,
    },

    /// List nodes of a snapshot
    Nodes {
        /// Snapshot id
        snapshot: String,

        /// Only nodes under this vpath
        #[arg(short, long)]
        prefix: Option<String>,

        /// Include tombstoned nodes
        #[arg(long)]
        deleted: bool,
    },

    /// Apply a JSON patch document to a snapshot
    Ingest {
        /// Patch document
        file: PathBuf,
    },

    /// Compare two snapshots
    Diff {
        /// Left (older) snapshot
        left: String,

        /// Right (newer) snapshot
        right: String,

        /// Compare only this subtree
        #[arg(short, long, default_value = "/")]
        scope: String,

        /// Pair removed and added nodes into moves
        #[arg(long)]
        moves: bool,

        /// Report partially covered paths as UNKNOWN instead of failing the scope
        #[arg(long)]
        lenient: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Align several snapshots row by row
    Align {
        /// Snapshot ids, in column order
        #[arg(required = true, num_args = 2..)]
        snapshots: Vec<String>,

        /// Row key
        #[arg(short, long, value_enum, default_value = "vpath")]
        key: KeyMode,

        /// Align only this subtree
        #[arg(short, long, default_value = "/")]
        scope: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum KeyMode {
    Vpath,
    EntityKey,
    OsFileId,
    ContentHash,
    Composite,
}

impl From<KeyMode> for AlignKeyStrategy {
    fn from(mode: KeyMode) -> Self {
        match mode {
            KeyMode::Vpath => AlignKeyStrategy::new(AlignKeyType::Vpath),
            KeyMode::EntityKey => AlignKeyStrategy::new(AlignKeyType::EntityKey),
            KeyMode::OsFileId => AlignKeyStrategy::new(AlignKeyType::OsFileId),
            KeyMode::ContentHash => AlignKeyStrategy::new(AlignKeyType::ContentHash),
            KeyMode::Composite => AlignKeyStrategy::new(AlignKeyType::Composite),
        }
    }
}

/// Root section of a patch document
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootSpec {
    root_id: String,
    os_path: PathBuf,
    #[serde(default)]
    os: Option<OsKind>,
    #[serde(default)]
    case_policy: Option<CasePolicy>,
}

/// A scanner's output for one run
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchDocument {
    root: RootSpec,
    /// Existing snapshot to patch; a new one is created when absent
    #[serde(default)]
    snapshot: Option<String>,
    run: ScanRun,
    nodes: Vec<ObservedNode>,
    coverage: Coverage,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("treesnap=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let store = StoreBuilder::new()
        .open_sqlite(&cli.db)
        .with_context(|| format!("opening store {}", cli.db.display()))?;

    match cli.command {
        Commands::Roots => cmd_roots(&store),
        Commands::Snapshots { root } => cmd_snapshots(&store, &root),
        Commands::Nodes { snapshot, prefix, deleted } => cmd_nodes(&store, &snapshot, prefix, deleted),
        Commands::Ingest { file } => cmd_ingest(&store, file),
        Commands::Diff {
            left,
            right,
            scope,
            moves,
            lenient,
            json,
        } => cmd_diff(&store, &left, &right, scope, moves, lenient, json),
        Commands::Align {
            snapshots,
            key,
            scope,
            json,
        } => cmd_align(&store, &snapshots, key, scope, json),
    }
}

fn cmd_roots(store: &SqliteSnapshotStore) -> anyhow::Result<()> {
    let roots = store.list_roots()?;
    if roots.is_empty() {
        println!("{}", "No roots registered".yellow());
        return Ok(());
    }
    for root in roots {
        println!(
            "{} {} {}",
            root.root_id.yellow().bold(),
            root.os_path.display().to_string().cyan(),
            format!("[{:?}, case {:?}]", root.os, root.effective_case_policy()).dimmed()
        );
    }
    Ok(())
}

fn cmd_snapshots(store: &SqliteSnapshotStore, root_id: &str) -> anyhow::Result<()> {
    let snapshots = store.list_snapshots(root_id)?;
    if snapshots.is_empty() {
        println!("{}", format!("No snapshots of {}", root_id).yellow());
        return Ok(());
    }
    for snapshot in snapshots {
        let complete = snapshot
            .last_coverage
            .scopes
            .iter()
            .filter(|s| s.completeness == ScopeCompleteness::Complete)
            .count();
        println!(
            "{} {} nodes ({} dirs, {} files)  patched {}  coverage {}/{} complete",
            snapshot.snapshot_id.yellow().bold(),
            snapshot.stats.node_count.to_string().cyan(),
            snapshot.stats.dir_count,
            snapshot.stats.file_count,
            snapshot.last_patched_at.format("%Y-%m-%d %H:%M:%S"),
            complete,
            snapshot.last_coverage.scopes.len()
        );
    }
    Ok(())
}

fn cmd_nodes(store: &SqliteSnapshotStore, snapshot_id: &str, prefix: Option<String>, deleted: bool) -> anyhow::Result<()> {
    let mut query = NodeQuery {
        filter: Some(NodeFilter {
            vpath_prefix: prefix,
            include_deleted: deleted,
            ..NodeFilter::default()
        }),
        sort: None,
        page: Some(Page::first(LIST_PAGE)),
    };
    let mut total = 0usize;
    loop {
        let page = store.query_nodes(snapshot_id, &query)?;
        for node in &page.nodes {
            let size = node.size.map(format_bytes).unwrap_or_else(|| "-".to_string());
            let line = format!("{:<8} {:>12}  {}", node.kind.as_str(), size, node.node_ref.vpath);
            if node.is_deleted {
                println!("{} {}", line.dimmed(), "(deleted)".red());
            } else if !node.errors.is_empty() {
                println!("{} {}", line, format!("({} errors)", node.errors.len()).yellow());
            } else {
                println!("{}", line);
            }
        }
        total += page.nodes.len();
        match page.next_cursor {
            Some(cursor) => query.page = Some(Page::after(LIST_PAGE, cursor)),
            None => break,
        }
    }
    println!("{}", format!("{} nodes", total).dimmed());
    Ok(())
}

fn cmd_ingest(store: &SqliteSnapshotStore, file: PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let doc: PatchDocument =
        serde_json::from_str(&raw).with_context(|| format!("parsing patch document {}", file.display()))?;
    if doc.coverage.run_id != doc.run.run_id {
        bail!(
            "coverage belongs to run {} but the document's run is {}",
            doc.coverage.run_id,
            doc.run.run_id
        );
    }

    let start = Instant::now();
    let os = doc.root.os.unwrap_or_else(OsKind::current);
    let mut desc = RootDescriptor::new(doc.root.root_id, doc.root.os_path, os, chrono::Utc::now())?;
    if let Some(policy) = doc.root.case_policy {
        desc = desc.with_case_policy(policy);
    }
    let root = store.register_root(desc)?;
    if root.root_id != doc.run.root_id {
        bail!("run {} targets root {}, not {}", doc.run.run_id, doc.run.root_id, root.root_id);
    }

    let snapshot = match doc.snapshot {
        Some(id) => store.get_snapshot(&id)?,
        None => store.create_snapshot(&root.root_id)?,
    };
    println!(
        "{} {} into {}",
        "Ingesting".blue().bold(),
        doc.run.run_id.yellow(),
        snapshot.snapshot_id.yellow().bold()
    );

    let pb = ProgressBar::new(doc.nodes.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} nodes")
            .context("progress template")?
            .progress_chars("=> "),
    );

    let mut session = store.begin_patch(&snapshot.snapshot_id, doc.run)?;
    for batch in doc.nodes.chunks(INGEST_BATCH) {
        session.upsert_nodes(batch)?;
        pb.inc(batch.len() as u64);
    }
    session.record_coverage(doc.coverage)?;
    session.commit()?;
    pb.finish_and_clear();

    let snapshot = store.get_snapshot(&snapshot.snapshot_id)?;
    println!("{} Committed {}", "✓".green().bold(), snapshot.snapshot_id.yellow().bold());
    println!("  Live nodes: {}", snapshot.stats.node_count.to_string().cyan());
    println!("  Directories: {}", snapshot.stats.dir_count.to_string().cyan());
    println!("  Files: {}", snapshot.stats.file_count.to_string().cyan());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

fn cmd_diff(
    store: &SqliteSnapshotStore,
    left: &str,
    right: &str,
    scope: String,
    moves: bool,
    lenient: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut options = CompareOptions::default().with_scope(ScanScope::new(scope, ScopeMode::FullSubtree));
    if moves {
        options = options.with_moves(vec![EvidenceType::OsFileId, EvidenceType::ContentHash], Confidence::Likely);
    }
    if lenient {
        options = options.with_mode(CompareMode::Lenient);
    }

    let start = Instant::now();
    let diff = Comparer::new(store).compare(left, right, &options)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&diff)?);
        return Ok(());
    }

    for entry in &diff.entries {
        let (marker, path) = match entry.entry_type {
            DiffEntryType::Added => ("+".green().bold(), entry.path.green()),
            DiffEntryType::Removed => ("-".red().bold(), entry.path.red()),
            DiffEntryType::Modified => ("~".yellow().bold(), entry.path.yellow()),
            DiffEntryType::TypeChanged => ("T".yellow().bold(), entry.path.yellow()),
            DiffEntryType::Moved => (">".blue().bold(), entry.path.blue()),
            DiffEntryType::Conflict => ("!".magenta().bold(), entry.path.magenta()),
            DiffEntryType::Unknown => ("?".dimmed(), entry.path.dimmed()),
            DiffEntryType::NotCovered => ("#".dimmed(), entry.path.dimmed()),
        };
        match (&entry.entry_type, &entry.left) {
            (DiffEntryType::Moved, Some(from)) => {
                let from = from.node_ref.as_ref().map(|r| r.vpath.as_str()).unwrap_or("?");
                println!("{} {} {} {}", marker, from, "->".dimmed(), path);
            }
            _ => println!("{} {}", marker, path),
        }
        if let Some(notes) = &entry.notes {
            println!("    {}", notes.dimmed());
        }
    }

    let s = diff.summary;
    println!(
        "\n{} added, {} removed, {} modified, {} moved, {} unknown, {} not covered",
        s.added.to_string().green(),
        s.removed.to_string().red(),
        s.modified.to_string().yellow(),
        s.moved.to_string().blue(),
        s.unknown,
        s.not_covered
    );
    println!("{}", format!("Compared in {}", format_duration(start.elapsed())).dimmed());
    Ok(())
}

fn cmd_align(
    store: &SqliteSnapshotStore,
    snapshots: &[String],
    key: KeyMode,
    scope: String,
    json: bool,
) -> anyhow::Result<()> {
    let scope = ScanScope::new(scope, ScopeMode::FullSubtree);
    let result = Aligner::new(store).align(snapshots, &scope, &key.into(), CompareMode::Strict)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    for row in &result.rows {
        let cells: Vec<String> = row
            .cells
            .iter()
            .map(|cell| match cell.state {
                CellState::Present => {
                    let size = cell
                        .fingerprint
                        .as_ref()
                        .and_then(|f| f.size)
                        .map(format_bytes)
                        .unwrap_or_else(|| "present".to_string());
                    size.green().to_string()
                }
                CellState::Missing => "missing".red().to_string(),
                CellState::Unknown => "unknown".dimmed().to_string(),
                CellState::NotCovered => "not covered".dimmed().to_string(),
            })
            .collect();
        println!("{:<48} {}", row.display_key, cells.join(" | "));
    }
    println!("{}", format!("{} rows across {} snapshots", result.rows.len(), snapshots.len()).dimmed());
    Ok(())
}
