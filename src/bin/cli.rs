//! Binary entry point for the strata administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use strata::admin::{
    format, reclaim, stats, verify, AdminOpenOptions, FormatReport, PagerOptions, ReclaimOptions,
    ReclaimReport, StatsReport, VerifyLevel, VerifyReport,
};
use strata::types::Csn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Administrative CLI for strata versioned page stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "Page size in bytes")]
    page_size: Option<u32>,

    #[arg(long, global = true, help = "Pager cache size (pages)")]
    cache_pages: Option<usize>,

    #[arg(
        long,
        global = true,
        help = "Pages per extent, including the extent allocation node"
    )]
    pages_per_extent: Option<u32>,

    #[arg(
        long = "extents-per-node",
        global = true,
        help = "Extents mapped by each segment allocation node"
    )]
    extents_per_node: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create an empty versioned store")]
    Format {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(long, help = "Replace an existing file")]
        force: bool,
    },

    #[command(about = "Print geometry, page counters and cache statistics")]
    Stats {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    #[command(about = "Check allocation metadata for consistency")]
    Verify {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },

    #[command(about = "Free page versions no snapshot can observe")]
    Reclaim {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(
            long,
            value_name = "CSN",
            help = "Oldest commit sequence number still being read"
        )]
        oldest_active: u64,

        #[arg(long, default_value_t = 256, help = "Candidates per batch")]
        batch: usize,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut open_opts = build_open_options(&cli.open);

    match cli.command {
        Command::Format { path, force } => {
            open_opts.overwrite = force;
            let report = format(&path, &open_opts)?;
            emit(&cli.format, &report, || print_format_text(&report))?;
        }
        Command::Stats { path } => {
            let report = stats(&path, &open_opts)?;
            emit(&cli.format, &report, || print_stats_text(&report))?;
        }
        Command::Verify { path, level } => {
            let report = verify(&path, &open_opts, level.into())?;
            emit(&cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                return Err("verification failed".into());
            }
        }
        Command::Reclaim {
            path,
            oldest_active,
            batch,
        } => {
            let options = ReclaimOptions {
                oldest_active: Csn(oldest_active),
                batch,
            };
            let report = reclaim(&path, &open_opts, &options)?;
            emit(&cli.format, &report, || print_reclaim_text(&report))?;
        }
    }
    Ok(())
}

fn build_open_options(args: &OpenArgs) -> AdminOpenOptions {
    let mut pager = PagerOptions::default();
    if let Some(page_size) = args.page_size {
        pager.page_size = page_size;
    }
    if let Some(cache_pages) = args.cache_pages {
        pager.cache_pages = cache_pages;
    }
    AdminOpenOptions {
        pager,
        pages_per_extent: args.pages_per_extent,
        extents_per_seg_alloc: args.extents_per_node,
        overwrite: false,
    }
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_format_text(report: &FormatReport) {
    println!(
        "Formatted {} (page_size={} pages_per_extent={} extents_per_node={} pages={} bytes={})",
        report.path,
        report.page_size,
        report.pages_per_extent,
        report.extents_per_seg_alloc,
        report.store_pages,
        report.size_bytes
    );
}

fn print_stats_text(report: &StatsReport) {
    println!("Geometry:");
    println!(
        "  page_size={} pages_per_extent={} extents_per_node={}",
        report.geometry.page_size,
        report.geometry.pages_per_extent,
        report.geometry.extents_per_seg_alloc
    );
    println!();
    println!("Pages:");
    println!(
        "  store_pages={} allocated={} high_water={} scratch_in_use={}",
        report.pages.store_pages,
        report.pages.allocated,
        report.pages.high_water,
        report.pages.scratch_pages_in_use
    );
    println!();
    println!("Cache:");
    println!(
        "  cache_pages={} hits={} misses={} evictions={} dirty_writebacks={}",
        report.cache.cache_pages,
        report.cache.hits,
        report.cache.misses,
        report.cache.evictions,
        report.cache.dirty_writebacks
    );
    println!();
    println!("Filesystem:");
    println!(
        "  path={} size_bytes={}",
        report.filesystem.path, report.filesystem.size_bytes
    );
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} seg_nodes={} extents={} allocated={} high_water={} store_pages={}",
        report.level,
        report.success,
        report.counts.seg_nodes,
        report.counts.extents,
        report.counts.allocated_pages,
        report.counts.high_water,
        report.counts.store_pages,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

fn print_reclaim_text(report: &ReclaimReport) {
    println!(
        "Reclaim below csn {} freed {} of {} candidates in {} batches (allocated {} -> {})",
        report.oldest_active,
        report.freed,
        report.candidates,
        report.batches,
        report.allocated_before,
        report.allocated_after
    );
}
