//! tablet-tool
//!
//! Operator CLI over a tablet directory using a demo schema
//! `(key int32 KEY, val int64)`.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use tablet_store::{
    ColumnSchema, DataType, Result, RowBuilder, RowChangeListEncoder, Schema, Tablet, TabletConfig,
};

/// Tablet storage tool
#[derive(Parser, Debug)]
#[command(name = "tablet-tool")]
#[command(about = "Inspect and exercise a single tablet directory")]
#[command(version)]
struct Args {
    /// Tablet directory
    #[arg(short, long, default_value = "./tablet_data")]
    dir: PathBuf,

    /// MemRowSet flush threshold in MB (used by `load`)
    #[arg(short = 'm', long, default_value = "64")]
    flush_threshold_mb: usize,

    /// DiskRowSet roll-over size in MB
    #[arg(short = 't', long, default_value = "64")]
    target_rowset_mb: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty tablet
    Create,

    /// Insert a range of generated rows
    Load {
        /// Number of rows to insert
        #[arg(short, long, default_value = "1000")]
        count: i32,

        /// First key
        #[arg(short, long, default_value = "0")]
        start: i32,

        /// Flush after this many rows (0 = only when over the threshold)
        #[arg(short, long, default_value = "0")]
        flush_every: usize,
    },

    /// Set the value of one row
    Update {
        key: i32,
        val: i64,
    },

    /// Delete one row
    Delete {
        key: i32,
    },

    /// Flush the MemRowSet
    Flush,

    /// Run one compaction
    Compact,

    /// Count live rows
    Count,

    /// Print rows in key order
    Scan {
        /// Stop after this many rows
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show rowset layout
    Info,
}

fn demo_schema() -> Result<Schema> {
    Schema::new(
        vec![
            ColumnSchema::new("key", DataType::Int32),
            ColumnSchema::new("val", DataType::Int64),
        ],
        1,
    )
}

fn open_tablet(args: &Args) -> Result<Tablet> {
    let config = TabletConfig::builder()
        .memrowset_flush_threshold(args.flush_threshold_mb * 1024 * 1024)
        .target_rowset_size(args.target_rowset_mb * 1024 * 1024)
        .build();
    Tablet::open_existing(&args.dir, config)
}

fn run(args: &Args) -> Result<()> {
    let schema = demo_schema()?;

    match &args.command {
        Commands::Create => {
            Tablet::new(schema, &args.dir)?.create_new()?;
            println!("Created tablet at {}", args.dir.display());
        }

        Commands::Load {
            count,
            start,
            flush_every,
        } => {
            let tablet = open_tablet(args)?;
            let mut loaded = 0usize;
            for key in *start..start.saturating_add(*count) {
                let row = RowBuilder::new(&schema)
                    .add(key)?
                    .add(i64::from(key) * 10)?
                    .build()?;
                tablet.insert(&row)?;
                loaded += 1;

                let periodic = *flush_every > 0 && loaded % flush_every == 0;
                if periodic || tablet.needs_flush() {
                    tablet.flush()?;
                }
            }
            tablet.flush()?;
            println!("Loaded {} rows", loaded);
        }

        Commands::Update { key, val } => {
            let tablet = open_tablet(args)?;
            let key_row = RowBuilder::key(&schema).add(*key)?.build()?;
            let change = RowChangeListEncoder::new(&schema).update(1, *val)?.build()?;
            tablet.update_row(&key_row, &change)?;
            println!("Updated key {}", key);
        }

        Commands::Delete { key } => {
            let tablet = open_tablet(args)?;
            let key_row = RowBuilder::key(&schema).add(*key)?.build()?;
            tablet.delete_row(&key_row)?;
            println!("Deleted key {}", key);
        }

        Commands::Flush => {
            open_tablet(args)?.flush()?;
            println!("Flushed");
        }

        Commands::Compact => {
            let tablet = open_tablet(args)?;
            let before = tablet.num_rowsets();
            tablet.compact()?;
            println!("Compacted: {} -> {} rowsets", before, tablet.num_rowsets());
        }

        Commands::Count => {
            println!("{}", open_tablet(args)?.count_rows()?);
        }

        Commands::Scan { limit } => {
            let tablet = open_tablet(args)?;
            let mut iter = tablet.new_row_iterator(tablet.schema())?;
            iter.init()?;
            let mut printed = 0usize;
            while let Some(row) = iter.next_row()? {
                if limit.map_or(false, |l| printed >= l) {
                    break;
                }
                println!("{}", tablet.schema().debug_row(&row.row));
                printed += 1;
            }
        }

        Commands::Info => {
            let tablet = open_tablet(args)?;
            println!("Tablet:   {}", tablet.dir().display());
            println!("Schema:   {}", tablet.schema());
            println!("Rows:     {}", tablet.count_rows()?);
            println!("Rowsets:  {}", tablet.num_rowsets());
            for name in tablet.describe_rowsets() {
                println!("  {}", name);
            }
        }
    }
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tablet_store=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("tablet-tool v{}", tablet_store::VERSION);

    if let Err(e) = run(&args) {
        error!("{}", e);
        process::exit(1);
    }
}
