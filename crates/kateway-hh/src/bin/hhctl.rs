use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kateway_hh::storage::disk::{
    Block, Cursor, DirectoryLock, Position, Segment, SyncMode, common::list_segment_ids, service,
};
use kateway_hh::{ClusterTopic, ConfigLoader, HhError, HintedHandoffConfig, Queue};

#[derive(Parser, Debug)]
#[command(
    name = "hhctl",
    version,
    author,
    about = "Inspect and repair hinted-handoff queues on disk"
)]
struct Cli {
    /// Hinted-handoff configuration file (.json, .yaml or .yml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory; overrides the one in --config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List queues found in the data directory
    List,
    /// Show segments, block counts and the cursor of one queue
    Inspect(QueueCmd),
    /// Rewrite the cursor of a queue whose checkpoint is out of range
    ResetCursor(ResetCursorCmd),
}

#[derive(Args, Debug)]
struct QueueCmd {
    #[arg(long)]
    cluster: String,
    #[arg(long)]
    topic: String,
}

#[derive(Args, Debug)]
struct ResetCursorCmd {
    #[command(flatten)]
    queue: QueueCmd,
    /// Segment to resume from (default: oldest segment on disk)
    #[arg(long)]
    segment: Option<u64>,
    /// Byte offset inside the segment
    #[arg(long, default_value_t = 0)]
    offset: u64,
}

fn load_config(cli: &Cli) -> Result<HintedHandoffConfig, HhError> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::from_path(path)?,
        None => HintedHandoffConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn list(config: &HintedHandoffConfig) -> Result<(), HhError> {
    for ct in service::discover_queues(&config.data_dir)? {
        println!("{ct}");
    }
    Ok(())
}

fn inspect(config: &HintedHandoffConfig, ct: &ClusterTopic) -> Result<(), HhError> {
    let dir = Queue::dir_for(&config.data_dir, ct);
    let ids = list_segment_ids(&dir)
        .map_err(|e| HhError::from_io_error(e, "Failed to list segments"))?;
    let first = ids.first().copied().unwrap_or(0);

    match Cursor::load(&dir, SyncMode::None, first) {
        Ok(cursor) => match cursor.persisted_position() {
            Some(position) => println!("cursor: {position}"),
            None => println!("cursor: none (starts at {})", cursor.read_position()),
        },
        Err(e) => println!("cursor: unreadable ({e})"),
    }

    println!("{:>20}  {:>12}  {:>8}  status", "segment", "bytes", "blocks");
    let mut block = Block::default();
    for id in ids {
        let segment = Segment::open(&dir, id, SyncMode::None, config.max_block_size)?;
        let mut reader = segment.reader(0)?;
        let mut blocks = 0u64;
        let status = loop {
            match reader.read_block(&mut block) {
                Ok(_) => blocks += 1,
                Err(HhError::EndOfSegment) => break "ok".to_string(),
                Err(e) => break format!("corrupt at {}: {e}", reader.position()),
            }
        };
        println!("{id:>20}  {:>12}  {blocks:>8}  {status}", segment.size());
    }
    Ok(())
}

fn reset_cursor(config: &HintedHandoffConfig, cmd: &ResetCursorCmd) -> Result<(), HhError> {
    // Holding the directory lock guarantees no service is running the queue.
    let _lock = DirectoryLock::acquire(&config.data_dir)?;

    let ct = ClusterTopic::new(cmd.queue.cluster.as_str(), cmd.queue.topic.as_str());
    let dir = Queue::dir_for(&config.data_dir, &ct);
    let ids = list_segment_ids(&dir)
        .map_err(|e| HhError::from_io_error(e, "Failed to list segments"))?;

    let segment_id = cmd.segment.or_else(|| ids.first().copied()).unwrap_or(0);
    if ids.contains(&segment_id) {
        // A mid-record offset would make the pump decode garbage lengths.
        Segment::open(&dir, segment_id, SyncMode::None, config.max_block_size)?
            .check_block_boundary(cmd.offset)?;
    } else if !(ids.is_empty() && cmd.offset == 0) {
        return Err(HhError::CursorOutOfRange {
            segment: segment_id,
            offset: cmd.offset,
        });
    }

    let position = Position::new(segment_id, cmd.offset);
    Cursor::reset(&dir, position, config.sync_mode)?;
    println!("{ct}: cursor reset to {position}");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    kateway_hh::telemetry::init_with_default("warn");

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::List => list(&config)?,
        Commands::Inspect(cmd) => {
            inspect(&config, &ClusterTopic::new(cmd.cluster.as_str(), cmd.topic.as_str()))?
        }
        Commands::ResetCursor(cmd) => reset_cursor(&config, cmd)?,
    }
    Ok(())
}
