//! fixreplay - operator tool for FIX gateway replay archives

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use fixreplay_core::config::LogFormat;
use fixreplay_core::frame::FrameView;
use fixreplay_core::logging::{LogLevel, init_logging};
use fixreplay_core::{
    CollectingErrorSink, ControlAction, ErrorSink, IndexEntry, RecordSummary, ReplayConfig,
    ReplayRange, ReplayStore, SequenceKey, SessionId, StreamId, UpperBound,
};

#[derive(Parser)]
#[command(name = "fixreplay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "FIXREPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding archive and index files
    #[arg(long, global = true, env = "FIXREPLAY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Stream id of the archive
    #[arg(long, global = true)]
    stream_id: Option<StreamId>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log output format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive and index one message
    Append {
        /// Session id
        #[arg(short, long)]
        session: SessionId,

        /// Sequence key as <sequence index>:<sequence number>
        #[arg(short, long)]
        key: SequenceKey,

        /// Message body
        #[arg(long, conflicts_with = "body_file", required_unless_present = "body_file")]
        body: Option<String>,

        /// Read the message body from a file
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Character in --body to translate to SOH (0x01), e.g. '|'
        #[arg(long)]
        soh: Option<char>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Replay the messages of a session within a key range
    Query {
        /// Session id
        #[arg(short, long)]
        session: SessionId,

        /// First key of the range, inclusive
        #[arg(long, default_value = "0:0")]
        begin: SequenceKey,

        /// Last key of the range, inclusive, or `latest`
        #[arg(long, default_value = "latest")]
        end: EndKey,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// List the index entries of a session
    Inspect {
        /// Session id
        #[arg(short, long)]
        session: SessionId,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable, SOH shown as '|'
    Text,
    /// Raw frame bytes as hex, one frame per line
    Hex,
    Json,
}

/// Upper end of a query range on the command line.
#[derive(Clone, Copy)]
struct EndKey(UpperBound);

impl std::str::FromStr for EndKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self(UpperBound::MostRecent));
        }
        s.parse().map(|key| Self(UpperBound::Inclusive(key)))
    }
}

#[derive(Serialize)]
struct ReplayedMessage {
    sequence_index: u32,
    sequence_number: u32,
    frame_length: usize,
    body: String,
}

#[derive(Serialize)]
struct QueryReport {
    session_id: SessionId,
    range: String,
    delivered: usize,
    messages: Vec<ReplayedMessage>,
}

#[derive(Serialize)]
struct InspectReport {
    session_id: SessionId,
    stream_id: StreamId,
    index_path: PathBuf,
    archive_path: PathBuf,
    entries: Vec<IndexEntry>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    let sink = Arc::new(CollectingErrorSink::new());
    let store = ReplayStore::open(config, Arc::clone(&sink) as Arc<dyn ErrorSink>)
        .context("Failed to open replay store")?;

    match cli.command {
        Commands::Append {
            session,
            key,
            body,
            body_file,
            soh,
            output,
        } => {
            let body = load_body(body, body_file.as_deref(), soh)?;
            append(&store, session, key, &body, output)?;
        }
        Commands::Query {
            session,
            begin,
            end,
            output,
        } => query(&store, session, ReplayRange::new(begin, end.0), output)?,
        Commands::Inspect { session, output } => inspect(&store, session, output)?,
    }

    store.flush();
    if !sink.is_empty() {
        bail!("storage faults reported: {}", sink.messages().join("; "));
    }
    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<ReplayConfig> {
    let mut config = match &cli.config {
        Some(path) => ReplayConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ReplayConfig::default(),
    };
    if let Some(dir) = &cli.log_dir {
        config.log_dir.clone_from(dir);
    }
    if let Some(stream_id) = cli.stream_id {
        config.stream_id = stream_id;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level.as_str().to_string();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

fn load_body(
    body: Option<String>,
    body_file: Option<&Path>,
    soh: Option<char>,
) -> anyhow::Result<Vec<u8>> {
    if let Some(path) = body_file {
        return std::fs::read(path)
            .with_context(|| format!("Failed to read body file {}", path.display()));
    }
    let Some(body) = body else {
        bail!("either --body or --body-file is required");
    };
    Ok(match soh {
        Some(delimiter) => body.replace(delimiter, "\x01").into_bytes(),
        None => body.into_bytes(),
    })
}

fn append(
    store: &ReplayStore,
    session: SessionId,
    key: SequenceKey,
    body: &[u8],
    output: OutputFormat,
) -> anyhow::Result<()> {
    let recorded = store
        .record(session, key, body)
        .with_context(|| format!("Failed to append {key} to session {session}"))?;
    let summary = RecordSummary::from(&recorded);
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
        OutputFormat::Text | OutputFormat::Hex => println!(
            "session={} key={} position={} length={} index={}",
            summary.appended.session_id,
            summary.appended.key,
            summary.appended.position,
            summary.appended.frame_length,
            summary.index_outcome
        ),
    }
    if !summary.indexed {
        bail!(
            "message archived but not indexed ({})",
            summary.index_outcome
        );
    }
    Ok(())
}

fn query(
    store: &ReplayStore,
    session: SessionId,
    range: ReplayRange,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let mut messages = Vec::new();
    let mut frames = Vec::new();
    let mut handler = |frame: &[u8]| {
        if let Ok(view) = FrameView::parse(frame) {
            messages.push(ReplayedMessage {
                sequence_index: view.header.key.sequence_index,
                sequence_number: view.header.key.sequence_number,
                frame_length: frame.len(),
                body: printable(view.body),
            });
        }
        if output == OutputFormat::Hex {
            frames.push(hex::encode(frame));
        }
        ControlAction::Continue
    };
    let delivered = store.query_range(&mut handler, session, range);
    tracing::debug!(session_id = session, %range, delivered, "query finished");

    match output {
        OutputFormat::Json => {
            let report = QueryReport {
                session_id: session,
                range: range.to_string(),
                delivered,
                messages,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Hex => {
            for line in frames {
                println!("{line}");
            }
        }
        OutputFormat::Text => {
            for message in &messages {
                println!(
                    "{}:{}\t{}",
                    message.sequence_index, message.sequence_number, message.body
                );
            }
            println!("{delivered} message(s) replayed");
        }
    }
    Ok(())
}

fn inspect(store: &ReplayStore, session: SessionId, output: OutputFormat) -> anyhow::Result<()> {
    let config = store.config();
    let report = InspectReport {
        session_id: session,
        stream_id: config.stream_id,
        index_path: config.index_path(session),
        archive_path: config.archive_path(session),
        entries: store.entries(session),
    };
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text | OutputFormat::Hex => {
            println!("index:   {}", report.index_path.display());
            println!("archive: {}", report.archive_path.display());
            for entry in &report.entries {
                println!(
                    "{}\tposition={}\tlength={}",
                    entry.key, entry.position, entry.frame_length
                );
            }
            match report.entries.last() {
                Some(last) => println!("{} entries, latest {}", report.entries.len(), last.key),
                None => println!("0 entries"),
            }
        }
    }
    Ok(())
}

fn printable(body: &[u8]) -> String {
    String::from_utf8_lossy(body).replace('\x01', "|")
}
