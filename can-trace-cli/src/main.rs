//! CAN Trace Recorder CLI
//!
//! Command-line front end for the can-trace-core library:
//! - `record` captures live traffic into a PCAN `.TRC` file and prints the cycle table
//! - `inspect` reads a trace back and summarizes it per CAN id
//!
//! With `--simulate` the recorder runs against the in-process virtual bus fed by a
//! cyclic traffic generator, so the whole pipeline can be exercised without hardware.

use anyhow::{Context, Result};
use can_trace_core::adapter::{create_adapter, AdapterKind};
use can_trace_core::{
    Bitrate, CanAdapter, FileSink, Notification, SessionController, SessionState,
    TraceReader, VirtualAdapter, VirtualBus,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

mod config;
mod report;
mod simulate;

use config::{AppConfig, SummaryFormat};
use simulate::Simulator;

/// CAN Trace Recorder - Record live CAN traffic into PCAN trace files
#[derive(Parser, Debug)]
#[command(name = "can-trace")]
#[command(about = "Record live CAN traffic into PCAN .TRC files", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a session into a trace file
    Record(RecordArgs),

    /// Summarize an existing trace file
    Inspect {
        /// Trace file to read
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug)]
struct RecordArgs {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Adapter family
    #[arg(long, value_enum)]
    adapter: Option<AdapterArg>,

    /// Adapter channel (defaults per adapter)
    #[arg(long, value_name = "CHANNEL")]
    channel: Option<String>,

    /// Bus bitrate: 125k, 250k, 500k or 1M
    #[arg(short, long)]
    bitrate: Option<Bitrate>,

    /// Trace file to write
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration: Option<f64>,

    /// Stop after this many recorded frames
    #[arg(long, value_name = "COUNT")]
    max_frames: Option<u64>,

    /// Record synthetic traffic from the virtual bus
    #[arg(long)]
    simulate: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AdapterArg {
    Pcan,
    Kvaser,
    Usbcan,
    Virtual,
    Socketcan,
}

impl From<AdapterArg> for AdapterKind {
    fn from(arg: AdapterArg) -> Self {
        match arg {
            AdapterArg::Pcan => AdapterKind::Pcan,
            AdapterArg::Kvaser => AdapterKind::Kvaser,
            AdapterArg::Usbcan => AdapterKind::Usbcan,
            AdapterArg::Virtual => AdapterKind::Virtual,
            AdapterArg::Socketcan => AdapterKind::Socketcan,
        }
    }
}

/// Recording runs this long when neither a duration nor a frame limit is given
const DEFAULT_DURATION: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("CAN Trace Recorder v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using core library v{}", can_trace_core::VERSION);

    match args.command {
        Command::Record(record_args) => record(record_args),
        Command::Inspect { file, json } => inspect(&file, json),
    }
}

/// Merge the config file (if any) with command line overrides
fn resolve_config(args: &RecordArgs) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(adapter) = args.adapter {
        config.adapter.kind = adapter.into();
    }
    if args.simulate {
        config.adapter.kind = AdapterKind::Virtual;
    }
    if let Some(channel) = &args.channel {
        config.adapter.channel = Some(channel.clone());
    }
    if let Some(bitrate) = args.bitrate {
        config.adapter.bitrate = bitrate;
    }
    if let Some(output) = &args.output {
        config.output.path = output.clone();
    }
    if args.json {
        config.output.summary = SummaryFormat::Json;
    }
    Ok(config)
}

/// How long to record; `None` when only a frame limit applies
fn recording_limit(args: &RecordArgs) -> Result<Option<Duration>> {
    match (args.duration, args.max_frames) {
        (Some(secs), _) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .with_context(|| format!("Invalid recording duration: {} s", secs)),
        (None, Some(_)) => Ok(None),
        (None, None) => Ok(Some(DEFAULT_DURATION)),
    }
}

fn record(args: RecordArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let limit = recording_limit(&args)?;
    let channel = config.adapter.channel_or_default();
    let bitrate = config.adapter.bitrate;

    let virtual_bus = (config.adapter.kind == AdapterKind::Virtual)
        .then(|| VirtualBus::new(channel.clone()));
    let adapter: Box<dyn CanAdapter> = match &virtual_bus {
        Some(bus) => Box::new(VirtualAdapter::new(bus.clone())),
        None => create_adapter(&config.adapter)
            .with_context(|| format!("Failed to create {} adapter", config.adapter.kind))?,
    };

    let sink = FileSink::create(&config.output.path)
        .with_context(|| format!("Failed to create trace file: {:?}", config.output.path))?;

    let mut session = SessionController::new(adapter, config.session.clone());
    let notifications = session.subscribe(1024);
    session
        .start(&channel, bitrate, Box::new(sink))
        .with_context(|| format!("Failed to start recording on {}", channel))?;
    log::info!("Recording to {:?}", config.output.path);

    // The virtual adapter drops frames queued before open, so traffic starts afterwards
    let simulator = match &virtual_bus {
        Some(bus) => Some(Simulator::start(
            bus.clone(),
            &config.simulation.messages_or_default(),
        )?),
        None => None,
    };

    let started = Instant::now();
    let mut lines = 0u64;

    loop {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        if args.max_frames.is_some_and(|max| lines >= max) {
            break;
        }
        match notifications.recv_timeout(Duration::from_millis(100)) {
            Ok(Notification::Line(line)) => {
                lines = line.sequence;
                log::trace!("{}", line.text);
            }
            Ok(Notification::StateChange(change)) if change.to == SessionState::Faulted => break,
            Ok(_) | Err(_) => {}
        }
    }

    session.stop().context("Failed to finalize trace")?;
    if let Some(simulator) = simulator {
        simulator.stop();
    }

    let stats = session.cycle_stats();
    let diagnostics = session.diagnostics();
    let fault = session.fault();

    match config.output.summary {
        SummaryFormat::Json => {
            let value =
                report::summary_json(session.info(), &stats, &diagnostics, fault.as_ref());
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        SummaryFormat::Text => {
            println!("{}", report::render_cycle_table(&stats));
            println!("Diagnostics:");
            print!("{}", report::render_diagnostics(&diagnostics));
            println!("\nTrace written to {:?}", config.output.path);
        }
    }

    match fault {
        Some(fault) => Err(anyhow::anyhow!("Recording faulted: {}", fault)),
        None => Ok(()),
    }
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let trace = TraceReader::read_file(path)
        .with_context(|| format!("Failed to inspect trace file: {:?}", path))?;
    let summary = report::InspectReport::from_trace(&trace);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RecordArgs {
        match Args::parse_from(args).command {
            Command::Record(record_args) => record_args,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&[
            "can-trace", "record", "--adapter", "pcan", "--bitrate", "250k", "-o", "out.trc",
        ]);
        let config = resolve_config(&args).unwrap();

        assert_eq!(config.adapter.kind, AdapterKind::Pcan);
        assert_eq!(config.adapter.bitrate, Bitrate::Kbps250);
        assert_eq!(
            config.adapter.channel_or_default(),
            AdapterKind::Pcan.default_channel()
        );
        assert_eq!(config.output.path, PathBuf::from("out.trc"));
        assert_eq!(config.output.summary, SummaryFormat::Text);
    }

    #[test]
    fn test_simulate_forces_virtual_adapter() {
        let args = parse(&["can-trace", "record", "--adapter", "kvaser", "--simulate", "--json"]);
        let config = resolve_config(&args).unwrap();

        assert_eq!(config.adapter.kind, AdapterKind::Virtual);
        assert_eq!(config.output.summary, SummaryFormat::Json);
    }

    #[test]
    fn test_recording_limit() {
        let limit = |extra: &[&str]| {
            let mut argv = vec!["can-trace", "record"];
            argv.extend_from_slice(extra);
            recording_limit(&parse(&argv))
        };

        assert_eq!(limit(&[]).unwrap(), Some(DEFAULT_DURATION));
        assert_eq!(limit(&["--max-frames", "10"]).unwrap(), None);
        assert_eq!(
            limit(&["--duration", "1.5"]).unwrap(),
            Some(Duration::from_millis(1_500))
        );
        assert!(limit(&["--duration", "inf"]).is_err());
        assert!(limit(&["--duration=-1"]).is_err());
        assert!(limit(&["--duration", "NaN"]).is_err());
    }

    #[test]
    fn test_simulated_recording_writes_trace() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sim.trc");
        let output_arg = output.to_string_lossy().to_string();
        let args = parse(&[
            "can-trace", "record", "--simulate", "--duration", "0.3", "-o", &output_arg,
        ]);

        record(args).unwrap();

        let trace = TraceReader::read_file(&output).unwrap();
        assert!(!trace.records.is_empty());
        assert!(trace
            .records
            .windows(2)
            .all(|w| w[0].sequence + 1 == w[1].sequence));
    }
}
