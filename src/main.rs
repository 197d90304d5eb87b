use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hifitime::Epoch;
use log::{LevelFilter, debug, error, info};
use serialport::SerialPort;

use ubx_fusion::Result;
use ubx_fusion::config_session::{ConfigSession, SessionConfig};
use ubx_fusion::nav_fusion::{FusionConfig, Measurement, PrecisionMode, StreamFusion, fuse_batch};
use ubx_fusion::ubx_config::{Layers, Registry, parse_config_requests};
use ubx_fusion::ubx_logbook::{
    LogWriter, StreamFormat, converted_path, format_stream_line, log_file_name, read_records,
    write_measurements,
};
use ubx_fusion::ubx_messages::read_nav_records;

const DEFAULT_BAUD_RATE: u32 = 460_800;
const SERIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DEFINITIONS: &str = "definitions/zed-fp9-interface-description.txt";

#[derive(Parser)]
#[command(name = "ubx-fusion", version, about = "u-blox UBX configurator, logger and navigation fusion")]
struct Cli {
    /// Log at debug level, including dropped frames and read errors
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the settings of a config file with CFG-VALSET
    Configure {
        /// Serial device
        device: String,
        /// Config file, one `NAME VALUE` per line
        config: PathBuf,
        #[arg(short = 'b', long = "baud", default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
        /// Key definitions, one `NAME HEXKEY TYPE` per line
        #[arg(long, default_value = DEFAULT_DEFINITIONS)]
        definitions: PathBuf,
        /// Store to flash memory in addition to RAM
        #[arg(long)]
        flash: bool,
        /// Keep going when a setting is rejected
        #[arg(long)]
        skip_nak: bool,
    },
    /// Record UBX-NAV messages to a JSON-lines file until ENTER is pressed
    Log {
        device: String,
        #[arg(short = 'b', long = "baud", default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
        /// Output directory
        #[arg(short = 'o', long = "output", default_value = "output")]
        output: PathBuf,
    },
    /// Fuse a recording into `<name>-gps.jsonl`
    Convert {
        file: PathBuf,
        /// Ignore high precision positions
        #[arg(long)]
        low: bool,
    },
    /// Print fused solutions to stdout until ENTER is pressed
    Stream {
        device: String,
        #[arg(short = 'b', long = "baud", default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
        #[arg(long)]
        json: bool,
        /// Print solutions missing some of their messages
        #[arg(long)]
        incomplete: bool,
        /// Ignore high precision positions
        #[arg(long)]
        low: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let result = match cli.command {
        Command::Configure {
            device,
            config,
            baud,
            definitions,
            flash,
            skip_nak,
        } => configure(&device, baud, &config, &definitions, flash, skip_nak),
        Command::Log { device, baud, output } => record(&device, baud, &output),
        Command::Convert { file, low } => convert(&file, low),
        Command::Stream {
            device,
            baud,
            json,
            incomplete,
            low,
        } => {
            let format = if json { StreamFormat::Json } else { StreamFormat::Plain };
            let config = FusionConfig {
                precision: if low { PrecisionMode::Low } else { PrecisionMode::Auto },
                allow_incomplete: incomplete,
            };
            stream(&device, baud, format, config)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn open_port(device: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(device, baud)
        .timeout(SERIAL_TIMEOUT)
        .data_bits(serialport::DataBits::Eight)
        .open()?;
    debug!("opened {device} at {baud} baud");
    Ok(port)
}

/// Raised once a line is read from stdin. A closed stdin never raises it.
fn stop_on_enter() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    thread::spawn(move || {
        let mut line = String::new();
        if matches!(io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            flag.store(true, Ordering::Relaxed);
        }
    });
    stop
}

fn configure(
    device: &str,
    baud: u32,
    config: &Path,
    definitions: &Path,
    flash: bool,
    skip_nak: bool,
) -> Result<()> {
    let registry = Registry::from_path(definitions)?;
    info!("loaded {} key definitions from {}", registry.len(), definitions.display());
    let requests = parse_config_requests(BufReader::new(File::open(config)?))?;

    let port = open_port(device, baud)?;
    let reader = port.try_clone()?;
    let session_config = SessionConfig {
        layers: Layers { ram: true, flash },
        skip_nak,
        ..Default::default()
    };
    let mut session = ConfigSession::start(reader, port, session_config);
    let outcome = session.run(&requests, &registry);
    session.shutdown();

    let report = outcome.inspect_err(|_| error!("CONFIGURATION FAILED"))?;
    info!(
        "done: {} settings applied, {} skipped",
        report.applied.len(),
        report.skipped.len()
    );
    Ok(())
}

fn record(device: &str, baud: u32, output: &Path) -> Result<()> {
    fs::create_dir_all(output)?;
    let path = output.join(log_file_name(Epoch::now()?));
    let mut port = open_port(device, baud)?;
    let mut writer = LogWriter::new(BufWriter::new(File::create(&path)?));

    info!("logging UBX-NAV messages to {}", path.display());
    println!("Press ENTER to stop recording...");
    let stop = stop_on_enter();
    read_nav_records(&mut port, &stop, |record| {
        if !writer.write_record(&record)? {
            debug!("{} has no payload to log", record.name());
        }
        Ok(())
    })?;
    writer.flush()?;
    info!("{} messages written", writer.written());
    Ok(())
}

fn convert(file: &Path, low: bool) -> Result<()> {
    info!("starting processing of {}", file.display());
    let records = read_records(BufReader::new(File::open(file)?))?;
    let precision = if low { PrecisionMode::Low } else { PrecisionMode::Auto };
    let measurements = fuse_batch(records, precision);

    let output = converted_path(file);
    write_measurements(BufWriter::new(File::create(&output)?), &measurements)?;
    info!("{} measurements written to {}", measurements.len(), output.display());
    Ok(())
}

fn stream(device: &str, baud: u32, format: StreamFormat, config: FusionConfig) -> Result<()> {
    let mut port = open_port(device, baud)?;
    let mut fusion = StreamFusion::new(config);
    let mut stdout = io::stdout().lock();

    let stop = stop_on_enter();
    read_nav_records(&mut port, &stop, |record| {
        if let Some(measurement) = fusion.push(record) {
            print_measurement(&mut stdout, &measurement, format)?;
        }
        Ok(())
    })?;
    if let Some(measurement) = fusion.finish() {
        print_measurement(&mut stdout, &measurement, format)?;
    }
    Ok(())
}

fn print_measurement<W: Write>(out: &mut W, measurement: &Measurement, format: StreamFormat) -> Result<()> {
    writeln!(out, "{}", format_stream_line(measurement, format)?)?;
    out.flush()?;
    Ok(())
}
