use std::{
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use modal_drive_core::{
    error::DeviceError, Aligner, AppConfig, ControlWorker, DeviceSequencer, OutputController,
    SimulatedTransport, Step, TcpTransport, Transport, WaveformLoader,
};
use tracing_subscriber::EnvFilter;

mod interactive;

fn main() -> modal_drive_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Menu => {
            let (sequencer, worker) = start_worker(&config, cli.simulate)?;
            interactive::run_menu(worker, sequencer.catalog())
        }
        Commands::Panel => {
            let (_sequencer, worker) = start_worker(&config, cli.simulate)?;
            interactive::run_panel(worker)
        }
        Commands::Run { mode } => run_mode(&config, cli.simulate, mode),
        Commands::Align {
            first,
            second,
            no_invert,
            output,
        } => run_align(&config, &first, &second, !no_invert, output.as_deref()),
        Commands::Modes => list_modes(&config),
    }
}

fn load_config(cli: &Cli) -> modal_drive_core::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::load(path)?
        }
        None => AppConfig::default(),
    };
    if let Some(address) = &cli.address {
        config.device.address = address.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.waveform.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_transport(config: &AppConfig, simulate: bool) -> modal_drive_core::Result<Box<dyn Transport>> {
    if simulate {
        tracing::info!("using simulated generator");
        return Ok(Box::new(SimulatedTransport::new()));
    }
    let device = &config.device;
    tracing::info!(address = %device.address, "connecting to generator");
    let transport = TcpTransport::connect(&device.address, device.timeout())
        .map_err(|err| DeviceError::io(Step::Connect, err))?;
    Ok(Box::new(transport))
}

fn start_worker(
    config: &AppConfig,
    simulate: bool,
) -> modal_drive_core::Result<(DeviceSequencer, ControlWorker)> {
    let sequencer = DeviceSequencer::new(config)?;
    let session = sequencer.connect(open_transport(config, simulate)?)?;
    println!("Connected: {}", session.identity());
    let worker = ControlWorker::spawn(sequencer.clone(), session);
    Ok((sequencer, worker))
}

fn run_mode(config: &AppConfig, simulate: bool, mode: u8) -> modal_drive_core::Result<()> {
    let sequencer = DeviceSequencer::new(config)?;
    let mut session = sequencer.connect(open_transport(config, simulate)?)?;
    println!("Connected: {}", session.identity());

    let report = sequencer.switch_mode(&mut session, mode)?;
    interactive::print_report(&report);

    println!("Press Enter to stop.");
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;

    let steps = OutputController::new().stop(&mut session)?;
    interactive::print_stopped(&steps);
    session.close()
}

fn run_align(
    config: &AppConfig,
    first: &Path,
    second: &Path,
    invert_second: bool,
    output: Option<&Path>,
) -> modal_drive_core::Result<()> {
    let loader = WaveformLoader::new(config.waveform.parse_policy);
    let pair = Aligner::new().align(&loader.load(first)?, &loader.load(second)?, invert_second)?;

    println!(
        "{} points, interval {:.6e} s, {:.1} Sa/s, fundamental {:.3} Hz",
        pair.point_count,
        pair.interval(),
        pair.sample_rate,
        pair.fundamental_frequency()
    );
    for (channel, normalization) in pair.normalization.iter().enumerate() {
        println!("  channel {}: {:?}", channel + 1, normalization);
    }

    if let Some(path) = output {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &pair).map_err(io::Error::from)?;
        tracing::info!(?path, "aligned pair written");
    }
    Ok(())
}

fn list_modes(config: &AppConfig) -> modal_drive_core::Result<()> {
    let catalog = config.catalog()?;
    for mode in catalog.modes() {
        let (first, second) = mode.polarities();
        println!(
            "{mode}: CH1 {} [{}], CH2 {} [{}]",
            mode.channel1_file.display(),
            first.keyword(),
            mode.channel2_file.display(),
            second.keyword()
        );
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Dual-channel modal waveform driver", long_about = None)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Generator address (`host` or `host:port`), overriding the configuration.
    #[arg(short, long, global = true)]
    address: Option<String>,
    /// Directory the mode waveform files are resolved against.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Talk to an in-process simulated generator instead of the network.
    #[arg(long, global = true)]
    simulate: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Numbered text menu of the configured modes.
    Menu,
    /// Four-direction control panel (w/d/s/a, space, x, q).
    Panel,
    /// Configure one mode, run it until Enter is pressed, then stop.
    Run {
        /// Mode id from the catalog.
        mode: u8,
    },
    /// Align two waveform files without touching the generator.
    Align {
        first: PathBuf,
        second: PathBuf,
        /// Keep the second channel's sign.
        #[arg(long)]
        no_invert: bool,
        /// Write the aligned pair as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the mode catalog.
    Modes,
}
