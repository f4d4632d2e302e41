use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use s2_mosaic::app::{App, ProgressSink, mosaic_files};
use s2_mosaic::archive::{ArchiveHttpClient, Credentials, Session};
use s2_mosaic::config::{ConfigLoader, ResolvedConfig};
use s2_mosaic::domain::TileCode;
use s2_mosaic::error::MosaicError;
use s2_mosaic::output::{ConsoleOutput, JsonOutput, OutputMode};
use s2_mosaic::raster::GeoTiffIo;
use s2_mosaic::retrieval::Cancellation;
use s2_mosaic::store::Store;

#[derive(Parser)]
#[command(name = "s2-mosaic")]
#[command(about = "Download Sentinel-2 bands for a region and stitch them into an RGB mosaic")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        about = "Select tiles, download bands, build composites and the mosaic",
        long_about = "Select tiles, download bands, build composites and the mosaic.\n\n\
                      Bands are decoded with the bundled GeoTIFF reader. Archives that serve \
                      JPEG 2000 (.jp2) bands are downloaded and verified, but compositing them \
                      needs a RasterIo backend that decodes JPEG 2000; with the bundled reader \
                      those tiles are reported as failed."
    )]
    Run(ConfigArgs),
    #[command(about = "List the grid tiles intersecting the region")]
    Tiles(ConfigArgs),
    #[command(about = "Search the archive for one selected tile")]
    Search(SearchArgs),
    #[command(about = "Mosaic existing composite GeoTIFFs")]
    Mosaic(MosaicArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct SearchArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    tile: String,
}

#[derive(Args)]
struct MosaicArgs {
    #[arg(long)]
    output: Utf8PathBuf,

    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<MosaicError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MosaicError) -> u8 {
    match error {
        MosaicError::MissingConfig | MosaicError::ConfigRead(_) | MosaicError::ConfigParse(_) => 2,
        MosaicError::Transport(_) | MosaicError::Status { .. } | MosaicError::Remote { .. } => 3,
        MosaicError::Auth { .. } => 4,
        MosaicError::Integrity { .. } => 5,
        MosaicError::Cancelled => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let cancellation = install_interrupt_handler()?;
    let console = ConsoleOutput;
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &console,
        OutputMode::NonInteractive => &JsonOutput,
    };

    match cli.command {
        Commands::Run(args) => {
            let config = ConfigLoader::resolve(args.config.as_deref())?;
            let app = build_app(&config, cancellation)?;
            let report = app.run(&config, sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_run(&report).into_diagnostic()?,
                OutputMode::Interactive => ConsoleOutput::print_run_summary(&report),
            }
            if report.any_failed() {
                return Err(miette::Report::msg("one or more tiles or bands failed"));
            }
            Ok(())
        }
        Commands::Tiles(args) => {
            let config = ConfigLoader::resolve(args.config.as_deref())?;
            let app = build_app(&config, cancellation)?;
            let result = app.list_tiles(&config, sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_tiles(&result).into_diagnostic()?,
                OutputMode::Interactive => ConsoleOutput::print_tiles(&result),
            }
            Ok(())
        }
        Commands::Search(args) => {
            let config = ConfigLoader::resolve(args.config.as_deref())?;
            let tile: TileCode = args.tile.parse()?;
            let app = build_app(&config, cancellation)?;
            let result = app.search(&config, &tile, sink)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_search(&result).into_diagnostic()?
                }
                OutputMode::Interactive => ConsoleOutput::print_search(&result),
            }
            Ok(())
        }
        Commands::Mosaic(args) => {
            let result = mosaic_files(&GeoTiffIo, &args.inputs, &args.output, sink)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_mosaic(&result).into_diagnostic()?
                }
                OutputMode::Interactive => println!(
                    "mosaic {} ({}x{}) from {} composite(s)",
                    result.output, result.width, result.height, result.inputs
                ),
            }
            Ok(())
        }
    }
}

fn install_interrupt_handler() -> miette::Result<Cancellation> {
    let cancellation = Cancellation::new();
    let token = cancellation.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current step");
        token.cancel();
    })
    .map_err(|err| miette::miette!("failed to set signal handler: {err}"))?;
    Ok(cancellation)
}

fn build_app(
    config: &ResolvedConfig,
    cancellation: Cancellation,
) -> Result<App<ArchiveHttpClient, GeoTiffIo>, MosaicError> {
    let credentials = Credentials::from_env();
    if credentials.is_none() {
        warn!("S2M_USERNAME/S2M_PASSWORD not set, requests are sent without credentials");
    }
    let mut session = Session::new(config.search_url.clone(), credentials);
    if let Some(timeout) = config.connect_timeout {
        session.connect_timeout = timeout;
    }
    if let Some(timeout) = config.read_timeout {
        session.read_timeout = timeout;
    }
    let archive = ArchiveHttpClient::new(session)?;
    Ok(App::new(Store::new(config.output.clone()), archive, GeoTiffIo).with_cancellation(cancellation))
}
