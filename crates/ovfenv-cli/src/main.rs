//! ovfenv CLI - Read OVF environment metadata and user-data.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ovfenv_core::transport::{
    DEFAULT_CDROM_DEVICE_PATTERN, DEFAULT_GUESTINFO_KEY, DEFAULT_MOUNTS_PATH, DEFAULT_VMTOOLSD,
};
use ovfenv_core::{DataSource, DataSourceOptions, Error, FetchOutcome, OvfData};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code when no transport found an OVF environment.
const EXIT_NOT_APPLICABLE: u8 = 2;

/// Read the OVF environment of a VMware guest.
#[derive(Parser)]
#[command(name = "ovfenv")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (including transport failures).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the transports of this guest and print what they deliver.
    Fetch {
        /// Guest tools binary.
        #[arg(long, default_value = DEFAULT_VMTOOLSD)]
        vmtoolsd: PathBuf,

        /// Guestinfo key holding the OVF environment.
        #[arg(long, default_value = DEFAULT_GUESTINFO_KEY)]
        guestinfo_key: String,

        /// Mount table to scan for seed media.
        #[arg(long, default_value = DEFAULT_MOUNTS_PATH)]
        mounts: PathBuf,

        /// Extra directory to search for ovf-env.xml (repeatable).
        #[arg(long = "seed-dir")]
        seed_dirs: Vec<PathBuf>,

        /// Regex matching CD-ROM device names.
        #[arg(long, default_value = DEFAULT_CDROM_DEVICE_PATTERN)]
        cdrom_regex: String,

        /// Do not mount unmounted ISO9660 devices.
        #[arg(long)]
        no_mount: bool,

        /// Output format.
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Read a local OVF environment document.
    Parse {
        /// Path to the environment document.
        file: PathBuf,

        /// Output format.
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

/// Output format argument.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Instance id and seed followed by the user-data.
    Text,
    /// A JSON object with seed, metadata and user-data.
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Fetch {
            vmtoolsd,
            guestinfo_key,
            mounts,
            seed_dirs,
            cdrom_regex,
            no_mount,
            format,
        } => {
            let mut options = DataSourceOptions::default()
                .with_vmtoolsd(vmtoolsd)
                .with_guestinfo_key(guestinfo_key)
                .with_mounts_path(mounts)
                .with_cdrom_pattern(cdrom_regex)
                .with_mount_devices(!no_mount);
            for dir in seed_dirs {
                options = options.with_seed_dir(dir);
            }
            run_fetch(&options, format)
        }
        Commands::Parse { file, format } => {
            run_parse(&file, format)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_fetch(options: &DataSourceOptions, format: OutputFormat) -> Result<ExitCode> {
    let source = DataSource::new(options)?;
    tracing::debug!("probing transports {:?}", source.transport_names());

    match source.fetch().context("reading OVF environment")? {
        FetchOutcome::Found(data) => {
            print_data(&data, format)?;
            Ok(ExitCode::SUCCESS)
        }
        FetchOutcome::NotApplicable => {
            eprintln!("{}", Error::NotFound);
            Ok(ExitCode::from(EXIT_NOT_APPLICABLE))
        }
    }
}

fn run_parse(file: &Path, format: OutputFormat) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| Error::io(e, file))
        .context("reading environment document")?;
    let data = OvfData::from_document(file.display().to_string(), content)
        .with_context(|| format!("parsing {}", file.display()))?;
    print_data(&data, format)
}

fn print_data(data: &OvfData, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("# seed: {}", data.seed);
            for (key, value) in data.metadata.iter() {
                println!("# {}: {}", key, value);
            }
            print!("{}", data.userdata);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
    }
    Ok(())
}

fn init_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ovfenv_core=debug,ovfenv=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}
