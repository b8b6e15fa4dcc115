mod shaders;
mod verify;
mod vulkan;

use clap::{Parser, Subcommand, ValueEnum};

use gpurt_core::config::{default_config_path, RuntimeConfig};

#[derive(Parser)]
#[command(name = "gpurt")]
#[command(about = "GPU resource runtime - verification and configuration tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the end-to-end runtime checks against a driver backend
    Verify {
        /// Driver backend to run against
        #[arg(short, long, value_enum, default_value_t = Backend::Null)]
        backend: Backend,

        /// Fence latency of the null backend, in milliseconds
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,

        /// Output results as JSON
        #[arg(long)]
        json: bool,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Path to configuration file
        #[arg(short, long)]
        path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Host-only driver, no GPU required
    Null,
    /// First Vulkan 1.3 device found by the loader
    Vulkan,
}

fn main() -> anyhow::Result<()> {
    gpurt_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify {
            backend,
            latency_ms,
            json,
            config,
        } => {
            let passed = verify::run_verify(backend, latency_ms, config.as_deref(), json)?;
            if !passed {
                std::process::exit(1);
            }
        }

        Commands::Config { path } => {
            let path = path.unwrap_or_else(default_config_path);
            let config = if std::path::Path::new(&path).exists() {
                RuntimeConfig::load(&path)?
            } else {
                eprintln!("# {} not found, showing defaults", path);
                RuntimeConfig::default()
            };
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
