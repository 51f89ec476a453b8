// src/main.rs
//! Tailor Configuration-Management Server - CLI Entry Point

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tailor::core::{Core, Deadline};
use tailor::options::Options;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "tailor")]
#[command(author = "Tailor Project")]
#[command(version)]
#[command(about = "Configuration-management server that synthesizes per-host configurations", long_about = None)]
struct Cli {
    /// Path to the options file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Repository root (overrides the options file)
    #[arg(short, long, global = true)]
    repository: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configuration server
    Serve {
        /// Bind address (overrides the options file)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Load the repository and validate every declared client
    Check,

    /// Synthesize and print one client's configuration
    Config {
        /// Client name
        client: String,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn load_options(cli: &Cli) -> Result<Options> {
    let mut options = Options::load_or_default(cli.config.as_deref())?;
    if let Some(repository) = &cli.repository {
        options.repository = repository.clone();
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tailor=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { listen } => {
            let mut options = load_options(&cli)?;
            if let Some(listen) = listen {
                options.server.listen = listen.clone();
            }
            tailor::server::run_server(options).await
        }

        Commands::Check => {
            let options = Arc::new(load_options(&cli)?);
            let core = Core::open(options)?;
            let results = core.check_all();
            let mut failures = 0;
            for (client, outcome) in &results {
                match outcome {
                    None => println!("ok      {client}"),
                    Some(err) => {
                        failures += 1;
                        println!("error   {client}: {err}");
                    }
                }
            }
            println!("{} clients checked, {} failed", results.len(), failures);
            if failures > 0 {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Config { client } => {
            let options = Arc::new(load_options(&cli)?);
            let core = Core::open(options)?;
            let doc = core.build_config(client, &Deadline::none())?;
            println!("{}", doc.to_document());
            Ok(())
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
