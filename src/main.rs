use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use thumbwheel::app::App;
use thumbwheel::config::Config;

mod commands;

#[derive(Parser)]
#[command(
    name = "thumbwheel",
    version,
    about = "Rotates video thumbnails through campaign variants and collects their analytics",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "THUMBWHEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configuration file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick loop and the HTTP trigger until interrupted
    Serve {
        /// Only serve the HTTP trigger; rotations come from an external cron
        #[arg(long, default_value = "false")]
        no_driver: bool,
    },

    /// Run one rotation tick and print the report
    Tick {
        /// Maximum campaigns to dispatch
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Run the analytics finalizer once and print the report
    Finalize,

    /// Manage campaigns
    Campaign {
        #[command(subcommand)]
        action: CampaignAction,
    },

    /// Manage owner credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
}

#[derive(Subcommand)]
enum CampaignAction {
    /// Create a campaign from a JSON file
    Add {
        /// JSON file with owner, target_resource, variants, window and cadence
        file: PathBuf,
    },

    /// Show one campaign with its rotation log and performance records
    Show {
        /// Campaign ID
        id: Uuid,
    },

    /// List all campaigns
    List,
}

#[derive(Subcommand)]
enum CredentialsAction {
    /// Store an owner's OAuth refresh token
    Set {
        /// Owner the token belongs to
        owner: String,

        /// Refresh token issued for the owner
        #[arg(long, env = "THUMBWHEEL_REFRESH_TOKEN")]
        refresh_token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    // Initialize tracing/logging
    setup_tracing(&config.logging.format, &config.logging.level, cli.verbose)?;

    tracing::info!("thumbwheel starting");

    if let Err(e) = thumbwheel::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    let app = App::from_config(config).context("Failed to initialize scheduler")?;

    match cli.command {
        Commands::Serve { no_driver } => {
            tracing::info!(no_driver = %no_driver, "Starting serve command");
            commands::serve(&app, no_driver).await?;
        }

        Commands::Tick { limit } => {
            tracing::info!(limit = ?limit, "Starting tick command");
            commands::tick(&app, limit).await?;
        }

        Commands::Finalize => {
            tracing::info!("Starting finalize command");
            commands::finalize(&app).await?;
        }

        Commands::Campaign { action } => match action {
            CampaignAction::Add { file } => commands::add_campaign(&app, &file).await?,
            CampaignAction::Show { id } => commands::show_campaign(&app, id).await?,
            CampaignAction::List => commands::list_campaigns(&app).await?,
        },

        Commands::Credentials { action } => match action {
            CredentialsAction::Set {
                owner,
                refresh_token,
            } => commands::set_refresh_token(&app, &owner, &refresh_token).await?,
        },
    }

    tracing::info!("thumbwheel completed successfully");
    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("thumbwheel=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("thumbwheel={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
    }

    Ok(())
}
