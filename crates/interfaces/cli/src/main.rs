mod daemon;

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pvtrack_config::AppConfig;
use pvtrack_portal::resolve;
use pvtrack_telegram::format::{format_achievement, format_report, format_run};

#[derive(Debug, Parser)]
#[command(
    name = "pvtrack",
    version,
    about = "Tracks left/right PV and rank achievement on the Atomy member portal"
)]
struct Cli {
    /// TOML configuration file; missing files fall back to defaults.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon in the foreground: log in, follow the schedule, answer clients.
    Run,
    /// Start the daemon in the background.
    Start,
    /// Ask the running daemon to shut down.
    Stop,
    /// Show daemon, session and schedule status.
    Status,
    /// Query PV for a date command, e.g. `0801`, `0801 0815` or `first-half`.
    Query {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Read the latest achievement from the allowance page.
    Achievement,
    /// Run one check-and-report cycle now.
    Check,
    /// Show which range a date command resolves to, without touching the portal.
    Resolve {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run => daemon::run_daemon_process(config).await?,
        Commands::Start => daemon::daemon_start(&config, &cli.config)?,
        Commands::Stop => daemon::daemon_stop(&config).await?,
        Commands::Status => daemon::daemon_status(&config).await?,
        Commands::Query { text } => {
            let client = daemon::require_daemon(&config)?;
            let report = client.query_pv(&text.join(" ")).await?;
            println!("{}", format_report(&report));
        }
        Commands::Achievement => {
            let client = daemon::require_daemon(&config)?;
            let record = client.query_achievement().await?;
            println!("{}", format_achievement(record.as_ref()));
        }
        Commands::Check => {
            let client = daemon::require_daemon(&config)?;
            let run = client.run_now().await?;
            println!("{}", format_run(&run));
            if let Err(message) = &run.outcome {
                bail!("check-and-report run failed: {message}");
            }
        }
        Commands::Resolve { text } => {
            let text = text.join(" ");
            let today = Utc::now().with_timezone(&config.schedule.tz()).date_naive();
            match resolve(&text, today) {
                Some(query) => {
                    println!("today: {today}");
                    println!("range: {}", query.range);
                    println!("kind: {:?}", query.kind);
                }
                None => bail!("{text:?} is not a date command\n\n{}", pvtrack_runtime::USAGE),
            }
        }
    }

    Ok(())
}
