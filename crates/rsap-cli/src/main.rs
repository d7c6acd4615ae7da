use anyhow::Result;
use clap::{Parser, Subcommand};
use rsap_pipeline::window_predicate;

#[derive(Debug, Parser)]
#[command(name = "rsap-cli")]
#[command(about = "RSAP command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web service (and the daily scheduler when enabled).
    Serve,
    /// Run one ingestion pass with an explicit predicate or threshold pair.
    Run {
        #[arg(long)]
        predicate: Option<String>,
        #[arg(long)]
        impact_force_min: Option<f64>,
        #[arg(long)]
        z_axis_vibration_min: Option<f64>,
    },
    /// Run one ingestion pass over a detected-at window.
    RunWindow {
        /// Inclusive lower bound, e.g. "2025-08-27 00:00:00".
        #[arg(long)]
        start: String,
        /// Exclusive upper bound.
        #[arg(long)]
        end: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => rsap_web::serve_from_env().await?,
        Commands::Run {
            predicate,
            impact_force_min,
            z_axis_vibration_min,
        } => {
            let predicate = match (predicate, impact_force_min, z_axis_vibration_min) {
                (Some(p), _, _) => p,
                (None, Some(impact), Some(vibration)) => {
                    format!("impactForce >= {impact} AND zAxisVibration >= {vibration}")
                }
                _ => anyhow::bail!(
                    "pass --predicate, or both --impact-force-min and --z-axis-vibration-min"
                ),
            };
            let summary = rsap_pipeline::run_pipeline_once_from_env(&predicate).await?;
            println!("{}", summary.message);
        }
        Commands::RunWindow { start, end } => {
            let summary =
                rsap_pipeline::run_pipeline_once_from_env(&window_predicate(&start, &end)).await?;
            println!("{}", summary.message);
        }
    }

    Ok(())
}
