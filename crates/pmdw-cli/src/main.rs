use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pmdw_core::ProjectScope;
use pmdw_etl::diagnostics::{connect_source, connect_warehouse, ping, source_row_counts};
use pmdw_etl::{model, EtlConfig};
use pmdw_storage::Warehouse;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pmdw")]
#[command(about = "Project-management data warehouse loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load dimensions and rebuild facts (the default)
    Run {
        /// Restrict the run to these project ids
        #[arg(long = "project", value_name = "ID")]
        projects: Vec<i64>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply warehouse migrations
    Migrate,
    /// Print row counts of the source relations
    Counts,
    /// Check both connections
    Ping,
    /// Fit the defect model over current facts
    Train,
    /// Forecast defects for a project of the given size
    Predict {
        #[arg(long)]
        hours: f64,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Run {
        projects: Vec::new(),
        json: false,
    });
    match command {
        Commands::Run { projects, json } => run(projects, json).await,
        Commands::Migrate => migrate().await,
        Commands::Counts => counts().await,
        Commands::Ping => {
            let report = ping(&EtlConfig::from_env()?).await?;
            println!(
                "ok: source={} warehouse={}",
                report.source_database, report.warehouse_database
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Train => train().await,
        Commands::Predict { hours, json } => predict(hours, json).await,
    }
}

async fn run(projects: Vec<i64>, json: bool) -> Result<ExitCode> {
    let scope = if projects.is_empty() {
        ProjectScope::All
    } else {
        ProjectScope::only(projects)
    };

    match pmdw_etl::run_once_from_env(scope).await {
        Ok(summary) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "run complete: run_id={} projects={} facts_deleted={} facts_inserted={} dates_added={} fingerprint={}",
                    summary.run_id.to_rfc3339(),
                    summary.projects_loaded,
                    summary.facts.deleted,
                    summary.facts.inserted,
                    summary.dates_inserted,
                    summary.fingerprint
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            eprintln!("{failure}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn migrate() -> Result<ExitCode> {
    let config = EtlConfig::from_env()?;
    let warehouse = connect_warehouse(&config).await?;
    let applied = warehouse.ensure_schema().await;
    warehouse.close().await;
    applied.context("applying warehouse migrations")?;
    println!("warehouse schema is up to date");
    Ok(ExitCode::SUCCESS)
}

async fn counts() -> Result<ExitCode> {
    let config = EtlConfig::from_env()?;
    let source = connect_source(&config).await?;
    let counts = source_row_counts(&source).await;
    source.close().await;

    let mut failed = false;
    for count in counts {
        match count.rows {
            Ok(rows) => println!("{:<12} {rows}", count.relation.table_name()),
            Err(err) => {
                failed = true;
                println!("{:<12} error: {err}", count.relation.table_name());
            }
        }
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn train() -> Result<ExitCode> {
    let config = EtlConfig::from_env()?;
    let warehouse = connect_warehouse(&config).await?;
    let trained = model::train(&warehouse, &config.model, Utc::now()).await;
    warehouse.close().await;

    let param = trained?;
    println!(
        "trained {}.{} = {:.8} at {}",
        param.model_name,
        param.param_name,
        param.param_value,
        param.trained_at.to_rfc3339()
    );
    Ok(ExitCode::SUCCESS)
}

async fn predict(hours: f64, json: bool) -> Result<ExitCode> {
    if !hours.is_finite() || hours < 0.0 {
        bail!("--hours must be a non-negative number, got {hours}");
    }
    let config = EtlConfig::from_env()?;
    let warehouse = connect_warehouse(&config).await?;
    let estimate = model::current_sigma(&warehouse, &config.model).await;
    warehouse.close().await;

    let forecast = model::forecast(estimate.sigma, hours);
    if json {
        let body = serde_json::json!({
            "forecast": forecast,
            "trained_at": estimate.trained_at,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(ExitCode::SUCCESS);
    }

    let origin = match estimate.trained_at {
        Some(at) => format!("trained {}", at.to_rfc3339()),
        None => "default, no trained model".to_string(),
    };
    println!("sigma:            {:.8} ({origin})", forecast.sigma);
    println!("hours:            {:.2}", forecast.hours);
    println!("expected defects: {:.2}", forecast.expected_defects);
    println!(
        "p10 / p50 / p90:  {:.2} / {:.2} / {:.2}",
        forecast.p10, forecast.p50, forecast.p90
    );
    Ok(ExitCode::SUCCESS)
}
