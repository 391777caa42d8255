use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use pricing_experiments::bucketing::ThreadRandom;
use pricing_experiments::cli::{run_simulation, Args, Command, SimulationReport};
use pricing_experiments::config::AppConfig;
use pricing_experiments::engine::ExperimentEngine;
use pricing_experiments::results::format_price;
use pricing_experiments::store::{ExperimentStore, MemoryStore, SqliteStore};
use pricing_experiments::web;

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_simulation(report: &SimulationReport) {
    let r = &report.results;
    println!("{}", "PRICING EXPERIMENT SIMULATION".bright_cyan().bold());
    println!("{}: {}", "Experiment".bright_yellow(), r.name);
    println!(
        "{}: {} visitors, {} assigned, {} excluded by traffic allocation",
        "Traffic".bright_yellow(),
        report.visitors,
        report.assigned,
        report.excluded
    );
    println!(
        "{}: {} conversions, {} churned",
        "Outcomes".bright_yellow(),
        report.converted,
        report.churned
    );
    println!("{}", "=".repeat(60).bright_blue());

    for v in &r.variants {
        let label = if v.is_control {
            "control".normal()
        } else {
            "treatment".bright_magenta()
        };
        println!(
            "#{} {:<10} {:>8} [{}]  visitors {:>4}  conv {:>5.2}%  rev/visitor {:>8}",
            v.rank,
            v.name.bright_white(),
            format_price(v.price_cents),
            label,
            v.visitors,
            v.conversion_rate * 100.0,
            format_price(v.revenue_per_visitor.round() as u64),
        );
        if let (Some(p), Some(lift)) = (v.p_value, v.relative_lift_pct) {
            println!("   lift {lift:+.1}%  p = {p:.4}");
        }
    }

    println!("{}", "=".repeat(60).bright_blue());
    match &r.winner {
        Some(w) => println!(
            "{}: {} at {}",
            "Winner".bright_green().bold(),
            w.name,
            format_price(w.price_cents)
        ),
        None => println!("{}: none yet", "Winner".bright_red()),
    }
    println!(
        "{}: {:.1}%",
        "Power".bright_yellow(),
        r.statistical_power * 100.0
    );
    println!("{}: {}", "Recommendation".bright_yellow(), r.recommendation);
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Command::Serve(serve) => {
            let mut config = AppConfig::load(serve.config.as_deref())?;
            serve.apply(&mut config);
            config.validate()?;
            init_tracing(&config.log_filter);

            let store: Arc<dyn ExperimentStore> = match &config.server.database {
                Some(path) => {
                    tracing::info!(database = %path.display(), "using SQLite store");
                    Arc::new(SqliteStore::open(path)?)
                }
                None => {
                    tracing::warn!("no database configured; experiments live in memory only");
                    Arc::new(MemoryStore::new())
                }
            };
            let engine = Arc::new(ExperimentEngine::new(
                store,
                Arc::new(ThreadRandom),
                config.engine.clone(),
            ));

            let addr = format!("{}:{}", config.server.bind, config.server.port);
            eprintln!(
                "{}",
                format!("  Pricing experiment API at http://{addr}").bright_green()
            );
            eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
            web::serve(engine, &addr).await?;
        }
        Command::Simulate(sim) => {
            init_tracing("warn");
            let report = run_simulation(&sim, Default::default())?;
            print_simulation(&report);
            println!("{}", serde_json::to_string_pretty(&report.results)?);
        }
    }

    Ok(())
}
