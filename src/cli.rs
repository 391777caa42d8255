//! Command-line surface of the `pricing-experiments` binary.
//!
//! `serve` runs the HTTP API; `simulate` replays a two-price scenario
//! in-process against the memory store so the whole pipeline can be watched
//! end to end without a database or traffic.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::bucketing::{AssignmentDecision, SeededRandom};
use crate::config::{AppConfig, EngineConfig};
use crate::engine::ExperimentEngine;
use crate::error::Result;
use crate::model::{NewExperiment, NewVariant, TargetPlan, TransitionAction};
use crate::results::ExperimentResults;
use crate::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "pricing-experiments")]
#[command(version)]
#[command(about = "Server-side pricing experiments with significance testing")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP/JSON API
    Serve(ServeArgs),
    /// Run a seeded end-to-end experiment in memory and print the report
    Simulate(SimulateArgs),
}

#[derive(ClapArgs, Debug, Default)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to bind (overrides server.bind)
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides server.port)
    #[arg(long)]
    pub port: Option<u16>,

    /// SQLite database file (overrides server.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
}

impl ServeArgs {
    /// Layer command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(db) = &self.database {
            config.server.database = Some(db.clone());
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SimulateArgs {
    /// Visitors hitting the pricing page
    #[arg(long, default_value = "300")]
    pub visitors: usize,

    /// Conversions spread over the assigned visitors
    #[arg(long, default_value = "40")]
    pub conversions: usize,

    /// Converted customers who later churn
    #[arg(long, default_value = "4")]
    pub churns: usize,

    /// Traffic allocation in percent
    #[arg(long, default_value = "50")]
    pub traffic: f64,

    /// Seed for bucketing and conversion sampling
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self { visitors: 300, conversions: 40, churns: 4, traffic: 50.0, seed: 42 }
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub experiment_id: String,
    pub visitors: usize,
    pub assigned: usize,
    pub excluded: usize,
    pub converted: usize,
    pub churned: usize,
    pub results: ExperimentResults,
}

fn scenario(traffic_allocation: f64) -> NewExperiment {
    NewExperiment {
        org_id: "org_simulation".into(),
        name: "Pro plan $49 vs $59".into(),
        hypothesis: "A $59 Pro plan earns more per visitor without hurting conversion".into(),
        target_plan: TargetPlan {
            id: "plan_pro".into(),
            name: "Pro".into(),
            price_cents: Some(4900),
        },
        planned_duration_days: 14,
        traffic_allocation,
        confidence_level: None,
        minimum_sample_size: Some(100),
        minimum_detectable_effect: None,
        metadata: Default::default(),
        variants: vec![
            NewVariant { name: "control".into(), price_cents: 4900, is_control: true },
            NewVariant { name: "premium".into(), price_cents: 5900, is_control: false },
        ],
    }
}

/// Create, start and feed one experiment, then analyze it.
pub fn run_simulation(args: &SimulateArgs, config: EngineConfig) -> Result<SimulationReport> {
    let engine = ExperimentEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SeededRandom::new(args.seed)),
        config,
    );
    let experiment = engine.create_experiment(scenario(args.traffic))?;
    let id = experiment.id;
    engine.transition(&id, TransitionAction::Start)?;

    let mut assigned = Vec::new();
    for i in 0..args.visitors {
        let visitor = format!("visitor_{i:05}");
        if let AssignmentDecision::Assigned(v) = engine.assign_visitor(&id, &visitor)? {
            assigned.push((visitor, v.price_cents));
        }
    }

    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
    assigned.shuffle(&mut rng);

    let mut customers = Vec::new();
    for (i, (visitor, price)) in assigned.iter().take(args.conversions).enumerate() {
        let customer = format!("cus_{i:05}");
        let subscription = format!("sub_{i:05}");
        if engine.record_conversion(&id, visitor, &customer, &subscription, *price)?.is_some() {
            customers.push((customer, *price));
        }
    }

    let mut churned = 0;
    for (customer, price) in customers.iter().take(args.churns) {
        if engine.record_churn(&id, customer, price * 3)?.is_some() {
            churned += 1;
        }
    }

    Ok(SimulationReport {
        results: engine.get_results(&id)?,
        experiment_id: id,
        visitors: args.visitors,
        assigned: assigned.len(),
        excluded: args.visitors - assigned.len(),
        converted: customers.len(),
        churned,
    })
}
