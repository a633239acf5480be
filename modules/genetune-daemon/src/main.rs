//! genetune: tune generation configs offline and manage the live bandit.
//!
//! Runs against the simulated backend; bandit state lives in a JSON file.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use genetune_bandit::{BanditStore, ThompsonBandit};
use genetune_common::{load_config, AppConfig, FileConfig};
use genetune_daemon::{
    DatasetSource, GenetuneService, ImprovementReport, JsonDataset, OfflineCorrectness,
    RewardModel, RunStatus,
};
use genetune_evolve::{Executor, RunControl};
use simbackend::{SimWorld, SimulatedExecutor};

#[derive(Parser)]
#[command(name = "genetune")]
#[command(about = "Evolutionary tuning of LLM generation configs")]
#[command(version)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one offline evolution and print the best genomes
    Evolve {
        /// Override evolution.max_generations
        #[arg(long)]
        generations: Option<u32>,

        /// Seed the population with the deployed incumbents
        #[arg(long)]
        from_bandit: bool,
    },

    /// Run the nightly improvement job and promote winners into the bandit
    Nightly {
        /// Gate candidates on offline correctness as the reward prediction
        #[arg(long)]
        offline_reward: bool,

        /// Do not persist the bandit after the run
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the posterior of every deployed arm
    Stats,

    /// Remove arms whose posterior mean fell below a floor
    Prune {
        /// Only arms with at least this many rewards are considered
        #[arg(long, default_value_t = 100)]
        min_pulls: u64,

        #[arg(long)]
        floor: f64,
    },

    /// Sample the bandit and print the chosen genome ids
    Choose {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Record one production reward
    Reward { genome_id: String, reward: f64 },
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("genetune=info".parse()?))
        .init();

    let cli = Cli::parse();
    let ctx = AppContext::load()?;

    match cli.command {
        Commands::Evolve {
            generations,
            from_bandit,
        } => cmd_evolve(ctx, generations, from_bandit, cli.json).await,
        Commands::Nightly {
            offline_reward,
            dry_run,
        } => cmd_nightly(ctx, offline_reward, dry_run, cli.json).await,
        Commands::Stats => cmd_stats(&ctx, cli.json),
        Commands::Prune { min_pulls, floor } => cmd_prune(&ctx, min_pulls, floor),
        Commands::Choose { count } => cmd_choose(&ctx, count),
        Commands::Reward { genome_id, reward } => cmd_reward(&ctx, &genome_id, reward),
    }
}

struct AppContext {
    app: AppConfig,
    config: FileConfig,
    store: BanditStore,
}

impl AppContext {
    fn load() -> Result<Self> {
        let app = AppConfig::from_env()?;
        let mut config = if app.config_path.exists() {
            load_config(&app.config_path)?
        } else {
            info!(path = %app.config_path.display(), "No config file, using defaults");
            FileConfig::default()
        };
        if let Some(seed) = app.seed {
            config.evolution.seed = Some(seed);
            config.bandit.seed = Some(seed);
        }
        let store = BanditStore::new(&app.bandit_state_path);
        Ok(Self { app, config, store })
    }

    fn bandit(&self) -> Result<Arc<ThompsonBandit>> {
        Ok(Arc::new(self.store.open(&self.config.bandit)?))
    }

    fn save(&self, bandit: &ThompsonBandit) -> Result<()> {
        self.store
            .save(&bandit.snapshot())
            .context("Failed to save bandit state")?;
        info!(path = %self.store.path().display(), arms = bandit.len(), "Bandit state saved");
        Ok(())
    }

    fn executor(&self) -> Result<Arc<dyn Executor>> {
        let world = if self.app.sim_world_path.exists() {
            SimWorld::load(&self.app.sim_world_path)?
        } else {
            info!(path = %self.app.sim_world_path.display(), "No sim world file, using the built-in world");
            SimWorld::default()
        };
        info!(world = world.name.as_str(), models = world.models.len(), "Simulated backend ready");
        Ok(Arc::new(
            SimulatedExecutor::new(world).with_salt(self.app.seed.unwrap_or_default()),
        ))
    }

    fn service(&self, reward_model: Option<Arc<dyn RewardModel>>) -> Result<GenetuneService> {
        let dataset: Arc<dyn DatasetSource> = Arc::new(JsonDataset::new(&self.app.dataset_path));
        Ok(GenetuneService::new(
            self.config.clone(),
            self.bandit()?,
            self.executor()?,
            dataset,
            reward_model,
        ))
    }
}

async fn cmd_evolve(
    mut ctx: AppContext,
    generations: Option<u32>,
    from_bandit: bool,
    json: bool,
) -> Result<()> {
    if let Some(generations) = generations {
        ctx.config.evolution.max_generations = generations;
    }
    let service = ctx.service(None)?;
    let dataset = JsonDataset::new(&ctx.app.dataset_path).load().await?;
    let seeds = if from_bandit {
        service.bandit().incumbents(ctx.config.daemon.incumbent_seeds)
    } else {
        Vec::new()
    };

    let control = RunControl::new().with_time_budget(ctx.config.daemon.time_budget());
    cancel_on_ctrl_c(control.cancel_token());
    let outcome = service.run_evolution(&dataset, seeds, &control).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.top_k)?);
        return Ok(());
    }
    println!(
        "Evolution {} after {} generations",
        outcome.termination, outcome.generations_run
    );
    for stats in &outcome.history {
        println!(
            "  gen {:>3}  best {:>8.4}  mean {:>8.4}  evaluated {}",
            stats.generation, stats.best_fitness, stats.mean_fitness, stats.evaluated
        );
    }
    for (rank, genome) in outcome.top_k.iter().enumerate() {
        let p = genome.params();
        println!(
            "#{} {} fitness={:.4} model={} variant={} temperature={:.2} top_p={:.2} cot={} max_tokens={}",
            rank + 1,
            genome.id,
            genome.fitness_total().unwrap_or_default(),
            p.model_key,
            p.prompt_variant_id,
            p.temperature,
            p.top_p,
            p.use_chain_of_thought,
            p.max_tokens,
        );
    }
    Ok(())
}

async fn cmd_nightly(ctx: AppContext, offline_reward: bool, dry_run: bool, json: bool) -> Result<()> {
    let reward_model: Option<Arc<dyn RewardModel>> = if offline_reward {
        Some(Arc::new(OfflineCorrectness))
    } else {
        None
    };
    let service = ctx.service(reward_model)?;
    cancel_on_ctrl_c(service.daemon().cancel_token());

    let report = service.run_nightly_improvement().await;
    if report.is_completed() && !report.promoted.is_empty() {
        if dry_run {
            warn!(promoted = report.promoted.len(), "Dry run, bandit state not saved");
        } else {
            ctx.save(service.bandit())?;
        }
    }

    print_report(&report, json)?;
    if let RunStatus::Aborted { stage, reason } = &report.status {
        bail!("improvement run aborted during {stage}: {reason}");
    }
    Ok(())
}

fn print_report(report: &ImprovementReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{report}");
    for promoted in &report.promoted {
        println!("  promoted {} fitness={:.4}", promoted.genome.id, promoted.fitness);
        for change in &promoted.changes {
            println!("    {}: {} -> {}", change.field, change.from, change.to);
        }
    }
    for rejection in &report.rejected {
        println!("  rejected {}: {}", rejection.genome_id, rejection.reason);
    }
    Ok(())
}

fn cmd_stats(ctx: &AppContext, json: bool) -> Result<()> {
    let stats = ctx.bandit()?.stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    if stats.is_empty() {
        println!("No arms deployed");
        return Ok(());
    }
    println!("{:<38} {:>8} {:>8} {:>9} {:>9}", "genome", "pulls", "mean", "alpha", "beta");
    for arm in stats {
        println!(
            "{:<38} {:>8} {:>8.4} {:>9.2} {:>9.2}",
            arm.genome_id, arm.pulls, arm.mean_reward, arm.alpha, arm.beta
        );
    }
    Ok(())
}

fn cmd_prune(ctx: &AppContext, min_pulls: u64, floor: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&floor) {
        bail!("floor must be in [0, 1], got {floor}");
    }
    let bandit = ctx.bandit()?;
    let removed = bandit.prune(min_pulls, floor);
    if removed.is_empty() {
        println!("Nothing to prune");
        return Ok(());
    }
    ctx.save(&bandit)?;
    for id in removed {
        println!("Removed {id}");
    }
    Ok(())
}

fn cmd_choose(ctx: &AppContext, count: usize) -> Result<()> {
    let bandit = ctx.bandit()?;
    for _ in 0..count {
        println!("{}", bandit.choose());
    }
    Ok(())
}

fn cmd_reward(ctx: &AppContext, genome_id: &str, reward: f64) -> Result<()> {
    let bandit = ctx.bandit()?;
    let stats = bandit.update(genome_id, reward)?;
    ctx.save(&bandit)?;
    println!(
        "{} pulls={} mean={:.4}",
        stats.genome_id, stats.pulls, stats.mean_reward
    );
    Ok(())
}

fn cancel_on_ctrl_c(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping at the next generation boundary");
            token.cancel();
        }
    });
}
