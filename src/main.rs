use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use xsd_sim::address::{low_address, Address, Addressable};
use xsd_sim::balance::Balance;
use xsd_sim::chain::mock::MockChain;
use xsd_sim::chain::rpc::RpcChain;
use xsd_sim::chain::{ChainClient, ChainContext};
use xsd_sim::config::SimConfig;
use xsd_sim::dao::ProtocolDao;
use xsd_sim::error::SimError;
use xsd_sim::exchange::ExchangePool;
use xsd_sim::model::Model;
use xsd_sim::output::{RunLog, RunSummary};
use xsd_sim::store::{open_store, MemoryStore};
use xsd_sim::token_cache::TokenCache;

#[derive(Parser)]
#[command(name = "xsd-sim", about = "Multi-agent xSD stablecoin simulation against a test network")]
struct Cli {
    /// Debug-level logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulation until no agent can act or the step limit is hit
    Run {
        /// TOML configuration; defaults are used when absent
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum number of steps per worker
        #[arg(long, default_value = "1000")]
        steps: u64,

        /// Output directory for run logs and summaries
        #[arg(long, default_value = "output/run")]
        output_dir: String,

        /// Random seed; worker `n` uses seed + n
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Parallel workers, each driving its own slice of the accounts
        #[arg(long, default_value = "1")]
        workers: usize,

        /// Drive an in-process mock chain instead of the RPC endpoint
        #[arg(long)]
        mock: bool,

        /// Number of agents on the mock chain
        #[arg(long, default_value = "10")]
        mock_agents: u64,
    },

    /// Print the current pool and DAO state
    Status {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        mock: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<SimConfig, SimError> {
    match path {
        Some(p) => {
            info!("Loading configuration from {}", p.display());
            SimConfig::from_file(p)
        }
        None => Ok(SimConfig::default()),
    }
}

/// A fresh deployment with a 500k/500k pool and `agents` funded accounts.
fn mock_chain(config: &SimConfig, agents: u64) -> Result<(Arc<MockChain>, Vec<Address>), SimError> {
    let contracts = &config.contracts;
    let chain = MockChain::deploy(contracts);
    let accounts: Vec<Address> = (1..=agents).map(|n| low_address(0x1000 + n)).collect();
    chain.set_accounts(&accounts);

    let usd = Balance::from_whole(500_000, contracts.usdc.decimals)?;
    let xsd = Balance::from_whole(500_000, contracts.xsd.decimals)?;
    chain.seed_pool(low_address(0xfeed), usd.to_wei(), xsd.to_wei())?;
    for a in &accounts {
        let start = Balance::from_whole(1_000, contracts.xsd.decimals)?;
        chain.mint(contracts.xsd.address, *a, start.to_wei())?;
    }
    Ok((Arc::new(chain), accounts))
}

fn connect(config: &mut SimConfig, mock: bool, mock_agents: u64) -> Result<(Arc<dyn ChainClient>, Vec<Address>), SimError> {
    if mock {
        let (chain, accounts) = mock_chain(config, mock_agents)?;
        config.agents.mint_on_start = true;
        let client: Arc<dyn ChainClient> = chain;
        return Ok((client, accounts));
    }
    let client: Arc<dyn ChainClient> = Arc::new(RpcChain::new(&config.chain.rpc_url)?);
    let accounts = client.accounts()?;
    Ok((client, accounts))
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    worker: usize,
    ctx: Arc<ChainContext>,
    config: &SimConfig,
    accounts: &[Address],
    steps: u64,
    seed: u64,
    output_dir: &Path,
    progress: &ProgressBar,
) -> Result<RunSummary, SimError> {
    let started_at = chrono::Utc::now().to_rfc3339();
    let mut model = Model::new(ctx, config, accounts, seed)?;
    let mut log = RunLog::create(&output_dir.join(format!("run_{}.tsv", worker)))?;

    let mut last = None;
    let taken = model.run(steps, |report| {
        log.record(report)?;
        progress.inc(1);
        last = Some((report.block, report.epoch, report.price));
        Ok(())
    })?;

    let summary = RunSummary {
        worker,
        seed,
        started_at,
        finished_at: chrono::Utc::now().to_rfc3339(),
        steps: taken,
        logged_rows: log.rows(),
        final_block: last.map(|l| l.0),
        final_epoch: last.map(|l| l.1),
        final_price: last.map(|l| l.2),
    };
    summary.save_json(&output_dir.join(format!("summary_{}.json", worker)))?;
    Ok(summary)
}

fn run(
    config_path: Option<&Path>,
    steps: u64,
    output_dir: &str,
    seed: u64,
    workers: usize,
    mock: bool,
    mock_agents: u64,
) -> Result<(), SimError> {
    let mut config = load_config(config_path)?;
    let (client, accounts) = connect(&mut config, mock, mock_agents)?;
    if accounts.is_empty() {
        return Err(SimError::Config("the node exposes no accounts".to_string()));
    }
    let store = open_store(config.store.path.as_deref())?;
    let ctx = Arc::new(ChainContext::new(
        client,
        store,
        config.chain.clone(),
        &config.store,
    ));

    let output_dir = PathBuf::from(output_dir);
    std::fs::create_dir_all(&output_dir)?;
    config.save(&output_dir.join("config.toml"))?;

    let workers = workers.clamp(1, accounts.len());
    let slices: Vec<Vec<Address>> = (0..workers)
        .map(|w| accounts.iter().skip(w).step_by(workers).copied().collect())
        .collect();

    println!(
        "Running {} agents in {} worker(s) for up to {} steps",
        accounts.len(),
        workers,
        steps
    );

    let progress = ProgressBar::new(steps * workers as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} steps [{elapsed_precise}]") {
        progress.set_style(style);
    }

    let results: Vec<Result<RunSummary, SimError>> = slices
        .par_iter()
        .enumerate()
        .map(|(w, slice)| {
            run_worker(
                w,
                ctx.clone(),
                &config,
                slice,
                steps,
                seed + w as u64,
                &output_dir,
                &progress,
            )
        })
        .collect();
    progress.finish();

    for result in results {
        let summary = result?;
        println!(
            "  worker {}: {} steps, {} rows, final price {}",
            summary.worker,
            summary.steps,
            summary.logged_rows,
            summary
                .final_price
                .map(|p| format!("{:.4}", p))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("Output: {}", output_dir.display());
    Ok(())
}

fn status(config_path: Option<&Path>, mock: bool) -> Result<(), SimError> {
    let mut config = load_config(config_path)?;
    let (client, _) = connect(&mut config, mock, 0)?;
    let ctx = Arc::new(ChainContext::new(
        client,
        Arc::new(MemoryStore::new()),
        config.chain.clone(),
        &config.store,
    ));
    let contracts = &config.contracts;
    let usd = Arc::new(TokenCache::new(ctx.clone(), contracts.usdc.clone())?);
    let xsd = Arc::new(TokenCache::new(ctx.clone(), contracts.xsd.clone())?);
    let lp = Arc::new(TokenCache::new(ctx.clone(), contracts.pair.clone())?);
    let pool = ExchangePool::new(ctx.clone(), contracts, &config.market, usd, xsd.clone(), lp);
    let dao = ProtocolDao::new(ctx.clone(), contracts.dao, xsd.clone());

    let reserves = pool.reserves()?;
    let snapshot = dao.snapshot()?;
    println!("block       {}", ctx.client().block_number()?);
    println!("epoch       {}", snapshot.epoch);
    println!("price       {:.6}", reserves.price()?);
    println!("pool        {} USDC / {} xSD", reserves.usd, reserves.xsd);
    println!("supply      {}", xsd.total_supply()?);
    println!("coupons     {}", snapshot.total_coupons);
    println!("redeemable  {}", snapshot.total_redeemable);
    println!("dao         {}", dao.address());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Cannot install logger: {}", e);
    }

    let result = match cli.command {
        Commands::Run {
            config,
            steps,
            output_dir,
            seed,
            workers,
            mock,
            mock_agents,
        } => run(
            config.as_deref(),
            steps,
            &output_dir,
            seed,
            workers,
            mock,
            mock_agents,
        ),
        Commands::Status { config, mock } => status(config.as_deref(), mock),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
