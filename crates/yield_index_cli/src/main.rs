//! yield-index CLI: pools, deposits, accrual runs, receipts.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{error, info};
use yield_index::ledger::{
    activate_pending, create_pool, deposit, holder_balance, set_pool_active, set_strategy,
    withdraw,
};
use yield_index::orchestrator::parse_instant;
use yield_index::verify::{verify_receipt_file, write_receipt};
use yield_index::{
    client_growth_index, AccrualOrchestrator, EngineConfig, HolderId, HttpYieldSource, Ledger,
    PoolId, PoolKey, PoolSpec, RunReceipt, RunResult, SqliteLedger, StaticYieldSource,
    StrategyAllocation, Wad, YieldSource,
};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    match cli.command {
        Command::Init => run_init(&config),
        Command::Pool(cmd) => run_pool(&config, cmd),
        Command::Deposit(args) => run_deposit(&config, args),
        Command::Activate(args) => run_activate(&config, args),
        Command::Withdraw(args) => run_withdraw(&config, args),
        Command::Balance(args) => run_balance(&config, args),
        Command::ClientIndex(args) => run_client_index(&config, args),
        Command::Accrue(args) => run_accrue(&config, args),
        Command::Schedule(args) => run_schedule(&config, args),
        Command::History(args) => run_history(&config, args),
        Command::Verify(args) => run_verify(args),
    }
}

#[derive(Parser)]
#[command(name = "yield-index")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Growth-index accounting for pooled yield vaults")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Config file. Defaults to $YIELD_INDEX_CONFIG_PATH, ./config/yield_index.json, ./yield_index.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `database_path` from the config.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database if it does not exist.
    Init,
    /// Create, inspect and configure pools.
    #[command(subcommand)]
    Pool(PoolCommand),
    /// Record a deposit into a pool's pending balance.
    Deposit(MoveArgs),
    /// Move pending deposits into the accruing balance.
    Activate(ActivateArgs),
    /// Withdraw value from a holder's position.
    Withdraw(MoveArgs),
    /// Show a holder's position at the current index.
    Balance(HolderArgs),
    /// AUM-weighted index across a client's pools.
    ClientIndex(ClientArgs),
    /// Run one accrual pass over all active pools.
    Accrue(AccrueArgs),
    /// Run an accrual pass every period until interrupted.
    Schedule(ScheduleArgs),
    /// List a pool's accrual records, newest first.
    History(HistoryArgs),
    /// Verify a run receipt against its .sha256 file.
    Verify(VerifyArgs),
}

#[derive(Subcommand)]
enum PoolCommand {
    Create(CreateArgs),
    Show(PoolArgs),
    List(ListArgs),
    Deactivate(DeactivateArgs),
    Strategy(StrategyArgs),
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    chain: String,
    #[arg(long)]
    token: String,
    /// PROTOCOL=PERCENT, repeatable.
    #[arg(long = "alloc", value_parser = parse_allocation)]
    allocations: Vec<StrategyAllocation>,
}

#[derive(Args)]
struct PoolArgs {
    #[arg(long)]
    pool: String,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    client: Option<String>,
}

#[derive(Args)]
struct DeactivateArgs {
    #[arg(long)]
    pool: String,
    /// Reactivate instead.
    #[arg(long)]
    undo: bool,
}

#[derive(Args)]
struct StrategyArgs {
    #[arg(long)]
    pool: String,
    #[arg(long = "alloc", value_parser = parse_allocation)]
    allocations: Vec<StrategyAllocation>,
}

#[derive(Args)]
struct MoveArgs {
    #[arg(long)]
    pool: String,
    #[arg(long)]
    holder: String,
    #[arg(long)]
    amount: Wad,
}

#[derive(Args)]
struct ActivateArgs {
    #[arg(long)]
    pool: String,
    /// Defaults to the whole pending balance.
    #[arg(long)]
    amount: Option<Wad>,
}

#[derive(Args)]
struct HolderArgs {
    #[arg(long)]
    pool: String,
    #[arg(long)]
    holder: String,
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long)]
    client: String,
}

#[derive(Args)]
struct AccrueArgs {
    /// Read quotes from a JSON file instead of the HTTP feed.
    #[arg(long)]
    quotes: Option<PathBuf>,
    /// Run as of this instant (RFC3339 or unix seconds).
    #[arg(long)]
    at: Option<String>,
    /// Skip writing the run receipt.
    #[arg(long)]
    no_receipt: bool,
}

#[derive(Args)]
struct ScheduleArgs {
    #[arg(long)]
    quotes: Option<PathBuf>,
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long)]
    pool: String,
    #[arg(long, default_value_t = 30)]
    limit: usize,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(long)]
    receipt: PathBuf,
}

fn parse_allocation(s: &str) -> Result<StrategyAllocation, String> {
    let (protocol, percent) = s
        .split_once('=')
        .ok_or_else(|| format!("expected PROTOCOL=PERCENT, got {s}"))?;
    let percent: Wad = percent.parse().map_err(|e| format!("{percent}: {e}"))?;
    Ok(StrategyAllocation::new(protocol.trim(), percent))
}

fn load_config(global: &GlobalArgs) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &global.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(db) = &global.db {
        config.database_path = db.clone();
    }
    Ok(config)
}

fn open_ledger(config: &EngineConfig) -> Result<SqliteLedger, Box<dyn std::error::Error>> {
    Ok(SqliteLedger::open(&config.database_path)?)
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_init(config: &EngineConfig) -> CliResult {
    let ledger = open_ledger(config)?;
    let pools = ledger.list_pools()?;
    info!(path = %config.database_path.display(), pools = pools.len(), "database ready");
    Ok(())
}

fn run_pool(config: &EngineConfig, cmd: PoolCommand) -> CliResult {
    let ledger = open_ledger(config)?;
    match cmd {
        PoolCommand::Create(args) => {
            let spec = PoolSpec {
                key: PoolKey::new(args.client, args.chain, args.token),
                strategy_allocations: args.allocations,
            };
            let pool = create_pool(&ledger, spec, OffsetDateTime::now_utc())?;
            print_json(&pool)
        }
        PoolCommand::Show(args) => {
            let id = PoolId(args.pool);
            let pool = ledger
                .get_pool(&id)?
                .ok_or_else(|| format!("pool {id} not found"))?;
            print_json(&pool)
        }
        PoolCommand::List(args) => {
            let pools: Vec<_> = ledger
                .list_pools()?
                .into_iter()
                .filter(|p| match &args.client {
                    Some(c) => &p.key.client_id == c,
                    None => true,
                })
                .collect();
            print_json(&pools)
        }
        PoolCommand::Deactivate(args) => {
            set_pool_active(&ledger, &PoolId(args.pool), args.undo)?;
            Ok(())
        }
        PoolCommand::Strategy(args) => {
            set_strategy(&ledger, &PoolId(args.pool), &args.allocations)?;
            Ok(())
        }
    }
}

fn run_deposit(config: &EngineConfig, args: MoveArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    let receipt = deposit(
        &ledger,
        &PoolId(args.pool),
        &HolderId(args.holder),
        args.amount,
        OffsetDateTime::now_utc(),
    )?;
    print_json(&receipt)
}

fn run_activate(config: &EngineConfig, args: ActivateArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    let moved = activate_pending(&ledger, &PoolId(args.pool), args.amount)?;
    println!("{moved}");
    Ok(())
}

fn run_withdraw(config: &EngineConfig, args: MoveArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    let receipt = withdraw(
        &ledger,
        &PoolId(args.pool),
        &HolderId(args.holder),
        args.amount,
        OffsetDateTime::now_utc(),
    )?;
    print_json(&receipt)
}

fn run_balance(config: &EngineConfig, args: HolderArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    let balance = holder_balance(&ledger, &PoolId(args.pool), &HolderId(args.holder))?;
    print_json(&balance)
}

fn run_client_index(config: &EngineConfig, args: ClientArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    println!("{}", client_growth_index(&ledger, &args.client)?);
    Ok(())
}

fn seal(result: &RunResult, receipts_dir: &Path) -> CliResult {
    let receipt = RunReceipt::seal(result, OffsetDateTime::now_utc())?;
    let written = write_receipt(&receipt, receipts_dir)?;
    info!(
        path = %written.receipt_path.display(),
        hash = %written.hash,
        "receipt written"
    );
    Ok(())
}

async fn accrue_once<Y: YieldSource>(
    source: Y,
    ledger: SqliteLedger,
    config: &EngineConfig,
    at: Option<OffsetDateTime>,
) -> Result<RunResult, Box<dyn std::error::Error>> {
    let orch = AccrualOrchestrator::new(source, ledger, config.orchestrator()?);
    let result = match at {
        Some(now) => orch.run_at(now).await?,
        None => orch.run().await?,
    };
    Ok(result)
}

fn run_accrue(config: &EngineConfig, args: AccrueArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    let at = args.at.as_deref().map(parse_instant).transpose()?;
    let rt = tokio::runtime::Runtime::new()?;
    let result = match &args.quotes {
        Some(path) => rt.block_on(accrue_once(
            StaticYieldSource::from_json_file(path)?,
            ledger,
            config,
            at,
        ))?,
        None => rt.block_on(accrue_once(
            HttpYieldSource::new(config.oracle.clone())?,
            ledger,
            config,
            at,
        ))?,
    };
    if !args.no_receipt {
        seal(&result, &config.receipts_dir)?;
    }
    print_json(&result)?;
    if !result.failed.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

async fn schedule<Y: YieldSource>(
    source: Y,
    ledger: SqliteLedger,
    config: &EngineConfig,
) -> CliResult {
    let orch = AccrualOrchestrator::new(source, ledger, config.orchestrator()?);
    info!(
        period_secs = config.period_secs,
        "scheduler started, ctrl-c to stop"
    );
    orch.run_every_period(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler unavailable, scheduler runs until killed");
            std::future::pending::<()>().await;
        }
    })
    .await;
    Ok(())
}

fn run_schedule(config: &EngineConfig, args: ScheduleArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    let rt = tokio::runtime::Runtime::new()?;
    match &args.quotes {
        Some(path) => rt.block_on(schedule(
            StaticYieldSource::from_json_file(path)?,
            ledger,
            config,
        )),
        None => rt.block_on(schedule(
            HttpYieldSource::new(config.oracle.clone())?,
            ledger,
            config,
        )),
    }
}

fn run_history(config: &EngineConfig, args: HistoryArgs) -> CliResult {
    let ledger = open_ledger(config)?;
    let records = ledger.list_accrual_records(&PoolId(args.pool), args.limit)?;
    print_json(&records)
}

fn run_verify(args: VerifyArgs) -> CliResult {
    let result = verify_receipt_file(&args.receipt)?;
    if result.matches {
        println!("OK\t{}", result.receipt_hash);
    } else {
        eprintln!(
            "MISMATCH\tcomputed={}\texpected={}",
            result.receipt_hash, result.expected_hash
        );
        std::process::exit(1);
    }
    Ok(())
}
