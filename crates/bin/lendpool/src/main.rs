use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{address, Address};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lendpool_client::{
    Action, BackendMode, ClientConfig, Dashboard, LendingSession, RemoteLedger, RpcLedger,
    SimulatedChain, TracingSink,
};
use lendpool_core::{format_units, parse_units, RiskEngine};
use tracing::{info, warn};

/// account used when simulating and none is given
const DEV_ACCOUNT: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

#[derive(Parser, Debug)]
#[command(name = "lendpool")]
#[command(about = "collateralized lending pool client", long_about = None)]
struct Args {
    /// toml config file
    #[arg(long, env = "LENDPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// run against an in-process simulated pool
    #[arg(long)]
    simulate: bool,

    /// lending gateway json-rpc endpoint
    #[arg(long, env = "LENDPOOL_GATEWAY")]
    gateway: Option<String>,

    /// pool contract address
    #[arg(long)]
    pool: Option<Address>,

    /// account to act as
    #[arg(long, env = "LENDPOOL_ACCOUNT")]
    account: Option<Address>,

    /// wallet balance minted to the account when simulating
    #[arg(long, default_value = "1000")]
    sim_balance: String,

    /// simulated block time in milliseconds
    #[arg(long, default_value_t = 2000)]
    sim_block_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// print pool and position
    Status,
    /// print the dashboard on every poll until ctrl-c
    Watch,
    Supply { amount: String },
    Withdraw { amount: String },
    Borrow { amount: String },
    Repay { amount: String },
    /// approve the pool to pull `amount`
    Approve { amount: String },
    /// run several steps in one session, e.g. `supply=400 borrow=300`
    Exec { steps: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lendpool=info,lendpool_client=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let account = match (args.account, config.mode) {
        (Some(account), _) => account,
        (None, BackendMode::Simulated) => DEV_ACCOUNT,
        (None, BackendMode::Rpc) => bail!("--account or LENDPOOL_ACCOUNT is required"),
    };

    info!("starting lendpool");
    info!("network: {} ({})", config.pool.network, config.pool.chain_id);
    info!("pool: {}", config.pool.pool_address);
    info!("account: {}", account);

    let remote = build_remote(&config, account, &args)?;
    let session = LendingSession::connect(config, remote, account, Arc::new(TracingSink))
        .await
        .context("failed to start session")?;

    let result = run(&session, args.command).await;
    session.shutdown().await;
    result
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if args.simulate {
        config.mode = BackendMode::Simulated;
    }
    if let Some(gateway) = &args.gateway {
        config.pool.gateway_url = gateway.clone();
    }
    if let Some(pool) = args.pool {
        config.pool.pool_address = pool;
    }
    config.validate().context("invalid config")?;
    Ok(config)
}

fn build_remote(config: &ClientConfig, account: Address, args: &Args) -> Result<Arc<dyn RemoteLedger>> {
    match config.mode {
        BackendMode::Rpc => {
            info!("gateway: {}", config.pool.gateway_url);
            let ledger = RpcLedger::new(
                &config.pool.gateway_url,
                config.pool.pool_address,
                account,
                config.request_timeout(),
            )?;
            Ok(Arc::new(ledger))
        }
        BackendMode::Simulated => {
            let balance = parse_units(&args.sim_balance, config.pool.decimals)
                .context("invalid --sim-balance")?;
            let chain = Arc::new(
                SimulatedChain::new(RiskEngine::new(config.params.clone()), config.pool.pool_address)
                    .with_block_time(Duration::from_millis(args.sim_block_ms)),
            );
            chain.mint(account, balance);
            info!(
                "simulating with {} {} and {}ms blocks",
                args.sim_balance, config.pool.symbol, args.sim_block_ms
            );
            Ok(Arc::new(chain.ledger(account)))
        }
    }
}

async fn run(session: &LendingSession, command: Command) -> Result<()> {
    match command {
        Command::Status => print_dashboard(session),
        Command::Watch => watch(session).await,
        Command::Supply { amount } => step(session, Action::Supply, &amount).await,
        Command::Withdraw { amount } => step(session, Action::Withdraw, &amount).await,
        Command::Borrow { amount } => step(session, Action::Borrow, &amount).await,
        Command::Repay { amount } => step(session, Action::Repay, &amount).await,
        Command::Approve { amount } => {
            let amount = parse_units(&amount, session.config().pool.decimals)?;
            let receipt = session.approve(amount).await?;
            println!("approved in block {} ({})", receipt.block_number, receipt.hash);
            Ok(())
        }
        Command::Exec { steps } => {
            for s in steps {
                let (action, amount) = s
                    .split_once('=')
                    .with_context(|| format!("expected action=amount, got {:?}", s))?;
                let action: Action = action.parse().map_err(anyhow::Error::msg)?;
                step(session, action, amount).await?;
            }
            print_dashboard(session)
        }
    }
}

async fn step(session: &LendingSession, action: Action, amount: &str) -> Result<()> {
    let intent = session
        .intent(action, amount)
        .with_context(|| format!("invalid amount {:?}", amount))?;
    let receipt = session.submit(intent.clone()).await?;
    println!(
        "{} {} confirmed in block {} ({})",
        intent,
        session.config().pool.symbol,
        receipt.block_number,
        receipt.hash
    );
    Ok(())
}

async fn watch(session: &LendingSession) -> Result<()> {
    let mut ticker = tokio::time::interval(session.config().poll_interval());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = print_dashboard(session) {
                    warn!("{:#}", e);
                }
            }
        }
    }
}

fn print_dashboard(session: &LendingSession) -> Result<()> {
    let dash = session.dashboard()?;
    let pool = &session.config().pool;
    print!("{}", render(&dash, pool.decimals, &pool.symbol));
    Ok(())
}

fn render(dash: &Dashboard, decimals: u8, symbol: &str) -> String {
    let amount = |v| format!("{} {}", format_units(v, decimals, 4), symbol);
    let mut out = String::new();
    out.push_str(&format!("pool supply     {}\n", amount(dash.pool.total_supply)));
    out.push_str(&format!("pool borrow     {}\n", amount(dash.pool.total_borrow)));
    out.push_str(&format!("utilization     {}\n", dash.utilization));
    out.push_str(&format!("supply apy      {}%\n", dash.pool.supply_rate));
    out.push_str(&format!("borrow apy      {}%\n", dash.pool.borrow_rate));
    out.push_str(&format!("wallet          {}\n", amount(dash.balance)));
    out.push_str(&format!("allowance       {}\n", amount(dash.allowance)));
    out.push_str(&format!("supplied        {}\n", amount(dash.position.supplied)));
    out.push_str(&format!("borrowed        {}\n", amount(dash.position.borrowed)));
    out.push_str(&format!(
        "health factor   {} ({:?}, warning {:?})\n",
        dash.health_display, dash.health_status, dash.health_warning
    ));
    out.push_str(&format!("max withdraw    {}\n", amount(dash.max_withdraw)));
    out.push_str(&format!("max borrow      {}\n", amount(dash.max_borrow)));
    if dash.stale {
        out.push_str("(stale)\n");
    }
    for (read, err) in [
        ("pool", &dash.errors.pool),
        ("position", &dash.errors.position),
        ("allowance", &dash.errors.allowance),
        ("balance", &dash.errors.balance),
    ] {
        if let Some(e) = err {
            out.push_str(&format!("{} read failed: {}\n", read, e));
        }
    }
    out
}
