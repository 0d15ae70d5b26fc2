//! Command-line driver for the keybox recovery core
//!
//! Operates one account against a live remote authority and Esplora:
//! - import the account's active keyset
//! - start, watch, cancel and complete lost-factor recoveries
//! - rotate the spending key once a recovery completes
//! - check for and prepare sweeps of retired keysets

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use base64::Engine as _;
use bitcoin::bip32::Xpub;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use keybox_chain::EsploraClient;
use keybox_core::{
    AccountId, AuthorizationStrategy, Clock, Factor, LostFactor, ProofOfPossession, RecoveryState,
    SpendingKeyset, SystemClock,
};
use keybox_f8e::{F8eClient, KeysetService};
use keybox_wallet_service::{
    load_active_keybox, run_blocking, AccountLocks, KeyRotationService, PrivilegedActionRegistry,
    RecoveryService, RecoveryStatus, ServiceConfig, SqliteStore, SweepService, WalletStore,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "keybox")]
#[command(about = "2-of-3 wallet recovery and sweep tool", long_about = None)]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long, env = "KEYBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Account identifier at the remote authority
    #[arg(short, long, env = "KEYBOX_ACCOUNT")]
    account: String,

    /// Database passphrase
    #[arg(long, env = "KEYBOX_DB_PASSPHRASE", hide_env_values = true)]
    passphrase: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Local keysets
    #[command(subcommand)]
    Keyset(KeysetCommand),

    /// Lost-factor recovery
    #[command(subcommand)]
    Recovery(RecoveryCommand),

    /// Sweeps of retired keysets
    #[command(subcommand)]
    Sweep(SweepCommand),
}

#[derive(Subcommand)]
enum KeysetCommand {
    /// Import a keyset from the remote authority as the active keyset
    Import {
        /// Server keyset id; defaults to the server's active keyset
        #[arg(long)]
        keyset_id: Option<String>,
    },

    /// List local keysets
    List,
}

#[derive(Subcommand)]
enum RecoveryCommand {
    /// Start recovering a lost factor
    Start {
        /// Factor that was lost
        #[arg(long, value_enum)]
        lost: LostArg,

        /// Public key of the replacement factor
        #[arg(long)]
        new_key: Option<Xpub>,

        #[command(flatten)]
        proof: ProofArgs,
    },

    /// Poll the remote authority and show the recovery state
    Status,

    /// Poll until the recovery can be completed
    Wait {
        /// Seconds between polls
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },

    /// Cancel the recovery
    Cancel {
        /// Factor cancelling
        #[arg(long, value_enum)]
        by: FactorArg,
    },

    /// Complete an authorized recovery
    Complete {
        #[command(flatten)]
        proof: ProofArgs,
    },

    /// Replace the lost factor's key after completion
    Rotate {
        /// Public key of the replacement factor
        #[arg(long)]
        new_key: Xpub,
    },
}

#[derive(Subcommand)]
enum SweepCommand {
    /// Report whether retired keysets hold sweepable funds
    Check,

    /// Build the unsigned sweep PSBTs
    Prepare,
}

#[derive(Args)]
struct ProofArgs {
    /// Signature by the app key
    #[arg(long)]
    app_signature: Option<String>,

    /// Signature by the hardware key
    #[arg(long)]
    hardware_signature: Option<String>,
}

impl From<ProofArgs> for ProofOfPossession {
    fn from(args: ProofArgs) -> Self {
        ProofOfPossession {
            app_signature: args.app_signature,
            hardware_signature: args.hardware_signature,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LostArg {
    App,
    Hardware,
}

impl From<LostArg> for LostFactor {
    fn from(arg: LostArg) -> Self {
        match arg {
            LostArg::App => LostFactor::App,
            LostArg::Hardware => LostFactor::Hardware,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FactorArg {
    App,
    Hardware,
}

impl From<FactorArg> for Factor {
    fn from(arg: FactorArg) -> Self {
        match arg {
            FactorArg::App => Factor::App,
            FactorArg::Hardware => Factor::Hardware,
        }
    }
}

/// Collaborators shared by every command
struct Context {
    config: ServiceConfig,
    account: AccountId,
    store: Arc<dyn WalletStore>,
    locks: AccountLocks,
    clock: Arc<dyn Clock>,
    f8e: Arc<F8eClient>,
    chain: Arc<EsploraClient>,
}

impl Context {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let config = ServiceConfig::load(cli.config.as_deref()).context("loading config")?;
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let store = SqliteStore::open(&config.database_path(), &cli.passphrase)
            .context("opening wallet database")?;

        info!(
            "Network {} | f8e {} | esplora {}",
            config.network, config.f8e.base_url, config.esplora.base_url
        );

        Ok(Self {
            f8e: Arc::new(F8eClient::new(&config.f8e)?),
            chain: Arc::new(EsploraClient::new(&config.esplora)?),
            account: AccountId::new(cli.account.clone()),
            store: Arc::new(store),
            locks: AccountLocks::new(),
            clock: Arc::new(SystemClock),
            config,
        })
    }

    async fn recovery(&self) -> anyhow::Result<RecoveryService> {
        let registry = Arc::new(PrivilegedActionRegistry::new(
            self.f8e.clone(),
            Arc::clone(&self.clock),
            self.config.retry.clone(),
        ));
        let service = RecoveryService::open(
            self.account.clone(),
            registry,
            Arc::clone(&self.store),
            self.locks.clone(),
            Arc::clone(&self.clock),
        )
        .await?;
        Ok(service)
    }

    fn rotation(&self) -> KeyRotationService {
        KeyRotationService::new(
            self.account.clone(),
            self.f8e.clone(),
            Arc::clone(&self.store),
            self.locks.clone(),
            self.config.retry.clone(),
        )
    }

    fn sweeps(&self) -> SweepService {
        SweepService::new(
            self.account.clone(),
            self.config.network_params(),
            Arc::clone(&self.store),
            self.f8e.clone(),
            self.chain.clone(),
        )
        .with_fee_priority(self.config.fee_priority)
        .with_gap_limit(self.config.gap_limit)
        .with_retry(self.config.retry.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let ctx = Context::open(&cli)?;

    let result = match cli.command {
        Commands::Keyset(KeysetCommand::Import { keyset_id }) => import_keyset(&ctx, keyset_id).await,
        Commands::Keyset(KeysetCommand::List) => list_keysets(&ctx).await,
        Commands::Recovery(command) => run_recovery(&ctx, command).await,
        Commands::Sweep(SweepCommand::Check) => check_sweeps(&ctx).await,
        Commands::Sweep(SweepCommand::Prepare) => prepare_sweep(&ctx).await,
    };

    if let Err(e) = &result {
        if let Some(core) = e.downcast_ref::<keybox_core::Error>() {
            warn!("{} error: {}", core.category(), core);
            eprintln!("{}", core.user_message());
        }
    }
    result
}

async fn import_keyset(ctx: &Context, keyset_id: Option<String>) -> anyhow::Result<()> {
    let remote = ctx.f8e.list_keysets(&ctx.account).await?;
    let chosen = remote
        .into_iter()
        .filter(|k| k.network == ctx.config.network)
        .find(|k| match &keyset_id {
            Some(id) => &k.keyset_id == id,
            None => k.active,
        })
        .ok_or_else(|| anyhow!("no matching keyset on the server for {}", ctx.account))?;

    let keyset = SpendingKeyset::new(
        chosen.network,
        chosen.app_spending_public_key,
        chosen.hardware_spending_public_key,
        chosen.f8e_spending_keyset(),
    );
    ctx.rotation().import_keyset(keyset.clone()).await?;
    info!("Imported keyset {} (server {})", keyset.local_id, chosen.keyset_id);
    println!("{}", keyset.local_id);
    Ok(())
}

async fn list_keysets(ctx: &Context) -> anyhow::Result<()> {
    let account = ctx.account.clone();
    let keysets = run_blocking(&ctx.store, move |s| s.list_keysets(&account)).await?;

    for stored in keysets {
        println!(
            "{}  {:<7}  server {}  created {}",
            stored.keyset.local_id,
            if stored.is_active() { "active" } else { "retired" },
            stored.keyset.f8e_spending_keyset.keyset_id,
            stored.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn run_recovery(ctx: &Context, command: RecoveryCommand) -> anyhow::Result<()> {
    let recovery = ctx.recovery().await?;
    recovery.resume().await?;

    match command {
        RecoveryCommand::Start {
            lost,
            new_key,
            proof,
        } => {
            let state = recovery
                .start_recovery(lost.into(), proof.into(), new_key)
                .await?;
            print_state(&state, state.remaining_delay(ctx.clock.now()));
        }
        RecoveryCommand::Status => {
            let status = recovery.poll().await?;
            if let Some(event) = status.event.describe() {
                info!("{}", event);
            }
            print_status(&status);
        }
        RecoveryCommand::Wait { interval } => {
            wait_until_ready(&recovery, ctx.clock.as_ref(), interval).await?;
        }
        RecoveryCommand::Cancel { by } => {
            let state = recovery.cancel(by.into()).await?;
            print_state(&state, None);
        }
        RecoveryCommand::Complete { proof } => {
            let completed = recovery.complete(proof.into()).await?;
            println!(
                "Recovery {} completed at {}",
                completed.action_id, completed.completed_at
            );
            if completed.new_factor_public_key.is_some() {
                println!("Next: keybox recovery rotate --new-key <xpub>");
            }
        }
        RecoveryCommand::Rotate { new_key } => {
            let completed = match recovery.state() {
                RecoveryState::Completed(completed) => completed,
                other => bail!("no completed recovery to rotate from (state {})", other.name()),
            };
            let keyset = ctx.rotation().rotate_spending_key(&completed, new_key).await?;
            println!("Active keyset is now {}", keyset.local_id);

            let sweeps = ctx.sweeps();
            match sweeps.check_for_sweeps().await {
                Ok(true) => println!("Retired keysets hold funds: run `keybox sweep prepare`"),
                Ok(false) => {}
                Err(e) => warn!("Sweep check after rotation failed: {}", e),
            }
        }
    }
    Ok(())
}

async fn wait_until_ready(
    recovery: &RecoveryService,
    clock: &dyn Clock,
    interval: u64,
) -> anyhow::Result<()> {
    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% {msg}")?
            .progress_chars("=>-"),
    );

    loop {
        let status = recovery.poll().await;
        let status = match status {
            Ok(status) => status,
            Err(e) if e.is_transient() => {
                pb.set_message(format!("retrying: {}", e));
                tokio::time::sleep(Duration::from_secs(interval)).await;
                continue;
            }
            Err(e) => {
                pb.abandon_with_message("failed");
                return Err(e.into());
            }
        };

        match &status.state {
            RecoveryState::ReadyToComplete(_) => {
                pb.finish_with_message("ready to complete");
                return Ok(());
            }
            RecoveryState::InProgress(active) => match &active.action.authorization_strategy {
                strategy @ AuthorizationStrategy::DelayAndNotify { .. } => {
                    let progress = strategy.delay_progress(clock.now());
                    let remaining = status.remaining_delay.unwrap_or_default().as_secs();
                    pb.set_position((progress * 1000.0) as u64);
                    pb.set_message(format!("{} remaining", format_duration(remaining)));
                }
                AuthorizationStrategy::OutOfBand => {
                    pb.set_message("waiting for out-of-band approval");
                }
            },
            other => {
                pb.abandon_with_message(other.name());
                bail!("recovery is {}, nothing to wait for", other.name());
            }
        }

        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

async fn check_sweeps(ctx: &Context) -> anyhow::Result<()> {
    let required = ctx.sweeps().check_for_sweeps().await?;
    println!("{}", if required { "sweep required" } else { "nothing to sweep" });
    Ok(())
}

async fn prepare_sweep(ctx: &Context) -> anyhow::Result<()> {
    let keybox = load_active_keybox(&ctx.store, &ctx.account).await?;
    let sweep = match ctx.sweeps().prepare_sweep(&keybox).await? {
        Some(sweep) => sweep,
        None => {
            println!("nothing to sweep");
            return Ok(());
        }
    };

    println!(
        "Sweep to {} (keyset {}): {} sats, fee {} sats",
        sweep.destination,
        sweep.destination_keyset_id,
        sweep.total_swept().to_sat(),
        sweep.total_fee().to_sat()
    );
    let engine = base64::engine::general_purpose::STANDARD;
    for entry in &sweep.psbts {
        println!(
            "\n# keyset {}: {} in, {} fee, {} out",
            entry.source_keyset_id,
            entry.input_amount.to_sat(),
            entry.fee.to_sat(),
            entry.output_amount.to_sat()
        );
        println!("{}", engine.encode(entry.psbt.serialize()));
    }
    Ok(())
}

fn print_status(status: &RecoveryStatus) {
    print_state(&status.state, status.remaining_delay);
}

fn print_state(state: &RecoveryState, remaining: Option<Duration>) {
    match state {
        RecoveryState::NotStarted => println!("No recovery in progress"),
        RecoveryState::InProgress(active) => println!(
            "Lost-{} recovery {} in progress, {} remaining",
            active.lost_factor,
            active.action.id,
            format_duration(remaining.unwrap_or_default().as_secs())
        ),
        RecoveryState::ReadyToComplete(active) => println!(
            "Lost-{} recovery {} is ready to complete",
            active.lost_factor, active.action.id
        ),
        RecoveryState::Completing(active) => println!(
            "Lost-{} recovery {} is completing",
            active.lost_factor, active.action.id
        ),
        RecoveryState::Completed(completed) => println!(
            "Lost-{} recovery {} completed at {}",
            completed.lost_factor, completed.action_id, completed.completed_at
        ),
        RecoveryState::Cancelled(cancelled) => println!(
            "Lost-{} recovery {} cancelled{}",
            cancelled.lost_factor,
            cancelled.action_id,
            cancelled
                .cancelled_by
                .map(|by| format!(" by {}", by))
                .unwrap_or_default()
        ),
    }
}

fn format_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}
