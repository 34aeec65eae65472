//! One-shot runner for the settlement jobs, for use from cron or an operator shell.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use marketplace_settlement::{
    auth::JobAccess,
    config, db,
    services::{earnings::ReleaseScope, payouts::PayoutRunRequest},
    AppState,
};

#[derive(Parser, Debug)]
#[command(name = "settlement-jobs", about = "Run marketplace settlement jobs once")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-attempt every drop-ship order waiting on funds
    Sweep {
        #[arg(long)]
        batch_size: Option<u64>,
    },
    /// Release held seller distributions whose holding period has elapsed
    ReleaseHeld,
    /// Run the payout batch
    Payouts(PayoutArgs),
    /// Apply pending database migrations
    Migrate,
}

#[derive(Args, Debug)]
struct PayoutArgs {
    /// Run outside the scheduled days (administrator self-payout only)
    #[arg(long)]
    force: bool,
    /// Report without transferring or mutating balances
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    only_user_id: Option<Uuid>,
    /// Profile id of the administrator running a forced payout
    #[arg(long)]
    admin_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if let Commands::Migrate = cli.command {
        db::run_migrations(&pool).await.context("migrations failed")?;
        println!("migrations applied");
        return Ok(());
    }

    let db = Arc::new(pool);
    let cfg = Arc::new(cfg);
    let state = AppState::with_live_clients(db.clone(), cfg.clone())
        .context("failed to build clients")?;
    let services = &state.services;

    match cli.command {
        Commands::Sweep { batch_size } => {
            let summary = services
                .fulfillment
                .sweep(batch_size.unwrap_or(cfg.jobs.sweep_batch_size).max(1))
                .await?;
            print(&summary, cli.json)?;
        }
        Commands::ReleaseHeld => {
            let summary = services
                .earnings
                .release_held(ReleaseScope::Due { now: Utc::now() })
                .await?;
            print(&summary, cli.json)?;
        }
        Commands::Payouts(args) => {
            let access = match args.admin_id {
                Some(admin_id) => {
                    let is_admin = marketplace_settlement::auth::is_admin(
                        &db,
                        admin_id,
                        &cfg.payouts.admin_roles,
                    )
                    .await?;
                    anyhow::ensure!(is_admin, "{} is not an administrator", admin_id);
                    JobAccess::Admin(marketplace_settlement::auth::CallerIdentity {
                        user_id: admin_id,
                    })
                }
                None => JobAccess::JobToken,
            };
            let request = PayoutRunRequest {
                force: args.force,
                dry_run: args.dry_run,
                only_user_id: args.only_user_id,
            };
            let report = services
                .payouts
                .run_batch(request, &access, Utc::now())
                .await?;
            print(&report, cli.json)?;
        }
        Commands::Migrate => {}
    }
    Ok(())
}

fn print<T: Serialize + std::fmt::Debug>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{:#?}", value);
    }
    Ok(())
}
