//! Ledger Deadlock - demo runner
//!
//! Runs the three scenarios against the configured store:
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────┐    ┌────────────┐
//! │  Config  │───▶│ Ordered batch│───▶│ Stress (N×M) │───▶│ Simulation │
//! │  (YAML)  │    │  (Preventer) │    │  (Detector)  │    │ (inverse)  │
//! └──────────┘    └──────────────┘    └──────────────┘    └────────────┘
//! ```
//!
//! Uses PostgreSQL when `postgres_url` is set (accounts must already exist),
//! otherwise a seeded in-memory store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::ensure;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use ledger_deadlock::config::AppConfig;
use ledger_deadlock::{
    AccountId, DeadlockDetector, DeadlockMonitor, DeadlockPreventer, DeadlockSimulator,
    MemoryStore, PgStore, Transfer, TransactionalStore, apply_ordered_transfer,
    is_conflict_error,
};

type Store = dyn TransactionalStore;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn total_balance(store: &Store, ids: &[AccountId]) -> anyhow::Result<Decimal> {
    let mut total = Decimal::ZERO;
    for &id in ids {
        total += store.account(id).await?.balance;
    }
    Ok(total)
}

/// Ring batch over every account: 1→2, 2→3, ..., n→1
async fn run_batch_scenario(store: &Arc<Store>, ids: &[AccountId]) -> anyhow::Result<()> {
    const AMOUNTS: [i64; 4] = [100, 50, 25, 75];

    let batch: Vec<Transfer> = ids
        .iter()
        .enumerate()
        .map(|(i, &from)| {
            let to = ids[(i + 1) % ids.len()];
            Transfer::new(from, to, AMOUNTS[i % AMOUNTS.len()])
        })
        .collect();

    let preventer = DeadlockPreventer::new(Arc::clone(store));
    preventer.transfer_batch_ordered(&batch).await?;

    for &id in ids {
        info!(account_id = id, balance = %store.account(id).await?.balance, "Balance after batch");
    }
    Ok(())
}

/// `callers` concurrent tasks, each issuing ordered transfers through the detector
async fn run_stress_scenario(
    detector: Arc<DeadlockDetector<Store>>,
    ids: &[AccountId],
    callers: usize,
    transfers_per_caller: usize,
) -> usize {
    let n = ids.len();
    let start = Instant::now();

    let handles: Vec<_> = (0..callers)
        .map(|caller| {
            let detector = Arc::clone(&detector);
            let ids = ids.to_vec();
            tokio::spawn(async move {
                let mut failures = 0;
                for k in 0..transfers_per_caller {
                    let from = ids[(caller + k) % n];
                    let to = ids[(caller + 2 * k + 1) % n];
                    if from == to {
                        continue;
                    }
                    let transfer = Transfer::new(from, to, (k % 10 + 1) as i64);

                    let result = detector
                        .execute_with_retry(move |tx| {
                            Box::pin(async move { apply_ordered_transfer(tx, &transfer).await })
                        })
                        .await;
                    if let Err(e) = result {
                        error!(caller = caller, code = e.code(), error = %e, "Transfer failed");
                        failures += 1;
                    }
                }
                failures
            })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        match handle.await {
            Ok(f) => failures += f,
            Err(e) => {
                error!(error = %e, "Stress task panicked");
                failures += transfers_per_caller;
            }
        }
    }

    info!(
        callers = callers,
        transfers_per_caller = transfers_per_caller,
        failures = failures,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Stress scenario finished"
    );
    failures
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = ledger_deadlock::logging::init_logging(&app_config);

    info!(
        build = env!("GIT_HASH"),
        "Starting ledger_deadlock demo in {} mode", env
    );

    ensure!(
        app_config.demo.accounts >= 2,
        "demo.accounts must be at least 2"
    );
    let ids: Vec<AccountId> = (1..=app_config.demo.accounts).collect();

    let store: Arc<Store> = match &app_config.postgres_url {
        Some(url) => {
            let pg = PgStore::connect(url, app_config.max_connections).await?;
            pg.health_check().await?;
            Arc::new(pg)
        }
        None => {
            let seed = Decimal::from(app_config.demo.initial_balance);
            Arc::new(MemoryStore::with_balances(ids.iter().map(|&id| (id, seed))))
        }
    };
    info!(store = store.name(), accounts = ids.len(), "Store ready");

    let total_before = total_balance(store.as_ref(), &ids).await?;

    run_batch_scenario(&store, &ids).await?;

    let monitor = Arc::new(DeadlockMonitor::new());
    let detector = Arc::new(DeadlockDetector::new(
        Arc::clone(&store),
        app_config.retry_policy(),
        Arc::clone(&monitor),
    ));
    let failures = run_stress_scenario(
        detector,
        &ids,
        app_config.demo.callers,
        app_config.demo.transfers_per_caller,
    )
    .await;
    info!("{}", monitor.statistics());

    if app_config.simulator.enabled {
        let simulator = DeadlockSimulator::new(
            Arc::clone(&store),
            Duration::from_millis(app_config.simulator.lock_delay_ms),
        );
        match simulator
            .simulate_classic_deadlock(ids[0], ids[1], Decimal::from(10), Decimal::from(10))
            .await
        {
            Err(e) if is_conflict_error(&e) => {
                info!(error = %e, "Store detected the inverse-order deadlock")
            }
            Err(e) => warn!(error = %e, "Simulation failed without a conflict"),
            Ok(()) => warn!("Simulation completed without a deadlock"),
        }
    }

    let total_after = total_balance(store.as_ref(), &ids).await?;
    info!(before = %total_before, after = %total_after, "Total balance");

    ensure!(
        total_before == total_after,
        "Total balance changed: {} -> {}",
        total_before,
        total_after
    );
    ensure!(failures == 0, "{} stress transfers failed", failures);
    Ok(())
}
