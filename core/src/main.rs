//! Coinshuffle Devnet
//!
//! Single-process block producer that runs one shuffling end to end.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Coinshuffle Devnet                        │
//! │                                                                  │
//! │   ┌────────────┐  mpsc   ┌──────────────────┐                    │
//! │   │  Shuffler  │ ──────► │  Block producer  │ ◄── interval tick  │
//! │   │  (agents)  │         │  BlockProcessor  │                    │
//! │   └─────▲──────┘         └────────┬─────────┘                    │
//! │         │ events                  │ commit                       │
//! │         └─────────────────────────▼                              │
//! │                         ┌──────────────────┐                     │
//! │                         │ MemStore/RocksDB │                     │
//! │                         └──────────────────┘                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

use coinshuffle_account::{AccountId, Holding};
use coinshuffle_config::{ShuffleConfig, StorageBackend};
use coinshuffle_core::shuffler::Shuffler;
use coinshuffle_core::shuffling::{ShufflingEngine, ShufflingId, ShufflingTransaction};
use coinshuffle_core::storage::{BlockProcessor, MemStore, RocksDbStore, StateStore};
use coinshuffle_keypair::Keypair;

/// Accounts that take turns producing blocks.
const GENERATORS: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = ShuffleConfig::load().context("failed to load configuration")?;
    let devnet = config.devnet.clone();

    info!("============================================");
    info!(
        "        COINSHUFFLE DEVNET v{}            ",
        env!("CARGO_PKG_VERSION")
    );
    info!("============================================");
    info!("Backend           : {:?}", config.database.backend);
    info!("Participants      : {}", devnet.participants);
    info!("Amount            : {}", devnet.amount);
    info!("Deposit           : {}", config.protocol.deposit);
    info!("Block interval    : {}ms", devnet.block_interval_ms);
    info!("Max blocks        : {}", devnet.max_blocks);
    info!("============================================");

    let mut store: Box<dyn StateStore + Send> = match config.database.backend {
        StorageBackend::Memory => Box::new(MemStore::new()),
        StorageBackend::Rocksdb => {
            let mut db = RocksDbStore::open(&config.database.path)?;
            info!("Database opened at {}", config.database.path);
            if config.database.reset_on_start {
                db.rollback_to(0)?;
                info!("Stored chain discarded (reset_on_start)");
            }
            Box::new(db)
        }
    };

    let start_nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_millis() as u64;
    let shuffler = Arc::new(Shuffler::with_nonce(start_nonce));
    let mut engine = ShufflingEngine::from_config(&config);
    engine.add_observer(shuffler.clone());

    let result = run(&config, &engine, &shuffler, store.as_mut()).await;
    if let Err(e) = &result {
        log::error!("devnet stopped with error: {e:#}");
    }
    result
}

async fn run(
    config: &ShuffleConfig,
    engine: &ShufflingEngine,
    shuffler: &Arc<Shuffler>,
    store: &mut (dyn StateStore + Send),
) -> Result<()> {
    let devnet = &config.devnet;
    let deposit = config.protocol.deposit;

    let participants: Vec<Keypair> = (0..devnet.participants)
        .map(|i| Keypair::from_passphrase(&format!("devnet participant {i}")))
        .collect();
    let recipients: Vec<Keypair> = (0..devnet.participants)
        .map(|i| Keypair::from_passphrase(&format!("devnet recipient {i}")))
        .collect();
    let generators: Vec<Keypair> = (0..GENERATORS)
        .map(|i| Keypair::from_passphrase(&format!("devnet generator {i}")))
        .collect();

    let mut processor = BlockProcessor::resume(engine, store)?;
    let start_height = processor.height();
    if start_height > 0 {
        info!("Resuming stored chain at height {start_height}");
    }

    let mut allocations: Vec<_> = participants
        .iter()
        .map(|p| (p.public_key(), Holding::Coin, devnet.amount + deposit))
        .collect();
    allocations.extend(generators.iter().map(|g| (g.public_key(), Holding::Coin, 0)));
    processor.apply_genesis(&allocations)?;

    let (mempool_tx, mut mempool_rx) = mpsc::unbounded_channel::<ShufflingTransaction>();

    let Some(issuer) = participants.first() else {
        bail!("devnet needs at least one participant");
    };
    let creation = shuffler.create(
        issuer,
        recipients[0].public_key(),
        Holding::Coin,
        devnet.amount,
        devnet.participants,
        config.protocol.max_registration_period.min(20),
    )?;
    let shuffling_id = ShufflingId(creation.id);
    let full_hash = creation.full_hash;
    info!("Issuer {} creates shuffling {shuffling_id}", issuer.account_id());
    mempool_tx.send(creation).context("mempool closed")?;

    let mut registered = false;
    let mut interval = tokio::time::interval(Duration::from_millis(devnet.block_interval_ms));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }

        let mut txs = Vec::new();
        while let Ok(tx) = mempool_rx.try_recv() {
            txs.push(tx);
        }
        let generator = &generators[processor.height() as usize % GENERATORS];
        let report = processor.apply_block(generator.account_id(), &txs)?;
        for result in report.results.iter().filter(|r| !r.success) {
            warn!(
                "block {}: {:?} from {} rejected: {}",
                report.height,
                result.kind,
                result.sender,
                result.error.as_deref().unwrap_or("unknown")
            );
            shuffler.retry(result);
        }
        for (id, event) in &report.events {
            info!("block {}: shuffling {id}: {event:?}", report.height);
        }

        let snapshot = processor.snapshot();
        if !registered && engine.registry(snapshot).get(shuffling_id)?.is_some() {
            for (participant, recipient) in participants.iter().zip(&recipients).skip(1) {
                let tx = shuffler.register(snapshot, participant, recipient.public_key(), full_hash)?;
                mempool_tx.send(tx).context("mempool closed")?;
            }
            registered = true;
        }
        for tx in shuffler.next_messages(engine, snapshot)? {
            debug!("queueing {:?} from {}", tx.attachment.kind(), tx.sender);
            mempool_tx.send(tx).context("mempool closed")?;
        }

        let Some(shuffling) = engine.registry(snapshot).get(shuffling_id)? else {
            if registered {
                bail!("shuffling {shuffling_id} disappeared");
            }
            continue;
        };
        if shuffling.stage.is_terminal() {
            info!(
                "shuffling {shuffling_id} finished in {:?} at height {}",
                shuffling.stage,
                processor.height()
            );
            break;
        }
        if processor.height() - start_height >= devnet.max_blocks {
            warn!("giving up after {} blocks", devnet.max_blocks);
            break;
        }
    }

    report_balances(&processor, "participant", &participants)?;
    report_balances(&processor, "recipient", &recipients)?;
    report_balances(&processor, "generator", &generators)?;
    Ok(())
}

fn report_balances<S: StateStore + ?Sized>(
    processor: &BlockProcessor<'_, S>,
    role: &str,
    keypairs: &[Keypair],
) -> Result<()> {
    for keypair in keypairs {
        let account: AccountId = keypair.account_id();
        let balance = processor.balance(account, Holding::Coin)?;
        info!(
            "{role:<11} {account}: confirmed {} unconfirmed {}",
            balance.confirmed, balance.unconfirmed
        );
    }
    Ok(())
}
