use std::sync::Arc;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use txsync_core::{
    Address, Category, Receipt, SortOrder, TimeRange, Timestamp, Transaction, TransactionFilter,
    TxHash,
};
use txsync_engine::{EngineOptions, MessageAggregator, Severity, SyncEngine, SyncReport};
use txsync_infra::{EtherscanApi, ExplorerOptions};
use txsync_persistence::{DbState, RedbSyncStore};

use crate::accounts::AccountBook;
use crate::format_timestamp;

/// Everything a command needs to reach the local store and the explorer.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub data_dir: Utf8PathBuf,
    pub explorer: ExplorerOptions,
}

#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub addresses: Vec<Address>,
    pub hash: Option<TxHash>,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub order: SortOrder,
    pub cache_only: bool,
    pub json: bool,
}

impl CliContext {
    fn open_store(&self) -> Result<Arc<RedbSyncStore>> {
        let store = RedbSyncStore::open(&self.data_dir)
            .with_context(|| format!("Failed to open store in {}", self.data_dir))?;
        Ok(Arc::new(store))
    }

    fn engine(&self) -> Result<(SyncEngine, Arc<MessageAggregator>)> {
        let store = self.open_store()?;
        let api = EtherscanApi::new(&self.explorer).context("Failed to build explorer client")?;
        let options = EngineOptions {
            tracked_accounts: AccountBook::new(&self.data_dir).addresses()?,
        };
        let sink = Arc::new(MessageAggregator::new());
        let engine = SyncEngine::with_components(
            Arc::new(txsync_engine::EtherscanExplorer::new(api)),
            store,
            sink.clone(),
            options,
        );
        Ok((engine, sink))
    }
}

fn print_messages(sink: &MessageAggregator) {
    for message in sink.drain() {
        match message.severity {
            Severity::Warning => eprintln!("warning: {}", message.text),
            Severity::Error => eprintln!("error: {}", message.text),
        }
    }
}

fn print_report(report: &SyncReport) {
    println!("   Account: {}", report.address);
    for c in &report.categories {
        let status = match &c.failure {
            None if c.gaps_found == 0 => "up to date".to_string(),
            None => "synced".to_string(),
            Some(f) => format!("stopped at {} ({})", f.window, f.error),
        };
        println!(
            "     {:<22} gaps {:>3}/{:<3} stored {:>6}  parents {:>4}  {}",
            c.category.label(),
            c.gaps_completed,
            c.gaps_found,
            c.records_stored,
            c.parents_fetched,
            status
        );
    }
}

fn format_ranges(ranges: &[TimeRange]) -> String {
    if ranges.is_empty() {
        return "never synced".to_string();
    }
    ranges
        .iter()
        .map(|r| format!("{} .. {}", format_timestamp(r.start), format_timestamp(r.end)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub async fn cmd_sync(
    ctx: &CliContext,
    addresses: Vec<Address>,
    from: Timestamp,
    to: Option<Timestamp>,
) -> Result<Vec<SyncReport>> {
    let (engine, sink) = ctx.engine()?;
    let addresses = if addresses.is_empty() {
        engine.options().tracked_accounts.clone()
    } else {
        addresses
    };
    if addresses.is_empty() {
        bail!("No address given and no tracked accounts (see `txsync account add`)");
    }

    let to = to.unwrap_or_else(|| {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
    });
    println!(":: Synchronizing...");
    println!("   Window: {} .. {}", format_timestamp(from), format_timestamp(to));

    let mut reports = Vec::with_capacity(addresses.len());
    for address in addresses {
        let report = engine.sync_address(address, from, to).await?;
        print_report(&report);
        reports.push(report);
    }

    print_messages(&sink);
    Ok(reports)
}

pub async fn cmd_query(ctx: &CliContext, args: QueryArgs) -> Result<(Vec<Transaction>, usize)> {
    let (engine, sink) = ctx.engine()?;
    let filter = TransactionFilter {
        addresses: (!args.addresses.is_empty()).then_some(args.addresses),
        from_ts: args.from,
        to_ts: args.to,
        tx_hash: args.hash,
        limit: args.limit,
        offset: args.offset,
        order: args.order,
    };

    let (records, total) = engine.query(&filter, args.cache_only).await?;
    print_messages(&sink);

    if args.json {
        for tx in &records {
            println!("{}", serde_json::to_string(tx)?);
        }
    } else {
        println!(
            "{:<20} {:<68} {:<44} {:<44} {:>28}",
            "TIME", "HASH", "FROM", "TO", "VALUE (WEI)"
        );
        for tx in &records {
            println!(
                "{:<20} {:<68} {:<44} {:<44} {:>28}",
                format_timestamp(tx.timestamp),
                tx.hash,
                tx.from_address,
                tx.to_address
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "(contract creation)".to_string()),
                tx.value
            );
        }
        println!(":: {} of {} matching transactions", records.len(), total);
    }
    Ok((records, total))
}

pub async fn cmd_receipt(ctx: &CliContext, hash: TxHash) -> Result<Receipt> {
    let (engine, sink) = ctx.engine()?;
    let receipt = engine.get_or_fetch_receipt(&hash).await;
    print_messages(&sink);
    let receipt = receipt.with_context(|| format!("Failed to get receipt of {hash}"))?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(receipt)
}

pub async fn cmd_backfill_receipts(ctx: &CliContext, limit: usize) -> Result<usize> {
    let (engine, sink) = ctx.engine()?;
    let stored = engine.backfill_missing_receipts(limit).await?;
    print_messages(&sink);
    println!(":: Stored {stored} receipt(s)");
    Ok(stored)
}

pub fn cmd_coverage(
    ctx: &CliContext,
    address: Address,
) -> Result<Vec<(Category, Vec<TimeRange>)>> {
    let (engine, _) = ctx.engine()?;
    let coverage = engine.coverage(address)?;
    println!(":: Coverage of {address}");
    for (category, ranges) in &coverage {
        println!("   {:<22} {}", category.label(), format_ranges(ranges));
    }
    Ok(coverage)
}

pub fn cmd_status(ctx: &CliContext) -> Result<DbState> {
    let state = RedbSyncStore::validate(&ctx.data_dir)?;
    let path = RedbSyncStore::path_for_root(&ctx.data_dir);
    let summary = match state {
        DbState::Missing => "missing (created on first sync)".to_string(),
        DbState::Valid => "ok".to_string(),
        DbState::Busy => "in use by another process".to_string(),
        DbState::Corrupt => "corrupt (moved aside, a fresh store is created on next open)".into(),
        DbState::NewerSchema { found, supported } => {
            format!("written by a newer version (schema {found}, supported {supported})")
        }
    };
    println!(":: Store {path}: {summary}");
    if state == DbState::Valid {
        let last_sync = ctx.open_store()?.last_sync_at()?;
        println!("   Last sync: {}", last_sync.as_deref().unwrap_or("never"));
    }
    Ok(state)
}
