use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use txsync_cli::commands::{self, CliContext, QueryArgs};
use txsync_cli::{accounts, default_data_dir, parse_timestamp, CliSortOrder};
use txsync_core::{Address, Timestamp, TxHash};
use txsync_infra::ExplorerOptions;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Directory holding the local store and tracked accounts
    #[arg(long, global = true, env = txsync_config::DATA_DIR_ENV)]
    data_dir: Option<Utf8PathBuf>,
    #[arg(long, global = true, env = txsync_config::API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, global = true, default_value = txsync_config::ETHERSCAN_API_URL)]
    api_url: String,
    #[arg(long, global = true, default_value_t = 1)]
    chain_id: u64,
    #[arg(long, global = true, default_value_t = txsync_config::DEFAULT_PAGE_SIZE)]
    page_size: u32,
    #[arg(long, global = true, default_value_t = txsync_config::DEFAULT_REQUESTS_PER_SECOND)]
    rps: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tracked accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Fetch every uncovered part of a time window
    Sync {
        /// Accounts to sync; defaults to every tracked account
        addresses: Vec<Address>,
        #[arg(long, value_parser = parse_timestamp, default_value = "0")]
        from: Timestamp,
        /// Defaults to now
        #[arg(long, value_parser = parse_timestamp)]
        to: Option<Timestamp>,
    },
    /// Sync, then list stored transactions
    Query {
        #[arg(short, long = "address")]
        addresses: Vec<Address>,
        #[arg(long)]
        hash: Option<TxHash>,
        #[arg(long, value_parser = parse_timestamp)]
        from: Option<Timestamp>,
        #[arg(long, value_parser = parse_timestamp)]
        to: Option<Timestamp>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, value_enum, default_value_t = CliSortOrder::Asc)]
        order: CliSortOrder,
        /// Read the local store only
        #[arg(long)]
        cache_only: bool,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Print a transaction receipt, fetching it when missing
    Receipt { hash: TxHash },
    #[command(name = "backfill-receipts")]
    BackfillReceipts {
        #[arg(short, long, default_value_t = txsync_config::DEFAULT_RECEIPT_BACKFILL_LIMIT)]
        limit: usize,
    },
    /// Show synchronized time ranges of an account
    Coverage { address: Address },
    /// Check the local store
    Status,
}

#[derive(Subcommand)]
enum AccountCommands {
    List,
    Add {
        address: Address,
        #[arg(long)]
        label: Option<String>,
    },
    Remove {
        address: Address,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let ctx = CliContext {
        data_dir,
        explorer: ExplorerOptions {
            base_url: cli.api_url,
            api_key: cli.api_key,
            chain_id: cli.chain_id,
            page_size: cli.page_size,
            requests_per_second: cli.rps,
            ..ExplorerOptions::default()
        },
    };

    match cli.command {
        Commands::Account { command } => match command {
            AccountCommands::List => accounts::handle_list(&ctx.data_dir)?,
            AccountCommands::Add { address, label } => {
                accounts::handle_add(&ctx.data_dir, address, label)?
            }
            AccountCommands::Remove { address } => accounts::handle_remove(&ctx.data_dir, address)?,
        },
        Commands::Sync {
            addresses,
            from,
            to,
        } => {
            let reports = commands::cmd_sync(&ctx, addresses, from, to).await?;
            if reports.iter().any(|r| !r.is_complete()) {
                std::process::exit(2);
            }
        }
        Commands::Query {
            addresses,
            hash,
            from,
            to,
            limit,
            offset,
            order,
            cache_only,
            json,
        } => {
            let args = QueryArgs {
                addresses,
                hash,
                from,
                to,
                limit,
                offset,
                order: order.into(),
                cache_only,
                json,
            };
            commands::cmd_query(&ctx, args).await?;
        }
        Commands::Receipt { hash } => {
            commands::cmd_receipt(&ctx, hash).await?;
        }
        Commands::BackfillReceipts { limit } => {
            commands::cmd_backfill_receipts(&ctx, limit).await?;
        }
        Commands::Coverage { address } => {
            commands::cmd_coverage(&ctx, address)?;
        }
        Commands::Status => {
            commands::cmd_status(&ctx)?;
        }
    }

    Ok(())
}
