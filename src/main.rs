// Statement Ledger CLI - init, users, detection, imports, listings

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use statement_ledger::config::DEFAULT_CONFIG_FILE;
use statement_ledger::models::format_minor;
use statement_ledger::raw::decode_upload;
use statement_ledger::{
    init_logging, AppConfig, BankRegistry, Credentials, DecimalStyle, DialectDetector,
    IngestService, SqliteStore, TransactionFilter,
};

#[derive(Parser)]
#[command(name = "ledger", version, about = "Import bank CSV statements without duplicates")]
struct Cli {
    /// Config file (defaults to ./ledger.toml when present)
    #[arg(long, global = true, env = "LEDGER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Login {
    #[arg(long, short)]
    username: String,
    #[arg(long, env = "LEDGER_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and create the database
    Init,
    /// Create a user
    AddUser {
        #[command(flatten)]
        login: Login,
    },
    /// Show the detected dialect of a CSV file without importing it
    Detect {
        file: PathBuf,
        /// Bank name hint, e.g. "chase"
        #[arg(long)]
        bank: Option<String>,
    },
    /// Import a CSV statement
    Import {
        file: PathBuf,
        #[command(flatten)]
        login: Login,
        #[arg(long)]
        bank: Option<String>,
    },
    /// List stored transactions
    List {
        #[command(flatten)]
        login: Login,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// e.g. -25.00
        #[arg(long, allow_hyphen_values = true, value_parser = parse_amount)]
        min_amount: Option<i64>,
        #[arg(long, allow_hyphen_values = true, value_parser = parse_amount)]
        max_amount: Option<i64>,
        #[arg(long)]
        upload: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show upload history
    Uploads {
        #[command(flatten)]
        login: Login,
    },
}

fn parse_amount(raw: &str) -> std::result::Result<i64, String> {
    DecimalStyle::Dot
        .parse_minor(raw)
        .ok_or_else(|| format!("not an amount: {}", raw))
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => run_init(cli.config.as_deref(), &config),
        Commands::AddUser { login } => run_add_user(&config, &login),
        Commands::Detect { file, bank } => run_detect(&config, &file, bank.as_deref()),
        Commands::Import { file, login, bank } => run_import(&config, &file, &login, bank.as_deref()),
        Commands::List {
            login,
            from,
            to,
            min_amount,
            max_amount,
            upload,
            limit,
        } => {
            let filter = TransactionFilter {
                from,
                to,
                min_amount,
                max_amount,
                upload_id: upload,
                limit,
            };
            run_list(&config, &login, &filter)
        }
        Commands::Uploads { login } => run_uploads(&config, &login),
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(p) if p.exists() => {
            let mut config = AppConfig::load_from(p)?;
            config.apply_env_overrides(|k| std::env::var(k).ok())?;
            Ok(config)
        }
        _ => Ok(AppConfig::load()?),
    }
}

fn open_service(config: &AppConfig) -> Result<IngestService> {
    IngestService::from_config(config)
        .with_context(|| format!("open database {}", config.store.db_path.display()))
}

/// Log in and hand back a session token
fn session(service: &IngestService, login: &Login) -> Result<String> {
    let credentials = Credentials::new(login.username.clone(), login.password.clone());
    let session = service
        .login(&credentials)
        .with_context(|| format!("login as {}", login.username))?;
    Ok(session.token)
}

fn run_init(path: Option<&Path>, config: &AppConfig) -> Result<()> {
    println!("🗄️  Statement Ledger - init");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    if AppConfig::write_default(path)? {
        println!("✓ Wrote {}", path.display());
    } else {
        println!("✓ Config already exists: {}", path.display());
    }

    SqliteStore::open(&config.store.db_path, config.busy_timeout())
        .with_context(|| format!("create database {}", config.store.db_path.display()))?;
    println!("✓ Database ready at {} (WAL mode)", config.store.db_path.display());
    Ok(())
}

fn run_add_user(config: &AppConfig, login: &Login) -> Result<()> {
    let service = open_service(config)?;
    let user_id = service
        .authenticator()
        .register_user(&login.username, &login.password)?;
    println!("✓ Created user {} ({})", login.username, user_id);
    Ok(())
}

fn run_detect(config: &AppConfig, file: &Path, bank: Option<&str>) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("read {}", file.display()))?;
    let detector = DialectDetector::new(config.ingest.sample_rows, config.synonym_table(), BankRegistry::new());

    let dialect = detector.detect(&decode_upload(&bytes), bank)?;
    println!("📂 {}", file.display());
    println!("   {}", dialect.describe());
    println!(
        "   columns: date={} description={} amount={:?} debit={:?} credit={:?} balance={:?}",
        dialect.columns.date,
        dialect.columns.description,
        dialect.columns.amount,
        dialect.columns.debit,
        dialect.columns.credit,
        dialect.columns.balance,
    );
    Ok(())
}

fn run_import(config: &AppConfig, file: &Path, login: &Login, bank: Option<&str>) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());

    let service = open_service(config)?;
    let token = session(&service, login)?;

    println!("📂 Importing {}...", file.display());
    let summary = service.upload(&token, &filename, &bytes, bank)?;
    service.logout(&token);

    println!("   {}", summary.dialect);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Accepted:   {}", summary.accepted);
    println!("✓ Duplicates: {}", summary.duplicates);
    println!("✓ Rejected:   {}", summary.rejected.len());
    for rejected in &summary.rejected {
        println!("   line {}: {}", rejected.line, rejected.reason);
    }
    println!("   upload id: {}", summary.upload_id);
    Ok(())
}

fn run_list(config: &AppConfig, login: &Login, filter: &TransactionFilter) -> Result<()> {
    if let (Some(from), Some(to)) = (filter.from, filter.to) {
        if from > to {
            bail!("--from {} is after --to {}", from, to);
        }
    }

    let service = open_service(config)?;
    let token = session(&service, login)?;
    let transactions = service.list_transactions(&token, filter)?;
    service.logout(&token);

    for tx in &transactions {
        println!(
            "{}  {:>12}  {:<40}  {}",
            tx.date,
            tx.amount_display(),
            tx.description,
            tx.raw_balance.map(format_minor).unwrap_or_default()
        );
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let total: i64 = transactions.iter().map(|t| t.amount).sum();
    println!("{} transactions, net {}", transactions.len(), format_minor(total));
    Ok(())
}

fn run_uploads(config: &AppConfig, login: &Login) -> Result<()> {
    let service = open_service(config)?;
    let token = session(&service, login)?;
    let batches = service.list_uploads(&token)?;
    service.logout(&token);

    for batch in &batches {
        println!(
            "{}  {:<9}  {:<30}  rows={} accepted={} duplicates={} rejected={}",
            batch.timestamp.format("%Y-%m-%d %H:%M"),
            batch.status.as_str(),
            batch.source_filename,
            batch.row_count,
            batch.accepted_count,
            batch.duplicate_count,
            batch.rejected_count
        );
    }
    println!("{} uploads", batches.len());
    Ok(())
}
