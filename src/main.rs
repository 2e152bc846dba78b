use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use loan_tape::calculated::parse_fragments;
use loan_tape::{
    load_rule_groups, ColumnFixRequest, Config, DebtSheetWorkflow, MetadataStore, NumericFix, PrepareOptions,
    RbiSelection, Rounding, RulePayload, SqliteStore, SystemColumn, TransactionWorkflow, VersionChainManager,
};

#[derive(Parser)]
#[command(name = "loan-tape", version, about = "Loan tape rule engine and version pipeline")]
struct Opts {
    /// TOML configuration; defaults apply when omitted
    #[arg(short, long, env = "LOAN_TAPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Exactly one of a project or a transaction
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct Owner {
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    transaction: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Register system columns from a JSON array of {column_name, datatype}
    ImportColumns {
        #[arg(long)]
        file: PathBuf,
    },
    /// Create a debt-sheet project from a CSV upload
    InitProject {
        #[arg(long)]
        name: String,
        #[arg(long)]
        file: PathBuf,
        /// JSON object mapping uploaded headers to system column names
        #[arg(long)]
        rename: Option<PathBuf>,
        #[arg(long)]
        drop_duplicates: bool,
    },
    /// Create a transaction from a CSV upload
    InitTransaction {
        #[arg(long)]
        name: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        rename: Option<PathBuf>,
        #[arg(long)]
        drop_duplicates: bool,
    },
    /// Copy the current dataset for per-column datatype fixes
    StartConversion {
        #[command(flatten)]
        owner: Owner,
    },
    /// Rewrite one column of the conversion copy
    FixColumn {
        #[command(flatten)]
        owner: Owner,
        #[arg(long)]
        column: String,
        /// Source date pattern such as "yyyy-mm-dd HH:MM:SS"
        #[arg(long, conflicts_with_all = ["numeric", "currency"])]
        date_format: Option<String>,
        #[arg(long, conflicts_with = "currency")]
        numeric: bool,
        #[arg(long)]
        currency: bool,
        #[arg(long)]
        int: bool,
        #[arg(long, value_parser = ["up", "down"])]
        round: Option<String>,
        /// Currency only: multiply and truncate to a whole number
        #[arg(long)]
        multiplier: Option<f64>,
    },
    /// Promote the conversion copy to the current dataset
    FinalizeConversion {
        #[command(flatten)]
        owner: Owner,
    },
    SplitTags {
        #[arg(long)]
        project: String,
    },
    /// Flag split partitions for the rule engine
    FlagTags {
        #[arg(long)]
        project: String,
        #[arg(long = "version", required = true)]
        versions: Vec<String>,
        #[arg(long)]
        unset: bool,
    },
    ApplyRules {
        #[arg(long)]
        project: String,
        #[arg(long)]
        rules: PathBuf,
    },
    Finalize {
        #[arg(long)]
        project: String,
    },
    Revert {
        #[arg(long)]
        project: String,
    },
    /// Start (or restart) the new column phase
    StartColumns {
        #[arg(long)]
        transaction: String,
    },
    AddColumn {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        rules: PathBuf,
    },
    FinalizeColumns {
        #[arg(long)]
        transaction: String,
    },
    /// Run the fixed RBI filter (all five rules unless --rule is given)
    RbiRules {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        cutoff: Option<String>,
        #[arg(long = "rule", value_parser = clap::value_parser!(u8).range(1..=5))]
        rules: Vec<u8>,
    },
    ChainRoot {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        rules: PathBuf,
        #[arg(long)]
        description: Option<String>,
    },
    ChainAppend {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        parent: String,
        #[arg(long)]
        rules: PathBuf,
        #[arg(long)]
        description: Option<String>,
    },
    ChainDelete {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        version: String,
        /// Remove only this version and reconnect its child
        #[arg(long)]
        keep_children: bool,
    },
    ChainList {
        #[arg(long)]
        transaction: String,
    },
    ChainShow {
        #[arg(long)]
        version: String,
    },
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &opts.config {
        Some(path) => Config::load(path).with_context(|| format!("load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(parent) = config.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("open metadata store {}", config.database_path.display()))?;

    run(opts.command, &store, &config)
}

fn run(command: Command, store: &SqliteStore, config: &Config) -> Result<()> {
    let debt_sheet = DebtSheetWorkflow::new(store, config);
    let transactions = TransactionWorkflow::new(store, config);

    match command {
        Command::ImportColumns { file } => {
            let columns: Vec<SystemColumn> = read_json(&file)?;
            for column in &columns {
                store.upsert_system_column(column)?;
            }
            print(&serde_json::json!({ "imported": columns.len() }))
        }
        Command::InitProject { name, file, rename, drop_duplicates } => {
            let options = prepare_options(rename.as_deref(), drop_duplicates)?;
            print(&debt_sheet.init_project(&name, &file, &options)?)
        }
        Command::InitTransaction { name, file, rename, drop_duplicates } => {
            let options = prepare_options(rename.as_deref(), drop_duplicates)?;
            print(&transactions.init_transaction(&name, &file, &options)?)
        }
        Command::StartConversion { owner } => {
            let version_id = match (owner.project, owner.transaction) {
                (Some(project), _) => debt_sheet.start_datatype_conversion(&project)?,
                (None, Some(transaction)) => transactions.start_datatype_conversion(&transaction)?,
                (None, None) => anyhow::bail!("--project or --transaction is required"),
            };
            print(&serde_json::json!({ "version_id": version_id }))
        }
        Command::FixColumn { owner, column, date_format, numeric, currency, int, round, multiplier } => {
            let fix = NumericFix {
                convert_to_int: int,
                rounding: round.map(|r| if r == "up" { Rounding::Up } else { Rounding::Down }),
                whole_number_multiplier: multiplier,
            };
            let request = match (date_format, numeric, currency) {
                (Some(source_format), _, _) => ColumnFixRequest::Date { source_format },
                (None, _, true) => ColumnFixRequest::Currency(fix),
                (None, true, false) => ColumnFixRequest::Numeric(fix),
                (None, false, false) => anyhow::bail!("pass --date-format, --numeric or --currency"),
            };
            let result = match (owner.project, owner.transaction) {
                (Some(project), _) => debt_sheet.fix_column(&project, &column, &request)?,
                (None, Some(transaction)) => transactions.fix_column(&transaction, &column, &request)?,
                (None, None) => anyhow::bail!("--project or --transaction is required"),
            };
            print(&result)
        }
        Command::FinalizeConversion { owner } => match (owner.project, owner.transaction) {
            (Some(project), _) => print(&debt_sheet.finalize_datatype_conversion(&project)?),
            (None, Some(transaction)) => print(&transactions.finalize_datatype_conversion(&transaction)?),
            (None, None) => anyhow::bail!("--project or --transaction is required"),
        },
        Command::SplitTags { project } => print(&debt_sheet.split_by_tags(&project)?),
        Command::FlagTags { project, versions, unset } => {
            let updated = debt_sheet.set_sent_for_rule_addition(&project, &versions, !unset)?;
            print(&serde_json::json!({ "updated": updated }))
        }
        Command::ApplyRules { project, rules } => {
            let payload = RulePayload::from_file(&rules)
                .with_context(|| format!("read rules from {}", rules.display()))?;
            print(&debt_sheet.apply_rules(&project, &payload)?)
        }
        Command::Finalize { project } => print(&debt_sheet.finalize_temp_versions(&project)?),
        Command::Revert { project } => print(&debt_sheet.revert_to_split_tags(&project)?),
        Command::StartColumns { transaction } => {
            let version_id = transactions.start_new_column_phase(&transaction)?;
            print(&serde_json::json!({ "version_id": version_id }))
        }
        Command::AddColumn { transaction, name, rules } => {
            let content = fs::read_to_string(&rules)
                .with_context(|| format!("read rules from {}", rules.display()))?;
            let fragments = parse_fragments(&content)?;
            print(&transactions.add_column_with_rules(&transaction, &name, &fragments)?)
        }
        Command::FinalizeColumns { transaction } => {
            let version_id = transactions.finalize_new_columns(&transaction)?;
            print(&serde_json::json!({ "version_id": version_id }))
        }
        Command::RbiRules { transaction, cutoff, rules } => {
            let selection = rbi_selection(cutoff, &rules);
            print(&transactions.apply_rbi_rules(&transaction, &selection)?)
        }
        Command::ChainRoot { transaction, rules, description } => {
            let groups = load_rule_groups(&rules)?;
            let chain = VersionChainManager::new(store, config, store.column_catalog()?);
            print(&chain.create_root(&transaction, &groups, description.as_deref())?)
        }
        Command::ChainAppend { transaction, parent, rules, description } => {
            let groups = load_rule_groups(&rules)?;
            let chain = VersionChainManager::new(store, config, store.column_catalog()?);
            print(&chain.append_child(&transaction, &parent, &groups, description.as_deref())?)
        }
        Command::ChainDelete { transaction, version, keep_children } => {
            let chain = VersionChainManager::new(store, config, store.column_catalog()?);
            print(&chain.delete(&transaction, &version, !keep_children)?)
        }
        Command::ChainList { transaction } => {
            let chain = VersionChainManager::new(store, config, store.column_catalog()?);
            print(&chain.list_rule_versions(&transaction)?)
        }
        Command::ChainShow { version } => {
            let chain = VersionChainManager::new(store, config, store.column_catalog()?);
            print(&chain.get_version_chain(&version)?)
        }
    }
}

fn prepare_options(rename: Option<&Path>, drop_duplicates: bool) -> Result<PrepareOptions> {
    let rename: BTreeMap<String, String> = match rename {
        Some(path) => read_json(path)?,
        None => BTreeMap::new(),
    };
    Ok(PrepareOptions { rename, drop_duplicates })
}

fn rbi_selection(cutoff: Option<String>, rules: &[u8]) -> RbiSelection {
    if rules.is_empty() {
        return RbiSelection {
            cutoff_date: cutoff,
            ..RbiSelection::all("")
        };
    }
    RbiSelection {
        duplicate_transaction_ids: rules.contains(&1),
        emi_seasoning: rules.contains(&2),
        near_maturity: rules.contains(&3),
        overdue: rules.contains(&4),
        restructured: rules.contains(&5),
        cutoff_date: cutoff,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
