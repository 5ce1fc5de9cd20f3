use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "extrato", about = "Import bank statements and card invoices into a local ledger.")]
pub struct Cli {
    /// SQLite database (default: the platform data directory)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
    /// Import configuration TOML
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import a CSV, OFX or PDF document.
    Import {
        /// Path to the document
        file: PathBuf,
        #[arg(long)]
        user: String,
        /// Account the rows belong to when the document does not say
        #[arg(long)]
        account: Option<String>,
        /// csv, ofx or pdf (default: from the file extension)
        #[arg(long = "type")]
        source_type: Option<String>,
        /// Map a label found in the document to an account: LABEL=ACCOUNT
        #[arg(long = "alias")]
        aliases: Vec<String>,
        /// Treat the document as a credit card invoice
        #[arg(long)]
        invoice: bool,
        /// Run every stage without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Print the report and row outcomes as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage categorization rules.
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// Add or replace a rule.
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        name: Option<String>,
        /// Interpret the pattern as a regular expression
        #[arg(long)]
        regex: bool,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        account: Option<String>,
        /// Inclusive lower bound on the absolute amount
        #[arg(long)]
        min: Option<String>,
        /// Inclusive upper bound on the absolute amount
        #[arg(long)]
        max: Option<String>,
    },
    /// Load `[[rules]]` tables from a TOML file.
    Load { file: PathBuf },
    List {
        #[arg(long)]
        user: String,
    },
    Delete {
        #[arg(long)]
        user: String,
        id: String,
    },
}

fn default_db_path() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("org", "extrato", "Extrato")
        .context("no home directory to place the database in")?;
    let data_dir = project_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    Ok(data_dir.join("ledger.db"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let config = commands::load_config(cli.config.as_deref())?;
    let store = commands::open_store(&db_path).await?;

    match cli.command {
        Commands::Import {
            file,
            user,
            account,
            source_type,
            aliases,
            invoice,
            dry_run,
            json,
        } => {
            let args = commands::ImportArgs {
                file,
                user,
                account,
                source_type,
                aliases,
                invoice,
                dry_run,
            };
            let outcome = commands::import(store, config, args).await?;
            commands::print_outcome(&outcome, json)
        }
        Commands::Rules { command } => match command {
            RulesCommands::Add {
                user,
                id,
                pattern,
                category,
                name,
                regex,
                priority,
                account,
                min,
                max,
            } => {
                let rule = commands::build_rule(commands::RuleArgs {
                    user,
                    id,
                    pattern,
                    category,
                    name,
                    regex,
                    priority,
                    account,
                    min,
                    max,
                })?;
                commands::add_rule(&store, &rule).await
            }
            RulesCommands::Load { file } => commands::load_rules(&store, &file).await,
            RulesCommands::List { user } => commands::list_rules(&store, &user).await,
            RulesCommands::Delete { user, id } => commands::delete_rule(&store, &user, &id).await,
        },
    }
}
