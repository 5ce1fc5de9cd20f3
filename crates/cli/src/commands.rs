use anyhow::{bail, Context, Result};
use extrato_core::{AccountId, CategorizationRule, CategoryId, DocumentType, RuleMatchType, UserId};
use extrato_import::{parse_money, ImportConfig, ImportOutcome, ImportPipeline, ImportRequest, RuleSet};
use extrato_storage::{
    create_db, delete_categorization_rule, get_categorization_rules, save_categorization_rule,
    SqliteStore,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ImportArgs {
    pub file: PathBuf,
    pub user: String,
    pub account: Option<String>,
    pub source_type: Option<String>,
    pub aliases: Vec<String>,
    pub invoice: bool,
    pub dry_run: bool,
}

pub struct RuleArgs {
    pub user: String,
    pub id: String,
    pub pattern: String,
    pub category: String,
    pub name: Option<String>,
    pub regex: bool,
    pub priority: i32,
    pub account: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
}

pub fn load_config(path: Option<&Path>) -> Result<ImportConfig> {
    match path {
        Some(path) => ImportConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ImportConfig::default()),
    }
}

pub async fn open_store(path: &Path) -> Result<SqliteStore> {
    let pool = create_db(path)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    Ok(SqliteStore::new(pool))
}

/// `csv`, `ofx`/`qfx` or `pdf`, from the file extension.
fn infer_source_type(file: &Path) -> Result<String> {
    match file.extension().and_then(|e| e.to_str()) {
        Some(ext) => Ok(ext.to_lowercase()),
        None => bail!("cannot tell the format of {}; pass --type", file.display()),
    }
}

fn parse_alias(raw: &str) -> Result<(String, AccountId)> {
    match raw.split_once('=') {
        Some((label, account)) if !label.trim().is_empty() && !account.trim().is_empty() => {
            Ok((label.trim().to_string(), AccountId::from(account.trim())))
        }
        _ => bail!("alias must look like LABEL=ACCOUNT, got '{raw}'"),
    }
}

pub async fn import(store: SqliteStore, config: ImportConfig, args: ImportArgs) -> Result<ImportOutcome> {
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let source_type = match args.source_type {
        Some(t) => t,
        None => infer_source_type(&args.file)?,
    };

    let mut request = ImportRequest::new(UserId::new(args.user), &source_type, bytes);
    request.document.hint.file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    if let Some(account) = args.account {
        request = request.with_account(AccountId::new(account));
    }
    if args.invoice {
        request.document.hint.document_type = Some(DocumentType::CreditCardInvoice);
    }
    for raw in &args.aliases {
        let (label, account) = parse_alias(raw)?;
        request.account_aliases.insert(label, account);
    }

    info!(
        file = %args.file.display(),
        source_type = %source_type,
        aliases = request.account_aliases.len(),
        dry_run = args.dry_run,
        "Importing statement"
    );
    let pipeline = ImportPipeline::new(store.clone(), store, config);
    let outcome = if args.dry_run {
        pipeline.preview(request).await?
    } else {
        pipeline.run(request).await?
    };
    debug!(
        imported = outcome.report.imported,
        duplicates = outcome.report.duplicates,
        committed = outcome.committed,
        "Import finished"
    );
    Ok(outcome)
}

pub fn print_outcome(outcome: &ImportOutcome, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "committed": outcome.committed,
            "classification": outcome.classification,
            "report": outcome.report,
            "rows": outcome.rows,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let r = &outcome.report;
    let c = &outcome.classification;
    println!(
        "{} from {} (confidence {:.2})",
        c.document_type, c.issuer_profile, c.confidence
    );
    println!(
        "{} rows: {} imported, {} duplicates, {} skipped, {} invalid, {} errors, {} ignored",
        r.total_rows, r.imported, r.duplicates, r.skipped, r.invalid_rows, r.error_rows, r.ignored_rows
    );
    if r.transfer_created > 0 || r.card_payment_not_converted > 0 {
        println!(
            "{} transfers linked ({} card payments), {} card payments without a counterpart",
            r.transfer_created, r.card_payment_detected, r.card_payment_not_converted
        );
    }
    for row in outcome.rows.iter().filter(|row| row.message.is_some()) {
        println!(
            "  line {:>4}  {:<9} {}",
            row.line,
            row.status,
            row.message.as_deref().unwrap_or_default()
        );
    }
    if !outcome.committed {
        println!("dry run: nothing was written");
    }
    Ok(())
}

pub fn build_rule(args: RuleArgs) -> Result<CategorizationRule> {
    let bound = |raw: Option<String>| -> Result<_> {
        raw.map(|s| parse_money(&s).with_context(|| format!("invalid amount '{s}'")))
            .transpose()
    };
    Ok(CategorizationRule {
        name: args.name.unwrap_or_else(|| args.pattern.clone()),
        id: args.id,
        user_id: UserId::new(args.user),
        priority: args.priority,
        enabled: true,
        match_type: if args.regex {
            RuleMatchType::Regex
        } else {
            RuleMatchType::Contains
        },
        pattern: args.pattern,
        account_id: args.account.map(AccountId::new),
        min_amount: bound(args.min)?,
        max_amount: bound(args.max)?,
        category_id: CategoryId::new(args.category),
    })
}

pub async fn add_rule(store: &SqliteStore, rule: &CategorizationRule) -> Result<()> {
    save_categorization_rule(store.pool(), rule).await?;
    println!("saved rule {}", rule.id);
    Ok(())
}

pub async fn load_rules(store: &SqliteStore, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let set = RuleSet::from_toml(&content)?;
    info!(file = %file.display(), rules = set.rules.len(), "Loading rules");
    for rule in &set.rules {
        debug!(rule = %rule.id, user = %rule.user_id, "Saving rule");
        save_categorization_rule(store.pool(), rule).await?;
    }
    println!("saved {} rules", set.rules.len());
    Ok(())
}

pub async fn list_rules(store: &SqliteStore, user: &str) -> Result<()> {
    let rules = get_categorization_rules(store.pool(), &UserId::from(user)).await?;
    if rules.is_empty() {
        println!("no rules");
    }
    for rule in rules {
        println!(
            "{:>4}  {:<12} {:<8} {:<30} -> {}{}",
            rule.priority,
            rule.id,
            rule.match_type.as_str(),
            rule.pattern,
            rule.category_id,
            if rule.enabled { "" } else { "  (disabled)" }
        );
    }
    Ok(())
}

pub async fn delete_rule(store: &SqliteStore, user: &str, id: &str) -> Result<()> {
    if delete_categorization_rule(store.pool(), &UserId::from(user), id).await? {
        println!("deleted rule {id}");
        Ok(())
    } else {
        bail!("no rule '{id}' for user '{user}'")
    }
}
