//! Command-line surface.

pub mod formatting;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::context::RunContext;
use crate::extract::{ExtractFilter, ParallelOptions};
use crate::migration::MigrationOptions;
use crate::persistence::LocalStore;
use crate::pipeline::{self, ids_from_text, Pipeline, WorkList};
use crate::types::EntityKind;

#[derive(Debug, Parser)]
#[command(
    name = "unthread-sync",
    version,
    about = "Extract, classify and sync Unthread support conversations"
)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch records from the API into the local store
    Extract(ExtractArgs),
    /// Classify stored conversations
    Resolve(ResolveArgs),
    /// Write pending classifications back to the API
    Push(PushArgs),
    /// Extract conversations, resolve, then push
    Run(WindowArgs),
    /// Rewrite the migration-category field of classified conversations
    MigrateCategories(MigrateArgs),
    /// Remove conversations from automatic processing
    Exclude {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clear the sync mark so conversations are pushed again
    ResetSync {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show store counts by lifecycle state and provenance
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExtractTarget {
    Users,
    Customers,
    Conversations,
    All,
}

impl ExtractTarget {
    pub fn kinds(&self) -> Vec<EntityKind> {
        match self {
            ExtractTarget::Users => vec![EntityKind::Users],
            ExtractTarget::Customers => vec![EntityKind::Customers],
            ExtractTarget::Conversations => vec![EntityKind::Conversations],
            ExtractTarget::All => vec![
                EntityKind::Users,
                EntityKind::Customers,
                EntityKind::Conversations,
            ],
        }
    }
}

/// Date window and parallelism shared by `extract` and `run`.
#[derive(Debug, Clone, Args)]
pub struct WindowArgs {
    #[arg(long)]
    pub conversation_id: Option<String>,
    /// First day to fetch (YYYY-MM-DD, inclusive)
    #[arg(long, value_parser = parse_date)]
    pub start_date: Option<NaiveDate>,
    /// Last day to fetch (YYYY-MM-DD, inclusive)
    #[arg(long, value_parser = parse_date)]
    pub end_date: Option<NaiveDate>,
    #[arg(long)]
    pub parallel: bool,
    #[arg(long)]
    pub max_workers: Option<usize>,
    /// Days per worker chunk
    #[arg(long)]
    pub batch_size: Option<usize>,
}

impl WindowArgs {
    pub fn filter(&self) -> Result<ExtractFilter> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                bail!("--start-date {} is after --end-date {}", start, end);
            }
        }
        Ok(ExtractFilter {
            ids: self.conversation_id.iter().cloned().collect(),
            start_date: self.start_date,
            end_date: self.end_date,
        })
    }

    pub fn parallel(&self, config: &AppConfig) -> ParallelOptions {
        ParallelOptions {
            enabled: self.parallel || config.extract.parallel,
            max_workers: self.max_workers.unwrap_or(config.extract.max_workers),
            batch_size: self.batch_size.unwrap_or(config.extract.batch_size),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ExtractArgs {
    #[arg(value_enum)]
    pub target: ExtractTarget,
    #[command(flatten)]
    pub window: WindowArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ResolveArgs {
    /// Conversation id to resolve (repeatable)
    #[arg(long = "id")]
    pub ids: Vec<String>,
    /// Resolve every UUID found in this file
    #[arg(long)]
    pub ids_file: Option<PathBuf>,
    #[arg(long)]
    pub limit: Option<usize>,
    /// Include conversations that already have a classification
    #[arg(long)]
    pub recheck: bool,
}

impl ResolveArgs {
    pub fn work_list(&self) -> Result<WorkList> {
        let mut ids = self.ids.clone();
        if let Some(path) = &self.ids_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading ids from {}", path.display()))?;
            ids.extend(ids_from_text(&text)?);
        }
        if !ids.is_empty() {
            if let Some(limit) = self.limit {
                ids.truncate(limit);
            }
            return Ok(WorkList::Explicit(ids));
        }
        Ok(if self.recheck {
            WorkList::All { limit: self.limit }
        } else {
            WorkList::Unclassified { limit: self.limit }
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct PushArgs {
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Log the merged payloads without sending them
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct MigrateArgs {
    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,
    /// Stop after this many conversations
    #[arg(long)]
    pub max: Option<usize>,
    #[arg(long = "id")]
    pub ids: Vec<String>,
    #[arg(long)]
    pub dry_run: bool,
}

impl MigrateArgs {
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            batch_size: self.batch_size,
            max: self.max,
            ids: self.ids.clone(),
            dry_run: self.dry_run,
        }
    }
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD, got '{}': {}", value, e))
}

impl Cli {
    /// Load, override and validate the configuration for this invocation.
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load_from_file(path)?,
            None => AppConfig::load()?,
        };
        config.apply_env_overrides();
        if let Some(level) = &self.log_level {
            config.logging.level = level.to_lowercase();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Execute one command against the given configuration.
pub async fn execute(command: Command, config: AppConfig) -> Result<()> {
    let store = LocalStore::new(&config.database.path)
        .with_context(|| format!("opening store at {}", config.database.path.display()))?;

    match command {
        Command::Status => {
            let report = pipeline::status(&store)?;
            println!("{}", formatting::render_status(&report));
        }
        Command::Exclude { ids, reason } => {
            for id in &ids {
                store.exclude(id, reason.as_deref())?;
            }
            info!(count = ids.len(), "excluded conversations");
            println!("{}", formatting::render_list("Excluded", ids));
        }
        Command::ResetSync { ids } => {
            let mut reset = Vec::new();
            for id in &ids {
                if store.reset_sync(id)? {
                    reset.push(id.clone());
                } else {
                    reset.push(format!("{} (no classification)", id));
                }
            }
            println!("{}", formatting::render_list("Reset for re-sync", reset));
        }
        Command::Extract(args) => {
            let filter = args.window.filter()?;
            let parallel = args.window.parallel(&config);
            let pipeline = Pipeline::from_config(config, store, false)?;
            let ctx = Arc::new(RunContext::new());
            let report = pipeline
                .extract(ctx.clone(), &args.target.kinds(), &filter, parallel)
                .await?;
            println!("{}", formatting::render_extraction(&report));
        }
        Command::Resolve(args) => {
            let source = args.work_list()?;
            let pipeline = Pipeline::from_config(config, store, true)?;
            let ctx = RunContext::new();
            let summary = pipeline.resolve(&ctx, &source).await?;
            println!("{}", formatting::render_resolution(&summary));
        }
        Command::Push(args) => {
            let pipeline = Pipeline::from_config(config, store, false)?;
            let ctx = RunContext::new();
            let summary = pipeline.push(&ctx, args.batch_size, args.dry_run).await?;
            println!("{}", formatting::render_push("Push", &summary));
        }
        Command::Run(window) => {
            let filter = window.filter()?;
            let parallel = window.parallel(&config);
            let pipeline = Pipeline::from_config(config, store, true)?;
            let summary = pipeline.run(Arc::new(RunContext::new()), &filter, parallel).await?;
            println!("{}", formatting::render_run(&summary));
        }
        Command::MigrateCategories(args) => {
            let pipeline = Pipeline::from_config(config, store, false)?;
            let ctx = RunContext::new();
            let summary = pipeline.migrate_categories(&ctx, &args.options()).await?;
            println!("{}", formatting::render_push("Migration categories", &summary));
        }
    }
    Ok(())
}
