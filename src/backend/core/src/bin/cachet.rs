//! Cachet CLI - administrative commands against a live cache backend.
//!
//! Connects to the Redis instance named in the configuration and inspects
//! or flushes entries under the configured key prefix.

use anyhow::{bail, Context as _, Result};
use cachet_core::cache::{
    CacheManager, CacheWarmer, EventInvalidator, RedisBackend, RedisConfig, RequestContext,
};
use cachet_core::config::Settings;
use cachet_core::telemetry::init_logging;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "cachet",
    version,
    about = "Cachet - inspect and flush a tag-indexed cache",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CACHET_CONFIG")]
    config: Option<String>,

    /// Emit cache logs to stdout
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Count entries, tag indexes and locks under the prefix
    Stats,

    /// Show one cached entry
    Get {
        /// Logical key (without prefix)
        key: String,
    },

    /// Delete one key
    Delete {
        key: String,
    },

    /// Delete every key indexed under the given tags
    FlushTags {
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Delete every key matching a glob pattern
    FlushPattern {
        pattern: String,
    },

    /// Flush the entire backend database
    FlushAll {
        /// Confirm the flush
        #[arg(long)]
        yes: bool,
    },

    /// Apply the configured invalidation rules for a domain event
    Event {
        /// Event name from `invalidation_rules`
        name: String,

        /// Template parameter, repeatable (`--param id=42`)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Run every configured warm target once
    Warm,

    /// Check backend connectivity
    Ping,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Rows
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Tabled)]
struct KeyGroupRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Count")]
    count: usize,
}

#[derive(Debug, Serialize, Tabled)]
struct WarmRow {
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Result")]
    result: String,
}

#[derive(Debug, Serialize)]
struct EntryView {
    key: String,
    value: Value,
    tags: Vec<String>,
    ttl_secs: u64,
    remaining_secs: Option<u64>,
    created_at: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_success(&self, message: &str) {
        if self.is_json() {
            println!("{}", serde_json::json!({"status": "success", "message": message}));
        } else {
            println!("{} {}", "[OK]".green().bold(), message);
        }
    }

    fn print_error(&self, message: &str) {
        if self.is_json() {
            eprintln!("{}", serde_json::json!({"status": "error", "message": message}));
        } else {
            eprintln!("{} {}", "[ERROR]".red().bold(), message);
        }
    }

    fn print_warning(&self, message: &str) {
        if self.is_json() {
            println!("{}", serde_json::json!({"status": "warning", "message": message}));
        } else {
            println!("{} {}", "[WARN]".yellow().bold(), message);
        }
    }

    fn print_table<T: Tabled + Serialize>(&self, items: &[T]) -> Result<()> {
        if self.is_json() {
            return self.print_json(&items);
        }
        if items.is_empty() {
            println!("{}", "No results found.".dimmed());
            return Ok(());
        }
        let table = Table::new(items)
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::left()))
            .to_string();
        println!("{}", table);
        Ok(())
    }

    fn print_json<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        if !self.is_json() {
            println!();
            println!("{}", title.bold().underline());
            println!();
        }
    }

    fn print_key_value(&self, key: &str, value: &str) {
        if !self.is_json() {
            println!("  {}: {}", key.cyan(), value);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn connect(settings: &Settings) -> Result<Arc<CacheManager>> {
    let backend = RedisBackend::new(RedisConfig::from(&settings.redis))
        .await
        .with_context(|| format!("Failed to connect to {}", settings.redis.url))?;
    Ok(Arc::new(CacheManager::from_settings(Arc::new(backend), settings)))
}

async fn handle_stats(manager: &CacheManager, output: &OutputHelper) -> Result<()> {
    let namespace = manager.namespace();
    let keys = manager.backend().scan(&namespace.full_pattern("*")).await?;

    let tag_prefix = namespace.tag_key("");
    let lock_prefix = namespace.lock_key("");
    let tags = keys.iter().filter(|k| k.starts_with(&tag_prefix)).count();
    let locks = keys.iter().filter(|k| k.starts_with(&lock_prefix)).count();

    let rows = vec![
        KeyGroupRow { kind: "entries".into(), count: keys.len() - tags - locks },
        KeyGroupRow { kind: "tag indexes".into(), count: tags },
        KeyGroupRow { kind: "locks".into(), count: locks },
    ];

    output.print_header(&format!("Cache under '{}'", namespace.prefix()));
    output.print_table(&rows)
}

async fn handle_get(manager: &CacheManager, key: String, output: &OutputHelper) -> Result<()> {
    let Some(entry) = manager.get_entry::<Value>(&key).await else {
        bail!("Key '{}' not found", key);
    };

    let view = EntryView {
        remaining_secs: manager.ttl(&key).await.map(|d| d.as_secs()),
        key,
        value: entry.value,
        tags: entry.tags,
        ttl_secs: entry.ttl_secs,
        created_at: entry.created_at.to_rfc3339(),
    };

    if output.is_json() {
        return output.print_json(&view);
    }

    output.print_header(&view.key);
    output.print_key_value("Tags", &view.tags.join(", "));
    output.print_key_value("Created", &view.created_at);
    let expiry = match view.remaining_secs {
        Some(secs) => format!("{}s remaining of {}s", secs, view.ttl_secs),
        None => "never".to_string(),
    };
    output.print_key_value("Expires", &expiry);
    println!();
    println!("{}", serde_json::to_string_pretty(&view.value)?);
    Ok(())
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))
}

async fn handle_event(
    manager: Arc<CacheManager>,
    settings: &Settings,
    name: String,
    params: Vec<(String, String)>,
    output: &OutputHelper,
) -> Result<()> {
    let invalidator = EventInvalidator::from_settings(manager, settings);
    if !invalidator.events().any(|event| event == name) {
        let mut known: Vec<&str> = invalidator.events().collect();
        known.sort_unstable();
        bail!("No invalidation rules for '{}' (known: {})", name, known.join(", "));
    }

    let ctx = params
        .into_iter()
        .fold(RequestContext::new(), |ctx, (param, value)| ctx.with_param(&param, value));
    let removed = invalidator.on_event(&name, &ctx).await;
    output.print_success(&format!("Event '{}' removed {} key(s)", name, removed));
    Ok(())
}

async fn handle_warm(manager: Arc<CacheManager>, settings: &Settings, output: &OutputHelper) -> Result<()> {
    let warmer = CacheWarmer::from_settings(manager, &settings.warmer)?;
    if warmer.targets().is_empty() {
        output.print_warning("No warm targets configured");
        return Ok(());
    }

    let report = warmer.warm_all().await;
    if output.is_json() {
        return output.print_json(&report);
    }

    let rows: Vec<WarmRow> = report
        .results
        .iter()
        .map(|(target, ok)| WarmRow {
            target: target.clone(),
            result: if *ok { "ok".green().to_string() } else { "failed".red().to_string() },
        })
        .collect();
    output.print_table(&rows)?;

    let summary = format!(
        "{} succeeded, {} failed in {:?}",
        report.succeeded, report.failed, report.duration
    );
    if report.failed == 0 {
        output.print_success(&summary);
    } else {
        output.print_warning(&summary);
    }
    Ok(())
}

async fn run(cli: Cli, output: &OutputHelper) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::load()?,
    };

    if cli.verbose {
        init_logging(&settings.logging)?;
    }

    let manager = connect(&settings).await?;

    match cli.command {
        Commands::Stats => handle_stats(&manager, output).await,
        Commands::Get { key } => handle_get(&manager, key, output).await,
        Commands::Delete { key } => {
            if manager.delete(&key).await {
                output.print_success(&format!("Deleted '{}'", key));
            } else {
                output.print_warning(&format!("Key '{}' did not exist", key));
            }
            Ok(())
        }
        Commands::FlushTags { tags } => {
            let removed = manager.flush_tags(&tags).await;
            output.print_success(&format!("Removed {} key(s) tagged {}", removed, tags.join(", ")));
            Ok(())
        }
        Commands::FlushPattern { pattern } => {
            let removed = manager.flush_pattern(&pattern).await;
            output.print_success(&format!("Removed {} key(s) matching '{}'", removed, pattern));
            Ok(())
        }
        Commands::FlushAll { yes } => {
            if !yes {
                bail!("Refusing to flush the whole backend without --yes");
            }
            if !manager.flush_all().await {
                bail!("Flush failed; see logs with --verbose");
            }
            output.print_success("Backend flushed");
            Ok(())
        }
        Commands::Event { name, params } => handle_event(manager, &settings, name, params, output).await,
        Commands::Warm => handle_warm(manager, &settings, output).await,
        Commands::Ping => {
            let started = Instant::now();
            manager.backend().ping().await?;
            output.print_success(&format!(
                "{} reachable ({:.1} ms)",
                manager.backend().name(),
                started.elapsed().as_secs_f64() * 1000.0
            ));
            Ok(())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    if let Err(e) = run(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
