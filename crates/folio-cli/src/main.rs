//! CLI entry point for Folio.
//!
//! This binary provides the `folio` command: ask a question and stream the
//! cited answer, inspect or clear the answer cache, and check status.

mod cli;
mod helpers;

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use folio_search::{Answer, PipelineConfig, Priority, Query, ResponseCache, SearchPipeline};
use folio_store::{Database, ResponseStore};
use futures::StreamExt;
use tracing::info;

use crate::cli::{CacheAction, Cli, Commands};
use crate::helpers::{ENV_API_KEY, api_key, env_non_empty, init_tracing, load_config, unprinted_suffix};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Ask {
            query,
            context,
            priority,
            json,
        } => cmd_ask(config, query.join(" "), context, priority.into(), json).await,
        Commands::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats(&config).await,
            CacheAction::Clear => cmd_cache_clear(&config).await,
        },
        Commands::Status => cmd_status(&cli.config, &config).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: ask
// ---------------------------------------------------------------------------

async fn cmd_ask(
    config: PipelineConfig,
    text: String,
    context: Option<String>,
    priority: Priority,
    json: bool,
) -> Result<()> {
    let pipeline = SearchPipeline::open(config, api_key()?)
        .await
        .context("failed to start the search pipeline")?;

    let mut query = Query::new(text).with_priority(priority);
    if let Some(context) = context {
        query = query.with_context(context);
    }

    let mut stream = pipeline.stream_query(query);
    info!(query_id = %stream.query_id(), "query submitted");

    let mut stdout = std::io::stdout().lock();
    let mut printed = String::new();

    while let Some(item) = stream.next().await {
        let answer = item.context("query failed")?;

        if json {
            if answer.is_final {
                serde_json::to_writer_pretty(&mut stdout, &answer)?;
                writeln!(stdout)?;
            }
            continue;
        }

        match unprinted_suffix(&printed, &answer.text) {
            Some(suffix) => write!(stdout, "{suffix}")?,
            None => {
                writeln!(stdout, "\n[connection lost, restarting answer]")?;
                write!(stdout, "{}", answer.text)?;
            }
        }
        stdout.flush()?;
        printed.clone_from(&answer.text);

        if answer.is_final {
            print_sources(&mut stdout, &answer)?;
        }
    }

    Ok(())
}

fn print_sources(out: &mut impl Write, answer: &Answer) -> std::io::Result<()> {
    writeln!(out)?;
    writeln!(out)?;
    if !answer.citations.is_empty() {
        writeln!(out, "Sources:")?;
        for (i, citation) in answer.citations.iter().enumerate() {
            let link = citation.url.as_deref().unwrap_or(&citation.text);
            writeln!(
                out,
                "  [{}] {} ({}, credibility {:.2})",
                i + 1,
                link,
                citation.source,
                citation.credibility
            )?;
        }
    }
    writeln!(
        out,
        "model: {}  confidence: {:.2}{}",
        answer.model,
        answer.confidence,
        if answer.cached { "  (cached)" } else { "" }
    )
}

// ---------------------------------------------------------------------------
// Subcommand: cache
// ---------------------------------------------------------------------------

async fn open_cache(config: &PipelineConfig) -> Result<ResponseCache> {
    let db = Database::open_and_migrate(config.cache.path.clone())
        .await
        .with_context(|| format!("failed to open cache at {}", config.cache.path.display()))?;
    let cache = ResponseCache::open(
        ResponseStore::new(db),
        config.cache_ttl(),
        config.cache.max_entries,
    )
    .await?;
    Ok(cache)
}

async fn cmd_cache_stats(config: &PipelineConfig) -> Result<()> {
    let cache = open_cache(config).await?;
    println!("{}", cache.stats());
    Ok(())
}

async fn cmd_cache_clear(config: &PipelineConfig) -> Result<()> {
    let cache = open_cache(config).await?;
    let before = cache.stats().size;
    cache.clear().await.context("failed to clear cache")?;
    println!("cleared {before} cached answers");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: &Path, config: &PipelineConfig) -> Result<()> {
    println!();
    println!("  Folio Status");
    println!("  ============");
    println!();

    if config_path.exists() {
        println!("  Config:           OK ({})", config_path.display());
    } else {
        println!("  Config:           DEFAULTS ({} not found)", config_path.display());
    }

    match env_non_empty(ENV_API_KEY) {
        Some(_) => println!("  API key:          CONFIGURED"),
        None => println!("  API key:          NOT SET ({ENV_API_KEY})"),
    }

    println!("  Endpoint:         {}", config.provider.base_url);
    println!(
        "  Models:           {} / {}",
        config.provider.cheap_model, config.provider.premium_model
    );
    println!(
        "  Rate limit:       {} requests per {}s",
        config.rate_limit.capacity, config.rate_limit.window_secs
    );

    if !config.cache.persist {
        println!("  Cache:            MEMORY ONLY");
    } else if config.cache.path.exists() {
        let cache = open_cache(config).await?;
        println!(
            "  Cache:            OK ({}, {} answers)",
            config.cache.path.display(),
            cache.stats().size
        );
    } else {
        println!("  Cache:            EMPTY ({})", config.cache.path.display());
    }

    println!();
    Ok(())
}
