//! Run the resolution pipeline from the command line.
//!
//! # Examples
//!
//! ```sh
//! # Create the schema and seed the default synonyms
//! zakazka seed
//!
//! # Resolve a message against the catalog
//! zakazka search "болт 8x30 дин 933 10шт" --org 1
//!
//! # Route intents only
//! zakazka route "добавь 3 мотка ниток белых, когда придет поролон?"
//!
//! # Run the fixed evaluation query set and dump a JSON report
//! zakazka eval --out report.json
//! ```

use clap::{Parser, Subcommand};
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;

use zakazka::prelude::*;
use zakazka::text::tokens::shorten;

/// B2B ordering assistant core: intent routing and product resolution.
#[derive(Parser)]
#[command(name = "zakazka", version)]
struct Cli {
    /// SQLite database path (defaults to $DATABASE_URL, then zakazka.db)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a free-form message to catalog candidates
    Search {
        /// The message text
        text: String,

        /// Organization id (overrides membership resolution)
        #[arg(long)]
        org: Option<i64>,

        /// User id (used to resolve the organization)
        #[arg(long)]
        user: Option<i64>,

        /// Maximum candidates to return
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Clarification page offset
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Disable the LLM rewrite stage
        #[arg(long)]
        no_llm_rewrite: bool,

        /// Disable the LLM normalize/narrow stage
        #[arg(long)]
        no_llm_narrow: bool,

        /// Disable the LLM rerank stage
        #[arg(long)]
        no_rerank: bool,

        /// Print the full response as JSON (including the trace)
        #[arg(long)]
        json: bool,
    },

    /// Route a message into intent actions
    Route {
        /// The message text
        text: String,

        /// Print the actions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the fixed fastener query set against the catalog
    Eval {
        /// Write the JSON report to this file
        #[arg(long)]
        out: Option<String>,
    },

    /// Create the schema and seed the default synonyms
    Seed,
}

/// The evaluation query set — realistic fastener requests that exercise
/// number filtering, sizes, DIN standards, and colors.
const EVAL_QUERIES: &[&str] = &[
    "болт 8x30 дин 933",
    "гайка м10",
    "шайба 12",
    "саморез 4.2x16",
    "шпилька м12х1000",
    "анкер 10x100",
    "дюбель 6x40",
    "шуруп 5x60 потай",
    "винт m6x20",
    "болт нерж м8х50",
    "шайба гровер 8",
    "болт 10x20 цинк",
    "анкеры клиновые 12x120",
    "саморезы по металлу 3.5x25",
    "гвозди 100",
    "винт din 912 m5x12",
    "шайба din 125 10",
    "болт мебельный 8x60",
    "болт 8х30",
    "болты 8x30 933",
    "шплинт 3x25",
    "шайба увеличенная 8",
    "заклепка 4x8",
    "перфолента 20x0.6",
    "саморез кровельный 5.5x32",
    "болт м16 933",
    "винт м3х8",
    "шайба плоская 6",
];

async fn run(cli: Cli) -> Result<(), String> {
    let settings = Settings::from_env();
    let db_path = cli.db.unwrap_or_else(|| settings.database_url.clone());
    let db = Db::open(&db_path)?;
    let cache = Cache::from_url(&settings.redis_url);
    let llm = LlmClient::from_settings(&settings, &cache);

    match cli.command {
        Command::Search {
            text,
            org,
            user,
            limit,
            offset,
            no_llm_rewrite,
            no_llm_narrow,
            no_rerank,
            json,
        } => {
            let mut request = SearchRequest::new(text)
                .with_limit(limit)
                .with_clarify_offset(offset);
            request.org_id = org;
            request.user_id = user;
            request.enable_llm_rewrite = !no_llm_rewrite;
            request.enable_llm_narrow = !no_llm_narrow;
            request.enable_rerank = !no_rerank;

            let response = run_search_pipeline(&db, &cache, &llm, &request).await;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&response)
                        .map_err(|e| format!("failed to serialize response: {e}"))?
                );
                return Ok(());
            }

            println!("decision: {}", response.decision.decision);
            for candidate in &response.results {
                println!(
                    "  [{:>6}] {:<52} {:>9.2} ₽  остаток {}",
                    candidate.id,
                    shorten(&candidate.title_ru, 52),
                    candidate.price,
                    candidate.stock_qty,
                );
            }
            if let Some(clarification) = &response.decision.clarification {
                println!("{}", clarification.question);
                for option in &clarification.options {
                    println!("  - {}", option.label);
                }
                if let Some(next) = clarification.next_offset {
                    println!("  … ещё {} (--offset {next})", clarification.total);
                }
            }
            Ok(())
        }

        Command::Route { text, json } => {
            let result = route_message(&llm, &text).await;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result)
                        .map_err(|e| format!("failed to serialize actions: {e}"))?
                );
                return Ok(());
            }
            for action in &result.actions {
                let mut line = format!("{:?}", action.kind);
                if let Some(core) = &action.query_core {
                    line.push_str(&format!("  {core}"));
                }
                if let Some(qty) = action.qty {
                    line.push_str(&format!("  qty={qty}"));
                }
                if let Some(unit) = &action.unit {
                    line.push_str(&format!(" {unit}"));
                }
                println!("{line}");
            }
            Ok(())
        }

        Command::Eval { out } => {
            let mut report = Vec::new();
            println!("{:<32} | {:>5} | {:<42} | top5", "query", "count", "top1");
            println!("{}", "-".repeat(100));
            for raw_query in EVAL_QUERIES {
                let response =
                    run_search_pipeline(&db, &cache, &llm, &SearchRequest::new(*raw_query)).await;
                let top1 = response
                    .results
                    .first()
                    .map(|c| c.title_ru.clone())
                    .unwrap_or_default();
                let top5: Vec<String> =
                    response.results.iter().map(|c| c.title_ru.clone()).collect();
                println!(
                    "{:<32} | {:>5} | {:<42} | {}",
                    shorten(raw_query, 32),
                    response.results.len(),
                    shorten(&top1, 42),
                    top5.iter()
                        .map(|t| shorten(t, 28))
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                report.push(serde_json::json!({
                    "raw_query": raw_query,
                    "decision": response.decision.decision,
                    "count": response.results.len(),
                    "top1": top1,
                    "top5": top5,
                }));
            }
            if let Some(path) = out {
                let body = serde_json::to_string_pretty(&report)
                    .map_err(|e| format!("failed to serialize report: {e}"))?;
                std::fs::write(&path, body)
                    .map_err(|e| format!("failed to write {path}: {e}"))?;
                println!("report written to {path}");
            }
            Ok(())
        }

        Command::Seed => {
            zakazka::search::synonyms::seed_default_aliases(&db, &cache).await?;
            println!("schema ready, default synonyms seeded at {db_path}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e}");
        process::exit(1);
    }
}
