//! # Sapcite CLI (`sapcite`)
//!
//! Command-line front end for the retrieval pipeline: data directory
//! initialization, document ingestion, querying, and index rebuilds
//! from persisted chunk records.
//!
//! ## Usage
//!
//! ```bash
//! sapcite --config ./config/sapcite.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sapcite init` | Create the data directory and empty record file |
//! | `sapcite ingest <file.json>` | Ingest normalized documents from a JSON file |
//! | `sapcite query "<text>"` | Run the retrieval pipeline and print the context pack |
//! | `sapcite rebuild` | Rebuild both indexes from persisted chunk records |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest a batch of runbooks and specs
//! sapcite ingest ./docs/batch.json --config ./config/sapcite.toml
//!
//! # Query as a support user limited to internal material
//! sapcite query "VA01 pricing error" --role support --entitlement internal
//!
//! # Pin the target release; mismatched top hits get flagged
//! sapcite query "billing due list stuck" --release S4HANA_2023
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sapcite::config::load_config;
use sapcite::orchestrator::{DocumentInput, Orchestrator, QueryRequest};
use sapcite_core::models::{CallerRole, Classification, Entitlement};

/// Sapcite — grounded, citable retrieval over SAP technical
/// documentation.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file.
#[derive(Parser)]
#[command(
    name = "sapcite",
    about = "Grounded, citable retrieval over SAP technical documentation",
    version,
    long_about = "Sapcite ingests SAP-domain documents (ABAP source, specs, OSS notes, runbooks), \
    indexes chunks in dual lexical/vector structures, and answers queries with policy-gated, \
    reranked, guardrail-checked context packs for downstream answer generation."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sapcite.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and an empty record file.
    ///
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Ingest normalized documents from a JSON file.
    ///
    /// The file holds an array of document objects (id, source_uri,
    /// doc_type, release, modules, language, classification, body).
    /// Failures are per-document: a bad document is reported and the
    /// rest ingest normally.
    Ingest {
        /// Path to the JSON document batch.
        file: PathBuf,
    },

    /// Run a retrieval query and print the context pack.
    Query {
        /// The query text.
        text: String,

        /// Caller role: developer, functional, support, or unspecified.
        #[arg(long, default_value = "unspecified")]
        role: String,

        /// Maximum classification the caller may see: internal,
        /// confidential, or restricted.
        #[arg(long, default_value = "internal")]
        entitlement: String,

        /// Restrict to module scopes (repeatable, e.g. --module SD).
        #[arg(long = "module")]
        modules: Vec<String>,

        /// Target SAP release; mismatched top hits are downranked and
        /// flagged.
        #[arg(long)]
        release: Option<String>,

        /// Maximum number of passages to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Rebuild the store and both indexes from persisted chunk records.
    Rebuild,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(&config.data.dir).with_context(|| {
                format!("Failed to create data dir: {}", config.data.dir.display())
            })?;
            let records = config.data.dir.join("records.jsonl");
            if !records.exists() {
                std::fs::write(&records, "")?;
            }
            println!("initialized {}", config.data.dir.display());
            Ok(())
        }

        Commands::Ingest { file } => {
            let orchestrator = Orchestrator::new(config)?;
            // Warm the pipeline from any previous snapshot so ingest
            // accumulates instead of starting empty.
            if orchestrator.records_path().exists() {
                orchestrator.rebuild().ok();
            }
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let inputs: Vec<DocumentInput> = serde_json::from_str(&content)
                .with_context(|| "Failed to parse document batch JSON")?;

            let total = inputs.len();
            let mut ok = 0usize;
            let mut failed = 0usize;
            for input in inputs {
                let id = input.id.clone();
                match orchestrator.ingest(input).await {
                    Ok(report) => {
                        ok += 1;
                        if report.deduplicated {
                            println!("  {id}: duplicate content, canonical version kept");
                        } else {
                            println!(
                                "  {id}: {} chunks indexed, {} embedded, {} pending",
                                report.chunks_indexed,
                                report.embeddings_written,
                                report.embeddings_pending
                            );
                        }
                    }
                    Err(err) => {
                        failed += 1;
                        eprintln!("  {id}: rejected: {err}");
                    }
                }
            }
            orchestrator.persist()?;
            println!("ingest");
            println!("  documents: {total}");
            println!("  accepted: {ok}");
            println!("  rejected: {failed}");
            println!("ok");
            Ok(())
        }

        Commands::Query {
            text,
            role,
            entitlement,
            modules,
            release,
            limit,
        } => {
            let orchestrator = Orchestrator::new(config)?;
            if orchestrator.records_path().exists() {
                orchestrator.rebuild()?;
            }
            let request = QueryRequest {
                text,
                role: parse_role(&role)?,
                entitlement: Entitlement {
                    max_classification: parse_classification(&entitlement)?,
                    modules: if modules.is_empty() {
                        None
                    } else {
                        Some(modules.into_iter().collect())
                    },
                    jurisdictions: None,
                },
                target_release: release,
                limit,
            };
            let pack = orchestrator.query(request).await?;

            if pack.abstained {
                println!("abstained: insufficient evidence");
            }
            for passage in &pack.passages {
                println!(
                    "[{}] ({:.3}) {} / chunk {}{}",
                    passage.citation,
                    passage.relevance,
                    passage.chunk.document_id,
                    passage.chunk.chunk_index,
                    if passage.chunk.stale { " (stale)" } else { "" }
                );
                println!("    release: {}", passage.chunk.meta.release);
                let excerpt: String = passage.chunk.text.chars().take(200).collect();
                println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
            }
            let flags = &pack.flags;
            if flags.conflict_detected {
                println!("flag: conflicting claims detected, both sources retained");
            }
            if flags.release_mismatch {
                println!("flag: top source from a different release, downranked");
            }
            if flags.coverage_gap {
                println!("flag: no high-authority source in the final set");
            }
            println!("response: {}", pack.response_id);
            Ok(())
        }

        Commands::Rebuild => {
            let orchestrator = Orchestrator::new(config)?;
            let count = orchestrator.rebuild()?;
            println!("rebuilt indexes from {count} chunks");
            println!("ok");
            Ok(())
        }
    }
}

fn parse_role(value: &str) -> Result<CallerRole> {
    match value.to_lowercase().as_str() {
        "developer" => Ok(CallerRole::Developer),
        "functional" => Ok(CallerRole::Functional),
        "support" => Ok(CallerRole::Support),
        "unspecified" => Ok(CallerRole::Unspecified),
        other => anyhow::bail!(
            "Unknown role: '{}'. Use developer, functional, support, or unspecified.",
            other
        ),
    }
}

fn parse_classification(value: &str) -> Result<Classification> {
    match value.to_lowercase().as_str() {
        "internal" => Ok(Classification::Internal),
        "confidential" => Ok(Classification::Confidential),
        "restricted" => Ok(Classification::Restricted),
        other => anyhow::bail!(
            "Unknown classification: '{}'. Use internal, confidential, or restricted.",
            other
        ),
    }
}
