use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use orion::config::{self, Config};
use orion::embedding::{
    BuildReport, EmbeddingStore, ImageSearchService, QueryInput, QueryOutcome, SimilarityEngine,
};
use orion::model::{self, ImagePreprocessor};

mod cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let base_path = config::default_base_path()?;
    let mut config = Config::load_with(&base_path)
        .with_context(|| format!("failed to load config from {}", base_path.display()))?;

    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(dir) = args.embeddings_dir {
        config.embeddings_dir = Some(dir);
    }

    match args.command {
        cli::Command::Build {
            dataset,
            parallelism,
            no_progress,
        } => {
            let _span = tracing::info_span!("build", dataset = %dataset.display()).entered();

            let cancel = Arc::new(AtomicBool::new(false));
            let handler_flag = cancel.clone();
            ctrlc::set_handler(move || {
                log::warn!("Received interrupt, stopping after the current category");
                handler_flag.store(true, Ordering::Relaxed);
            })
            .context("failed to set Ctrl-C handler")?;

            let service = open_service(&config)?
                .with_cancel_flag(cancel)
                .with_parallelism(parallelism.unwrap_or_else(|| config.parallelism()));

            let progress = if no_progress {
                ProgressBar::hidden()
            } else {
                let bar = ProgressBar::new(0);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg:>12} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                        .progress_chars("=> "),
                );
                bar.enable_steady_tick(Duration::from_millis(200));
                bar
            };

            let report = service.build_database_with_progress(&dataset, progress.clone())?;
            progress.finish_and_clear();

            print_build_report(&report);
            if report.cancelled {
                println!("build cancelled; categories above were saved");
            }
        }

        cli::Command::Query {
            image,
            vector,
            k,
            json,
        } => {
            let k = k.unwrap_or(config.top_k);
            let outcome = match (&vector, &image) {
                (Some(vector), _) => SimilarityEngine::load(&open_store(&config)?)?.query(vector, k)?,
                (None, Some(image)) => {
                    open_service(&config)?.similarity_query(QueryInput::Image(image), k)?
                }
                (None, None) => anyhow::bail!("either an image or --vector is required"),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_query_outcome(&outcome);
            }
        }

        cli::Command::Classify { image, json } => {
            let classification = open_service(&config)?.classify(&image)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&classification)?);
            } else {
                match (classification.class_index, classification.confidence) {
                    (Some(index), Some(confidence)) => {
                        println!("class {} ({:.4})", index, confidence)
                    }
                    _ => println!(
                        "model '{}' has no classification head ({}-dim embedding)",
                        config.model, classification.dimensions
                    ),
                }
            }
        }

        cli::Command::Stats { json } => {
            let stats = open_store(&config)?.stats()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if stats.is_empty() {
                println!("no categories in {}", config.embeddings_dir().display());
            } else {
                for summary in &stats {
                    println!(
                        "{:<24} {:>8} items  {} dims",
                        summary.category, summary.items, summary.dimensions
                    );
                }
                let total: u64 = stats.iter().map(|s| s.items).sum();
                println!("{} categories, {} items", stats.len(), total);
            }
        }
    }

    Ok(())
}

/// Service with the configured model loaded, downloading weights if needed.
fn open_service(config: &Config) -> anyhow::Result<ImageSearchService> {
    let embedder = model::open_embedder(&config.model, config.models_dir(), config.image_size)
        .with_context(|| format!("failed to open model '{}'", config.model))?;
    let preprocessor = Arc::new(ImagePreprocessor::new(config.image_size));

    Ok(ImageSearchService::new(preprocessor, embedder, config.embeddings_dir()))
}

/// Database tagged with the configured model, without loading its weights.
fn open_store(config: &Config) -> anyhow::Result<EmbeddingStore> {
    let model_name = model::canonical_model_name(&config.model)?;
    Ok(EmbeddingStore::open(
        config.embeddings_dir(),
        model::model_id_hash(model_name),
    ))
}

fn print_build_report(report: &BuildReport) {
    for (category, result) in &report.categories {
        println!(
            "{:<24} {:>6} embedded {:>6} skipped",
            category, result.succeeded, result.skipped
        );
        for failure in &result.failures {
            println!("    {}: {}", failure.item, failure.reason);
        }
    }
    println!(
        "{} categories, {} embedded, {} skipped",
        report.categories.len(),
        report.total_succeeded(),
        report.total_skipped()
    );
}

fn print_query_outcome(outcome: &QueryOutcome) {
    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }

    if outcome.results.is_empty() {
        println!("no results ({} vectors searched)", outcome.eligible);
        return;
    }

    for (rank, result) in outcome.results.iter().enumerate() {
        println!(
            "{:>3}. {:.4}  {}/{}",
            rank + 1,
            result.score,
            result.category,
            result.item
        );
    }
}
