mod cli;
mod output;

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rag_core::{
    build_index, check_matrix_dim, embed_and_index, embed_passages, evaluate_generation_with,
    evaluate_retrieval, load_embedder, load_generator, load_index_jsonl, nearest_neighbours,
    prepare_dataset, retriever_name, save_index_jsonl, EmbeddingProvider, EvaluationRun,
    PassagePool, RunConfig, VectorIndex,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{run_config, Cli, Commands};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Passage pool and index, either rebuilt from the dataset or read from a saved index file.
fn passage_index(
    index_file: Option<&Path>,
    pool: PassagePool,
    embedder: &dyn EmbeddingProvider,
    config: &RunConfig,
) -> Result<(PassagePool, Box<dyn VectorIndex>)> {
    match index_file {
        Some(path) => {
            let (pool, matrix) = load_index_jsonl(path)
                .with_context(|| format!("load passage index {}", path.display()))?;
            check_matrix_dim(&matrix, embedder.dim())?;
            let index = build_index(config.index, &matrix)?;
            Ok((pool, index))
        }
        None => {
            let (_, index) = embed_and_index(embedder, &pool, config).context("embed passages")?;
            Ok((pool, index))
        }
    }
}

fn start_run(config: &RunConfig, min_hit_rate: Option<f64>) -> EvaluationRun {
    let run_id = format!("eval-{}", chrono::Utc::now().timestamp_millis());
    EvaluationRun::start(
        run_id,
        config.dataset_path.display().to_string(),
        retriever_name(config),
        config.retrieval.top_k,
        min_hit_rate,
    )
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Embed {
            dataset,
            retriever,
            index_file,
        } => {
            let config = run_config(Some(dataset), retriever, None);
            config.validate()?;
            let data = prepare_dataset(&config).context("load dataset")?;
            let device = config.device.to_device()?;
            let embedder = load_embedder(&config, &device).context("load retriever")?;

            let matrix = embed_passages(&embedder, &data.pool.texts(), config.batch_size)
                .context("embed passages")?;
            save_index_jsonl(index_file, &data.pool, &matrix)
                .with_context(|| format!("write {}", index_file.display()))?;
            println!(
                "retriever={} passages={} dim={} output={}",
                retriever_name(&config),
                data.pool.len(),
                matrix.dim(),
                index_file.display()
            );
        }
        Commands::Eval {
            dataset,
            retriever,
            search,
            index_file,
            min_hit_rate,
            per_example,
        } => {
            let config = run_config(Some(dataset), retriever, Some(search));
            config.validate()?;
            let data = prepare_dataset(&config).context("load dataset")?;
            let mut run = start_run(&config, *min_hit_rate);

            let device = config.device.to_device()?;
            let embedder = match load_embedder(&config, &device) {
                Ok(embedder) => embedder,
                Err(err) => {
                    run.on_models_failed(err.to_string());
                    return Err(err).context("load retriever");
                }
            };
            run.on_models_ready();

            let (pool, index) =
                passage_index(index_file.as_deref(), data.pool, embedder.as_ref(), &config)?;
            let summary = evaluate_retrieval(
                &embedder,
                index.as_ref(),
                &pool,
                &data.examples,
                &config.retrieval,
            )?;
            run.on_eval_completed(&summary);
            info!(run_id = %run.run_id, status = ?run.status, "run finished");

            output::print_eval(&cli.output, &run, &summary, None, *per_example)?;
            if !run.meets_threshold() {
                bail!(
                    "hit rate {:.4} is below the required {:.4}",
                    summary.hit_rate,
                    min_hit_rate.unwrap_or_default()
                );
            }
        }
        Commands::Generate {
            dataset,
            retriever,
            search,
            generator,
            index_file,
        } => {
            let mut config = run_config(Some(dataset), retriever, Some(search));
            config.generator_model = Some(generator.generator_model.clone());
            config.generator_adapter = generator.generator_adapter.clone();
            config.validate()?;
            let sampling = generator.sampling();
            sampling.validate()?;

            let data = prepare_dataset(&config).context("load dataset")?;
            let mut run = start_run(&config, None);

            let device = config.device.to_device()?;
            let models = load_embedder(&config, &device)
                .context("load retriever")
                .and_then(|e| Ok((e, load_generator(&config, &device).context("load generator")?)));
            let (embedder, text_generator) = match models {
                Ok(models) => models,
                Err(err) => {
                    run.on_models_failed(format!("{err:#}"));
                    return Err(err);
                }
            };
            run.on_models_ready();

            let (pool, index) =
                passage_index(index_file.as_deref(), data.pool, embedder.as_ref(), &config)?;
            let retrieval = evaluate_retrieval(
                &embedder,
                index.as_ref(),
                &pool,
                &data.examples,
                &config.retrieval,
            )?;
            run.on_eval_completed(&retrieval);

            let generation = evaluate_generation_with(
                &retrieval,
                &pool,
                &data.examples,
                &text_generator,
                &sampling,
            )?;

            output::print_eval(&cli.output, &run, &retrieval, Some(&generation), false)?;
        }
        Commands::Query {
            retriever,
            search,
            index_file,
            question,
        } => {
            let config = run_config(None, retriever, Some(search));
            config.validate()?;
            let device = config.device.to_device()?;
            let embedder = load_embedder(&config, &device).context("load retriever")?;

            let (pool, matrix) = load_index_jsonl(index_file)
                .with_context(|| format!("load passage index {}", index_file.display()))?;
            check_matrix_dim(&matrix, embedder.dim())?;
            let index = build_index(config.index, &matrix)?;

            let query = embedder.embed(question)?;
            let hits = nearest_neighbours(index.as_ref(), &pool, &query, &config.retrieval)?;
            let rows: Vec<_> = hits
                .into_iter()
                .map(|r| {
                    let text = pool.get(r.passage_id).map(|p| p.text.as_str()).unwrap_or("");
                    (r, text)
                })
                .collect();
            output::print_query(&cli.output, question, &rows)?;
        }
    }

    Ok(())
}
