use std::io::{self, Write};

use anyhow::Result;
use rag_core::{EvaluationRun, GenerationSummary, RetrievalSummary, RetrievedPassage};
use serde::Serialize;

#[derive(Serialize)]
struct EvalReport<'a> {
    run: &'a EvaluationRun,
    retrieval: &'a RetrievalSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation: Option<&'a GenerationSummary>,
}

pub fn print_eval(
    format: &str,
    run: &EvaluationRun,
    retrieval: &RetrievalSummary,
    generation: Option<&GenerationSummary>,
    per_example: bool,
) -> Result<()> {
    if format == "json" {
        let report = EvalReport {
            run,
            retrieval,
            generation,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "run_id={} retriever={} status={:?} examples={} hits={} top_k={}",
        run.run_id, run.retriever, run.status, retrieval.total, retrieval.hits, retrieval.top_k
    )?;
    writeln!(out, "Recall: {:.4}", retrieval.recall)?;
    writeln!(out, "Precision: {:.4}", retrieval.precision)?;
    writeln!(out, "Hit Rate: {:.4}", retrieval.hit_rate)?;
    if let Some(required) = run.min_hit_rate {
        writeln!(
            out,
            "required_hit_rate={required:.4} meets_threshold={}",
            run.meets_threshold()
        )?;
    }

    if let Some(generation) = generation {
        writeln!(out, "Exact Match: {:.4}", generation.exact_match_rate)?;
        writeln!(out, "F1: {:.4}", generation.mean_f1)?;
    }

    if per_example {
        for o in &retrieval.outcomes {
            writeln!(
                out,
                "example={} hit={} precision={:.4} recall={:.4} retrieved=[{}] latency={:.1}ms",
                o.example,
                o.hit,
                o.precision,
                o.recall,
                labels(&o.retrieved),
                o.latency_ms
            )?;
        }
        if let Some(generation) = generation {
            for o in &generation.outcomes {
                writeln!(
                    out,
                    "example={} exact_match={} f1={:.4} answer={:?}",
                    o.example,
                    o.exact_match,
                    o.f1,
                    o.generated.first().map(String::as_str).unwrap_or("")
                )?;
            }
        }
    }

    let total_ms = retrieval.total_latency_ms();
    let avg_ms = total_ms / retrieval.outcomes.len().max(1) as f64;
    writeln!(out, "total_latency={total_ms:.1}ms avg_latency={avg_ms:.1}ms")?;
    Ok(())
}

pub fn print_query(
    format: &str,
    question: &str,
    results: &[(RetrievedPassage, &str)],
) -> Result<()> {
    if format == "json" {
        let rows: Vec<_> = results
            .iter()
            .map(|(r, text)| {
                serde_json::json!({
                    "passage_id": r.passage_id,
                    "label": r.label,
                    "score": r.score,
                    "text": text,
                })
            })
            .collect();
        let doc = serde_json::json!({ "question": question, "results": rows });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let mut out = io::stdout().lock();
    for (rank, (r, text)) in results.iter().enumerate() {
        writeln!(
            out,
            "rank={} score={:.4} passage_id={} label={} text={:?}",
            rank + 1,
            r.score,
            r.passage_id,
            r.label,
            text
        )?;
    }
    Ok(())
}

fn labels(retrieved: &[RetrievedPassage]) -> String {
    retrieved
        .iter()
        .map(|r| format!("{}:{:.3}", r.label, r.score))
        .collect::<Vec<_>>()
        .join(", ")
}
