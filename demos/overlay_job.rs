//! Runs an intersection job and an erase job over a small parcel layer and
//! prints the events each job emits.
//!
//! `RUST_LOG=overlay_engine=debug cargo run --example overlay_job` shows the
//! batch-level trace.

use anyhow::{bail, Context};
use geo::{polygon, Area, Geometry};
use overlay_engine::config::EngineConfig;
use overlay_engine::feature::{Feature, FeatureSet};
use overlay_engine::job::{JobController, JobEvent, JobOutcome, JobRequest};
use overlay_engine::telemetry;
use serde_json::json;

fn square(x: f64, y: f64, size: f64) -> Geometry<f64> {
    Geometry::Polygon(polygon![
        (x: x, y: y),
        (x: x + size, y: y),
        (x: x + size, y: y + size),
        (x: x, y: y + size),
    ])
}

fn parcels() -> FeatureSet {
    (0..6)
        .map(|i| {
            let x = (i % 3) as f64 * 2.0;
            let y = (i / 3) as f64 * 2.0;
            Feature::new(format!("parcel-{i}"), square(x, y, 1.5)).with_property("owner", json!(i))
        })
        .collect()
}

fn flood_zones() -> FeatureSet {
    vec![
        Feature::new("zone-a", square(1.0, -1.0, 2.0)),
        Feature::new("zone-b", square(3.5, 1.5, 3.0)),
    ]
    .into()
}

async fn run(controller: &JobController, operation: &str) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let request = JobRequest::new(parcels(), flood_zones(), operation, "parcels", "flood zones")
        .with_batch_size_hint(3);
    let handle = controller
        .submit(request, tx)
        .with_context(|| format!("submitting {operation} job"))?;

    println!("\n{operation} job {}", handle.id());
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::StateChanged { from, to, .. } => println!("  state   {from} -> {to}"),
                JobEvent::Progress(p) => println!(
                    "  progress {:>5.1}% ({}/{} pairs, {}/{} batches)",
                    p.percent, p.processed_pairs, p.total_pairs, p.completed_batches, p.total_batches
                ),
                _ => {}
            }
        }
    });

    let outcome = handle.wait().await?;
    printer.await?;

    match outcome {
        JobOutcome::Completed(done) => {
            for item in &done.results {
                println!(
                    "  {:<20} {} x {}  area {:.3}",
                    item.name.as_deref().unwrap_or("-"),
                    item.provenance.target_feature_id,
                    item.provenance.mask_feature_id,
                    item.geometry.unsigned_area()
                );
            }
            println!(
                "  {} results, {} pairs skipped, {} batches failed, {:.2}% success in {} ms",
                done.results.len(),
                done.skipped_pairs,
                done.failed_batch_count,
                done.statistics.success_rate,
                done.statistics.processing_time_ms
            );
            Ok(())
        }
        JobOutcome::Cancelled => bail!("{operation} job was cancelled"),
        JobOutcome::Failed(reason) => bail!("{operation} job failed: {reason}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("overlay_engine=info");

    let config = EngineConfig::from_env().context("reading OVERLAY_* environment")?;
    let controller = JobController::new(config);

    run(&controller, "intersection").await?;
    run(&controller, "erase").await?;

    match overlay_engine::metrics::gather_text() {
        Ok(text) => println!("\n{}", text.lines().filter(|l| l.starts_with("overlay_jobs_total")).collect::<Vec<_>>().join("\n")),
        Err(e) => eprintln!("metrics unavailable: {e}"),
    }
    Ok(())
}
