mod config;
mod records;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use facemark_core::{FaceEncoding, FacePipeline, Normalizer, WatermarkSpec};
use records::{PhotoRecord, WATERMARK_SUFFIX};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "facemark", about = "Face-indexed photo watermarking and search")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Orient and downscale a photo, writing it as PNG
    Normalize {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the face descriptor of a photo
    Encode {
        input: PathBuf,
    },
    /// Write a face-safe watermarked JPEG
    Watermark {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Watermark text (overrides config)
        #[arg(long)]
        text: Option<String>,
    },
    /// Watermark and index every photo in a directory
    Ingest {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Concurrent workers (defaults to available parallelism)
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Find indexed photos showing the face in a probe photo
    Search {
        probe: PathBuf,
        /// Directory of records written by `ingest`
        #[arg(short, long)]
        index: PathBuf,
        /// Maximum descriptor distance (overrides config)
        #[arg(short, long)]
        threshold: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Normalize { input, output } => {
            let bytes = read_photo(&input)?;
            let image = Normalizer::new(config.normalizer.clone()).normalize(&bytes)?;
            image
                .raster()
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "{}",
                json!({ "width": image.width(), "height": image.height(), "output": output })
            );
        }
        Commands::Encode { input } => {
            let pipeline = load_pipeline(&config)?;
            let bytes = read_photo(&input)?;
            let report = pipeline.encode_face_with_report(&bytes)?;
            let body = match &report.encoding {
                FaceEncoding::Found(d) => json!({ "outcome": "found", "descriptor": d }),
                FaceEncoding::NoFaceDetected => json!({ "outcome": "no_face" }),
                FaceEncoding::EncodingFailed { reason } => {
                    json!({ "outcome": "encoding_failed", "reason": reason })
                }
            };
            println!(
                "{}",
                json!({
                    "width": report.width,
                    "height": report.height,
                    "faces": report.faces,
                    "encoding": body,
                })
            );
        }
        Commands::Watermark {
            input,
            output,
            text,
        } => {
            if let Some(text) = text {
                config.watermark.text = text;
            }
            let pipeline = load_pipeline(&config)?;
            let bytes = read_photo(&input)?;
            let jpeg = pipeline.watermark(&bytes, &config.watermark)?;
            std::fs::write(&output, jpeg).with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(output = %output.display(), "watermark written");
        }
        Commands::Ingest {
            input,
            output,
            jobs,
        } => {
            if jobs.is_some() {
                config.jobs = jobs;
            }
            let pipeline = Arc::new(load_pipeline(&config)?);
            std::fs::create_dir_all(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            let summary = ingest_dir(
                pipeline,
                Arc::new(config.watermark.clone()),
                &input,
                &output,
                config.jobs(),
            )
            .await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Search {
            probe,
            index,
            threshold,
        } => {
            let Some(threshold) = threshold.or(config.match_threshold) else {
                bail!("no match threshold: pass --threshold or set FACEMARK_MATCH_THRESHOLD");
            };
            let pipeline = load_pipeline(&config)?;
            let bytes = read_photo(&probe)?;
            let descriptor = match pipeline.encode_face(&bytes)? {
                FaceEncoding::Found(d) => d,
                FaceEncoding::NoFaceDetected => bail!("no face detected in {}", probe.display()),
                FaceEncoding::EncodingFailed { reason } => {
                    bail!("could not encode {}: {reason}", probe.display())
                }
            };

            let candidates: Vec<_> = records::load_records(&index)?
                .into_iter()
                .filter_map(PhotoRecord::into_candidate)
                .collect();
            let matches = pipeline.search(&descriptor, &candidates, threshold);
            tracing::info!(
                candidates = candidates.len(),
                matches = matches.len(),
                threshold,
                "search complete"
            );
            println!("{}", serde_json::to_string_pretty(&json!({ "matches": matches }))?);
        }
    }

    Ok(())
}

fn load_pipeline(config: &Config) -> Result<FacePipeline> {
    FacePipeline::load(&config.model_paths(), &config.pipeline_config())
        .context("face pipeline unavailable (set FACEMARK_MODEL_DIR or model_dir)")
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

#[derive(Debug, Default, serde::Serialize)]
struct IngestSummary {
    ingested: usize,
    with_face: usize,
    without_face: usize,
    encoding_failed: usize,
    rejected: usize,
}

/// Ingest every source photo in `input`, at most `jobs` at a time.
///
/// A photo that cannot be decoded or written is logged and counted as
/// rejected; it never aborts the batch.
async fn ingest_dir(
    pipeline: Arc<FacePipeline>,
    spec: Arc<WatermarkSpec>,
    input: &Path,
    output: &Path,
    jobs: usize,
) -> Result<IngestSummary> {
    let photos = records::source_photos(input)?;
    tracing::info!(photos = photos.len(), jobs, "ingesting");

    let permits = Arc::new(Semaphore::new(jobs));
    let mut tasks = JoinSet::new();
    for (id, source) in photos {
        let permit = permits.clone().acquire_owned().await?;
        let pipeline = pipeline.clone();
        let spec = spec.clone();
        let output = output.to_path_buf();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let result = ingest_one(&pipeline, &spec, id, &source, &output);
            (source, result)
        });
    }

    let mut summary = IngestSummary::default();
    while let Some(joined) = tasks.join_next().await {
        let (source, result) = joined?;
        match result {
            Ok(record) => {
                summary.ingested += 1;
                match record.outcome {
                    records::Outcome::Found => summary.with_face += 1,
                    records::Outcome::NoFace => summary.without_face += 1,
                    records::Outcome::EncodingFailed => summary.encoding_failed += 1,
                }
            }
            Err(e) => {
                tracing::warn!(source = %source.display(), error = %format!("{e:#}"), "photo rejected");
                summary.rejected += 1;
            }
        }
    }
    Ok(summary)
}

fn ingest_one(
    pipeline: &FacePipeline,
    spec: &WatermarkSpec,
    id: String,
    source: &Path,
    output: &Path,
) -> Result<PhotoRecord> {
    let bytes = read_photo(source)?;
    let ingested = pipeline.ingest(&bytes, spec)?;

    let watermarked = output.join(format!("{id}{WATERMARK_SUFFIX}"));
    std::fs::write(&watermarked, &ingested.watermarked)
        .with_context(|| format!("writing {}", watermarked.display()))?;

    let record = PhotoRecord::new(
        id,
        source.to_path_buf(),
        watermarked,
        ingested.width,
        ingested.height,
        ingested.encoding,
    );
    record.save(output)?;
    tracing::debug!(id = %record.id, outcome = ?record.outcome, "photo ingested");
    Ok(record)
}
