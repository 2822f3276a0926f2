//! Document extraction entry points.
//!
//! Every entry point funnels into the same run: pages are extracted
//! concurrently, folded into per-type buckets in page order, merged, and
//! transformed once into the canonical record. Per-page failures are kept
//! next to the successes; only document-wide failures return `Err`.

use crate::config::{ExtractionConfig, DEFAULT_TEXT_MODEL, DEFAULT_VISION_MODEL};
use crate::document::{DocumentType, ExtractionErrorRecord, FieldMap, PageExtraction, PageImage};
use crate::error::{PageError, PipelineError};
use crate::output::{ExtractionOutput, ExtractionStats, PipelineStage, RawExtraction};
use crate::pipeline::llm::{ModelService, ProviderService};
use crate::pipeline::{classify, input, merge, page, render, transform};
use crate::posting::{post_invoice, PostingConfig};
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extract a canonical record from a PDF file or URL.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(ExtractionOutput)` even if some pages failed
/// (check `output.raw_extraction.errors`).
///
/// # Errors
/// Returns `Err(PipelineError)` only for document-wide failures:
/// - File not found / download failed / not a PDF
/// - No page could be rasterised
/// - The transformation call failed or returned no JSON object
pub async fn extract_document(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, PipelineError> {
    let input_str = input_str.as_ref();
    info!("Starting extraction: {}", input_str);
    let total_start = Instant::now();

    let outcome: Result<ExtractionOutput, PipelineError> = async {
        let bytes = input::resolve_input(input_str, config.download_timeout_secs).await?;
        run_bytes(bytes, config, total_start).await
    }
    .await;
    report_failure(config, outcome)
}

/// Extract a canonical record from PDF bytes already in memory.
///
/// # Example
/// ```rust,no_run
/// use edgequake_invoice::{extract_from_bytes, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes: Vec<u8> = std::fs::read("invoice.pdf")?;
/// let output = extract_from_bytes(bytes, &ExtractionConfig::default()).await?;
/// println!("{}", serde_json::to_string_pretty(&output.final_output)?);
/// # Ok(())
/// # }
/// ```
pub async fn extract_from_bytes(
    bytes: Vec<u8>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, PipelineError> {
    let total_start = Instant::now();
    let outcome: Result<ExtractionOutput, PipelineError> = async {
        input::check_pdf_magic("<bytes>", &bytes)?;
        run_bytes(bytes, config, total_start).await
    }
    .await;
    report_failure(config, outcome)
}

/// Run the pipeline over pages rasterised by the caller.
///
/// Pages keep the `page_num` they carry; their order in `pages` does not
/// matter. Only the first `config.max_pages` by page number are used. An
/// empty list fails with [`PipelineError::NoPages`].
pub async fn extract_pages(
    mut pages: Vec<PageImage>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, PipelineError> {
    let total_start = Instant::now();
    pages.sort_by_key(|p| p.page_num);
    pages.truncate(config.max_pages);
    let outcome: Result<ExtractionOutput, PipelineError> = async {
        enter(config, PipelineStage::Start);
        let (vision, text) = resolve_services(config)?;
        run_pages(pages, vision, text, config, ExtractionStats::default(), total_start).await
    }
    .await;
    report_failure(config, outcome)
}

/// Extract and write the full output as pretty JSON.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn extract_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, PipelineError> {
    let output = extract_document(input_str, config).await?;
    write_output(&output, output_path.as_ref()).await?;
    Ok(output)
}

/// Extract, then hand the canonical record to the downstream backend.
///
/// A failed post never turns into `Err`; it is reported in
/// [`ExtractionOutput::posting`].
pub async fn extract_and_post(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
    posting: &PostingConfig,
) -> Result<ExtractionOutput, PipelineError> {
    let output = extract_document(input_str, config).await?;
    let report = post_invoice(&output.final_output, posting, &config.rules).await;
    Ok(output.with_posting(report))
}

/// Synchronous wrapper around [`extract_document`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_document(input_str, config))
}

/// Serialise `output` to `path` through a temp file.
pub async fn write_output(output: &ExtractionOutput, path: &Path) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(output)
        .map_err(|e| PipelineError::Internal(format!("Failed to serialise output: {}", e)))?;

    let write_err = |e: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn enter(config: &ExtractionConfig, stage: PipelineStage) {
    info!("Stage → {}", stage);
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage(stage);
    }
}

fn report_failure(
    config: &ExtractionConfig,
    outcome: Result<ExtractionOutput, PipelineError>,
) -> Result<ExtractionOutput, PipelineError> {
    if let Err(ref e) = outcome {
        warn!("Extraction failed: {}", e);
        enter(config, PipelineStage::Failed);
    }
    outcome
}

async fn run_bytes(
    bytes: Vec<u8>,
    config: &ExtractionConfig,
    total_start: Instant,
) -> Result<ExtractionOutput, PipelineError> {
    enter(config, PipelineStage::Start);

    // Resolve both services before paying for rasterisation.
    let (vision, text) = resolve_services(config)?;

    enter(config, PipelineStage::Rasterizing);
    let render_start = Instant::now();
    let pages = render::render_pages(bytes, config).await?;
    let stats = ExtractionStats {
        render_duration_ms: render_start.elapsed().as_millis() as u64,
        ..ExtractionStats::default()
    };
    info!("Rendered {} pages in {}ms", pages.len(), stats.render_duration_ms);

    run_pages(pages, vision, text, config, stats, total_start).await
}

async fn run_pages(
    pages: Vec<PageImage>,
    vision: Arc<dyn ModelService>,
    text: Arc<dyn ModelService>,
    config: &ExtractionConfig,
    mut stats: ExtractionStats,
    total_start: Instant,
) -> Result<ExtractionOutput, PipelineError> {
    if pages.is_empty() {
        return Err(PipelineError::NoPages);
    }
    let total_pages = pages.len();
    stats.total_pages = total_pages;

    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_start(total_pages);
    }

    // ── Extract ──────────────────────────────────────────────────────────
    enter(config, PipelineStage::Extracting);
    let extract_start = Instant::now();
    let mut results = extract_concurrent(&vision, &pages, config).await;
    results.sort_by_key(|(page_num, _)| *page_num);
    stats.extract_duration_ms = extract_start.elapsed().as_millis() as u64;
    drop(pages);

    // ── Bucket ───────────────────────────────────────────────────────────
    let mut raw = RawExtraction::default();
    let mut buckets: BTreeMap<DocumentType, Vec<FieldMap>> = BTreeMap::new();
    for (page_num, result) in results {
        match result {
            Ok(extraction) => {
                stats.extracted_pages += 1;
                stats.total_input_tokens += extraction.input_tokens as u64;
                stats.total_output_tokens += extraction.output_tokens as u64;
                match classify::classify(&extraction, &config.rules) {
                    Some(t) => buckets.entry(t).or_default().push(extraction.data),
                    None => raw.unclassified_pages.push(page_num),
                }
            }
            Err(e) => {
                warn!("Page {} failed: {}", page_num, e);
                raw.errors.push(ExtractionErrorRecord::from(&e));
            }
        }
    }
    stats.failed_pages = raw.errors.len();
    stats.unclassified_pages = raw.unclassified_pages.len();

    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_complete(total_pages, stats.extracted_pages);
    }

    // Every page failing still yields a record: the buckets stay null and
    // the page errors travel with the output.
    if !raw.errors.is_empty() {
        if stats.extracted_pages == 0 {
            warn!("All {} pages failed extraction", total_pages);
        }
        enter(config, PipelineStage::PartialFailure);
    }

    // ── Merge ────────────────────────────────────────────────────────────
    enter(config, PipelineStage::Merging);
    for t in DocumentType::ALL {
        let pages = buckets.remove(&t).unwrap_or_default();
        debug!("Bucket {}: {} pages", t, pages.len());
        let merged = merge::merge_pages(pages, &config.rules, config.conflict_policy.as_ref());
        raw.set_bucket(t, merged);
    }

    // ── Transform ────────────────────────────────────────────────────────
    enter(config, PipelineStage::Transforming);
    let transform_start = Instant::now();
    let (final_output, reply) = transform::transform(text.as_ref(), &raw, config).await?;
    stats.transform_duration_ms = transform_start.elapsed().as_millis() as u64;
    stats.total_input_tokens += reply.input_tokens as u64;
    stats.total_output_tokens += reply.output_tokens as u64;
    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    let stage = if raw.errors.is_empty() {
        PipelineStage::Done
    } else {
        PipelineStage::PartialFailure
    };
    enter(config, PipelineStage::Done);

    info!(
        "Extraction complete: {}/{} pages, {} failed, {} unclassified, {}ms total",
        stats.extracted_pages,
        total_pages,
        stats.failed_pages,
        stats.unclassified_pages,
        stats.total_duration_ms
    );

    Ok(ExtractionOutput {
        raw_extraction: raw,
        final_output,
        stage,
        stats,
        posting: None,
    })
}

/// Fan pages out to the vision service, at most `config.concurrency` at a time.
async fn extract_concurrent(
    vision: &Arc<dyn ModelService>,
    pages: &[PageImage],
    config: &ExtractionConfig,
) -> Vec<(usize, Result<PageExtraction, PageError>)> {
    let total_pages = pages.len();
    stream::iter(pages.iter().map(|page_image| {
        let vision = Arc::clone(vision);
        async move {
            let page_num = page_image.page_num;
            if let Some(ref cb) = config.progress_callback {
                cb.on_page_start(page_num, total_pages);
            }
            let result = page::extract_page(vision.as_ref(), page_image, config).await;
            if let Some(ref cb) = config.progress_callback {
                match &result {
                    Ok(e) => cb.on_page_complete(page_num, total_pages, &e.document_type),
                    Err(e) => cb.on_page_error(page_num, total_pages, &e.to_string()),
                }
            }
            (page_num, result)
        }
    }))
    .buffer_unordered(config.concurrency.max(1))
    .collect()
    .await
}

fn resolve_services(
    config: &ExtractionConfig,
) -> Result<(Arc<dyn ModelService>, Arc<dyn ModelService>), PipelineError> {
    let vision = match config.vision_service {
        Some(ref s) => Arc::clone(s),
        None => wrap(
            resolve_provider(
                config.vision_provider_name.as_deref(),
                config.vision_model.as_deref(),
                DEFAULT_VISION_MODEL,
            )?,
            config,
        ),
    };
    let text = match config.text_service {
        Some(ref s) => Arc::clone(s),
        None => wrap(
            resolve_provider(
                config.text_provider_name.as_deref(),
                config.text_model.as_deref(),
                DEFAULT_TEXT_MODEL,
            )?,
            config,
        ),
    };
    debug!("Vision service: {}, text service: {}", vision.name(), text.name());
    Ok((vision, text))
}

fn wrap(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Arc<dyn ModelService> {
    Arc::new(ProviderService::new(
        provider,
        config.temperature,
        config.max_tokens,
    ))
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve a provider, from most-specific to least-specific:
///
/// 1. Named provider + model from the config.
/// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set.
/// 3. OpenAI when `OPENAI_API_KEY` is present.
/// 4. [`ProviderFactory::from_env`] auto-detection.
///
/// Pre-built services are checked by the caller before this runs.
fn resolve_provider(
    name: Option<&str>,
    model: Option<&str>,
    default_model: &str,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(name) = name {
        return create_provider(name, model.unwrap_or(default_model));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model.unwrap_or(default_model));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
