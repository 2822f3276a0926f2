//! CLI binary for edgequake-invoice.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints the resulting JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_invoice::extract::write_output;
use edgequake_invoice::{
    extract_document, post_invoice, ExtractionConfig, ExtractionProgressCallback, PipelineStage,
    PostingConfig, ProgressCallback, RuleTables,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Pages may finish out of
/// order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .map(|mut m| m.remove(&page_num))
            .ok()
            .flatten()
            .map(|t| t.elapsed().as_millis() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total_pages} pages…"))
        ));
    }

    fn on_stage(&self, stage: PipelineStage) {
        match stage {
            PipelineStage::Rasterizing => self.bar.set_message("rasterising…"),
            PipelineStage::Merging => self.bar.set_message("merging…"),
            PipelineStage::Transforming => {
                self.bar.set_prefix("Transforming");
                self.bar.set_message("building canonical record…");
            }
            PipelineStage::Done | PipelineStage::Failed => self.bar.finish_and_clear(),
            _ => {}
        }
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(page_num, Instant::now());
        }
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, document_type: &str) {
        let secs = self.elapsed_secs(page_num);
        let label = if document_type.is_empty() {
            "?"
        } else {
            document_type
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<20}  {}",
            green("✓"),
            page_num,
            total,
            dim(label),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_extraction_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        if failed == 0 {
            self.bar.println(format!(
                "{} {} pages extracted",
                green("✔"),
                bold(&success_count.to_string())
            ));
        } else {
            self.bar.println(format!(
                "{} {}/{} pages extracted  ({} failed)",
                if failed == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            ));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full output (raw buckets + canonical record) to stdout
  invoice2json scan.pdf

  # Canonical record only, written to a file
  invoice2json scan.pdf --final-only -o invoice.json

  # Different models for the two steps
  invoice2json --vision-model gpt-4.1-mini --text-model gpt-4.1 scan.pdf

  # Site-specific lookup tables
  invoice2json --tables tables.json scan.pdf

  # Extract, then post to the ERP backend
  invoice2json scan.pdf --post-url https://erp.example.com/invoice \
      --post-user svc_invoice --post-password '…'

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Provider for both steps (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Model ID for both steps

A .env file in the working directory is loaded before flags are parsed.
libpdfium must be in the working directory or on the system library path.
"#;

/// Extract a canonical invoice record from scanned documents using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice2json",
    version,
    about = "Extract a canonical invoice record from scanned PDFs using Vision LLMs",
    long_about = "Classify every page of a scanned invoice / purchase order / GL document \
(Arabic or English), merge multi-page documents, and produce one canonical JSON record \
with normalised dates, numbered line items and fixed company constants.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "INVOICE2JSON_OUTPUT")]
    output: Option<PathBuf>,

    /// Print only the canonical record.
    #[arg(long, env = "INVOICE2JSON_FINAL_ONLY")]
    final_only: bool,

    /// Vision model for per-page extraction.
    #[arg(long, env = "INVOICE2JSON_VISION_MODEL")]
    vision_model: Option<String>,

    /// Vision provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "INVOICE2JSON_VISION_PROVIDER")]
    vision_provider: Option<String>,

    /// Text model for the canonical transformation.
    #[arg(long, env = "INVOICE2JSON_TEXT_MODEL")]
    text_model: Option<String>,

    /// Text provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "INVOICE2JSON_TEXT_PROVIDER")]
    text_provider: Option<String>,

    /// Maximum pages to process.
    #[arg(long, env = "INVOICE2JSON_MAX_PAGES", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..))]
    max_pages: u32,

    /// Rendering DPI (72–400).
    #[arg(long, env = "INVOICE2JSON_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Number of concurrent page extraction calls.
    #[arg(short, long, env = "INVOICE2JSON_CONCURRENCY", default_value_t = 5)]
    concurrency: usize,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "INVOICE2JSON_PASSWORD")]
    password: Option<String>,

    /// JSON file with lookup tables (aliases, keywords, PO substitutions, constants).
    #[arg(long, env = "INVOICE2JSON_TABLES")]
    tables: Option<PathBuf>,

    /// Text file with a custom per-page extraction prompt.
    #[arg(long, env = "INVOICE2JSON_EXTRACTION_PROMPT")]
    extraction_prompt: Option<PathBuf>,

    /// Text file with a custom transformation prompt template.
    #[arg(long, env = "INVOICE2JSON_TRANSFORM_PROMPT")]
    transform_prompt: Option<PathBuf>,

    /// Max LLM output tokens per call.
    #[arg(long, env = "INVOICE2JSON_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "INVOICE2JSON_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per model call.
    #[arg(long, env = "INVOICE2JSON_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Bounded wait per model call, in seconds.
    #[arg(long, env = "INVOICE2JSON_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "INVOICE2JSON_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Post the canonical record to this endpoint after extraction.
    #[arg(long, env = "INVOICE2JSON_POST_URL")]
    post_url: Option<String>,

    /// Basic-auth user for the posting endpoint.
    #[arg(long, env = "INVOICE2JSON_POST_USER")]
    post_user: Option<String>,

    /// Basic-auth password for the posting endpoint.
    #[arg(long, env = "INVOICE2JSON_POST_PASSWORD", hide_env_values = true)]
    post_password: Option<String>,

    /// Posting timeout in seconds.
    #[arg(long, env = "INVOICE2JSON_POST_TIMEOUT", default_value_t = 30)]
    post_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "INVOICE2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "INVOICE2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "INVOICE2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.verbose;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;

    // ── Run extraction ───────────────────────────────────────────────────
    let mut output = extract_document(&cli.input, &config)
        .await
        .context("Extraction failed")?;

    if let Some(ref url) = cli.post_url {
        let mut posting = PostingConfig::new(url.clone()).with_timeout(cli.post_timeout);
        if let Some(ref user) = cli.post_user {
            posting = posting.with_credentials(user.clone(), cli.post_password.clone().unwrap_or_default());
        }
        let report = post_invoice(&output.final_output, &posting, &config.rules).await;
        if !cli.quiet {
            if report.posted {
                eprintln!("{} posted ({})", green("✔"), report.http_status.unwrap_or_default());
            } else {
                eprintln!("{} posting failed: {}", red("✘"), report.message);
            }
        }
        output = output.with_posting(report);
    }

    // ── Emit ─────────────────────────────────────────────────────────────
    match cli.output {
        Some(ref path) if cli.final_only => {
            let json = serde_json::to_string_pretty(&output.final_output)
                .context("Failed to serialise output")?;
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Some(ref path) => {
            write_output(&output, path)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => {
            let json = if cli.final_only {
                serde_json::to_string_pretty(&output.final_output)
            } else {
                serde_json::to_string_pretty(&output)
            }
            .context("Failed to serialise output")?;
            println!("{json}");
        }
    }

    if !cli.quiet {
        let stats = &output.stats;
        eprintln!(
            "{}  {}/{} pages  {} failed  {} unclassified  {} items  {}ms{}",
            if output.is_partial() {
                cyan("⚠")
            } else {
                green("✔")
            },
            stats.extracted_pages,
            stats.total_pages,
            stats.failed_pages,
            stats.unclassified_pages,
            output.final_output.items.len(),
            stats.total_duration_ms,
            cli.output
                .as_ref()
                .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                .unwrap_or_default(),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&stats.total_input_tokens.to_string()),
            dim(&stats.total_output_tokens.to_string()),
        );
    }

    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .max_pages(cli.max_pages as usize)
        .dpi(cli.dpi)
        .concurrency(cli.concurrency)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref path) = cli.tables {
        let rules = RuleTables::from_json_file(path).context("Failed to load lookup tables")?;
        builder = builder.rules(rules);
    }
    if let Some(ref path) = cli.extraction_prompt {
        builder = builder.extraction_prompt(read_text(path).await?);
    }
    if let Some(ref path) = cli.transform_prompt {
        builder = builder.transform_prompt(read_text(path).await?);
    }
    if let Some(ref m) = cli.vision_model {
        builder = builder.vision_model(m.clone());
    }
    if let Some(ref p) = cli.vision_provider {
        builder = builder.vision_provider_name(p.clone());
    }
    if let Some(ref m) = cli.text_model {
        builder = builder.text_model(m.clone());
    }
    if let Some(ref p) = cli.text_provider {
        builder = builder.text_provider_name(p.clone());
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn read_text(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read prompt from {:?}", path))
}
