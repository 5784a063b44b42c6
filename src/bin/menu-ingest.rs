//! CLI binary for menu-ingest.
//!
//! Runs one menu file through intake and processing on the local machine:
//! records and events live in memory, uploaded documents and page previews
//! are written under `--out-dir`, and the staged result is printed.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use menu_ingest::store::ObjectStorage;
use menu_ingest::{
    Actor, Backends, DocumentKind, HttpRasterizer, IntakeRequest, IntakeService, LlmExtractor,
    LocalDirStorage, MemoryBackend, MergeResult, PdfRasterizer, PipelineConfig, ProcessRequest,
    Processor, ProgressCallback, ResponsesExtractor, RunOutcome, RunProgressCallback,
    VisionExtractor,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

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

/// Live progress bar plus one log line per extracted page. Pages may finish
/// out of order when extraction runs concurrently.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<u32, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Converting pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    /// Clear the bar after a failed run and say how many pages errored.
    fn finish_failed(&self) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if failed > 0 {
            eprintln!("{} {} page(s) failed extraction", red("✘"), failed);
        }
    }

    fn elapsed_secs(&self, page: u32) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&page)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_pages as u64);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total_pages} page(s)…"))
        ));
    }

    fn on_page_start(&self, page: u32, _total_pages: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(page, Instant::now());
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: u32, total_pages: usize, items: usize) {
        let secs = self.elapsed_secs(page);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            page,
            total_pages,
            dim(&format!("{items:>4} items")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: u32, total_pages: usize, error: &str) {
        let secs = self.elapsed_secs(page);
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page,
            total_pages,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, items_count: usize, pages_processed: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} items staged from {} page(s)",
            green("✔"),
            bold(&items_count.to_string()),
            pages_processed
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Photo of a menu, OpenAI Responses API
  menu-ingest dinner.jpg

  # PDF through an HTTP rasteriser, prices in euros
  menu-ingest --rasterizer-url http://localhost:8080/rasterize --currency EUR menu.pdf

  # Any edgequake-llm provider instead of the Responses API
  menu-ingest --extractor llm --provider anthropic --model claude-sonnet-4-20250514 menu.png

  # Machine-readable output
  menu-ingest --json menu.webp > staged.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          API key for the Responses extractor
  OPENAI_BASE_URL         Override the Responses API base URL
  EDGEQUAKE_LLM_PROVIDER  Provider for --extractor llm
  EDGEQUAKE_MODEL         Model override
  MENU_INGEST_RASTERIZER_URL    HTTP rasteriser endpoint for PDFs
  MENU_INGEST_RASTERIZER_TOKEN  Bearer token for the rasteriser
  PDFIUM_LIB_PATH         libpdfium location (builds with the `pdfium` feature)
"#;

/// Digitise a restaurant menu (PDF or photo) into staged catalog rows.
#[derive(Parser, Debug)]
#[command(
    name = "menu-ingest",
    version,
    about = "Digitise restaurant menus (PDF or photo) with Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Menu file: .pdf, .jpg, .jpeg, .png or .webp.
    input: PathBuf,

    /// ISO-4217 currency printed on the menu, if known.
    #[arg(long, env = "MENU_INGEST_CURRENCY")]
    currency: Option<String>,

    /// Directory for the stored document and page previews.
    #[arg(long, env = "MENU_INGEST_OUT_DIR", default_value = "menu-ingest-out")]
    out_dir: PathBuf,

    /// HTTP rasteriser endpoint used for PDFs.
    #[arg(long, env = "MENU_INGEST_RASTERIZER_URL")]
    rasterizer_url: Option<String>,

    /// Bearer token sent to the rasteriser.
    #[arg(long, env = "MENU_INGEST_RASTERIZER_TOKEN", hide_env_values = true)]
    rasterizer_token: Option<String>,

    /// Extraction backend.
    #[arg(long, env = "MENU_INGEST_EXTRACTOR", value_enum, default_value = "responses")]
    extractor: ExtractorArg,

    /// Vision model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// edgequake-llm provider name (only with --extractor llm).
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Pages extracted concurrently.
    #[arg(short, long, env = "MENU_INGEST_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Maximum pages processed per document.
    #[arg(long, env = "MENU_INGEST_MAX_PAGES", default_value_t = 25)]
    max_pages: usize,

    /// Longest page edge sent to the model, in pixels.
    #[arg(long, env = "MENU_INGEST_MAX_IMAGE_EDGE", default_value_t = 1200)]
    max_image_edge: u32,

    /// Items below this confidence are flagged for review.
    #[arg(long, env = "MENU_INGEST_MIN_CONFIDENCE", default_value_t = 0.55)]
    min_confidence: f64,

    /// Retries per page on transport failure.
    #[arg(long, env = "MENU_INGEST_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Print the full merge result as JSON instead of text.
    #[arg(long, env = "MENU_INGEST_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "MENU_INGEST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MENU_INGEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MENU_INGEST_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ExtractorArg {
    /// OpenAI Responses API with strict JSON-schema output.
    Responses,
    /// Any edgequake-llm vision provider.
    Llm,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
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

    let kind = kind_from_path(&cli.input)?;
    let document = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    let config = build_config(&cli)?;

    // ── Wire backends ────────────────────────────────────────────────────
    let memory = Arc::new(MemoryBackend::new());
    let objects: Arc<dyn ObjectStorage> = Arc::new(LocalDirStorage::new(&cli.out_dir));
    let backends = Backends {
        objects: Arc::clone(&objects),
        ..memory.backends()
    };
    let location = memory.add_location(Uuid::new_v4());
    let operator = Actor::new(Uuid::new_v4());
    memory.grant_staff(&operator, &location);

    // ── Intake + local upload ────────────────────────────────────────────
    let intake = IntakeService::new(config.clone(), backends.clone());
    let started = intake
        .start(
            &operator,
            IntakeRequest {
                location_id: location.id,
                original_filename: cli
                    .input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned()),
                file_mime: Some(kind.mime().to_string()),
                request_signed_upload: Some(false),
                currency: cli.currency.clone(),
                ..Default::default()
            },
        )
        .await
        .context("Intake failed")?;
    objects
        .put(&started.storage_path, &document, kind.mime())
        .await
        .context("Failed to store document")?;

    // ── Process ──────────────────────────────────────────────────────────
    let extractor = build_extractor(&cli, &config)?;
    let mut processor = Processor::new(config, backends, extractor);
    if let Some(rasterizer) = build_rasterizer(&cli, &objects) {
        processor = processor.with_rasterizer(rasterizer);
    }
    let progress = show_progress.then(CliProgressCallback::new);
    if let Some(ref cb) = progress {
        let cb: ProgressCallback = cb.clone();
        processor = processor.with_progress(cb);
    }

    let outcome = processor
        .process(
            &operator,
            ProcessRequest {
                ingestion_id: started.ingestion_id,
                rerun: false,
            },
        )
        .await
        .context("Processing could not start")?;

    match outcome {
        RunOutcome::Completed { response, merge } => {
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&merge).context("Failed to serialise result")?
                );
            } else {
                println!("{}", merge.raw_text);
            }
            if !cli.quiet && !cli.json {
                print_summary(&merge, response.pages_processed, &cli.out_dir);
            }
            Ok(())
        }
        RunOutcome::Failed { error, response } => {
            if let Some(ref cb) = progress {
                cb.finish_failed();
            }
            if !cli.quiet {
                for e in &response.errors {
                    eprintln!("{} {}", red("✘"), e);
                }
            }
            Err(error).context(format!(
                "Processing failed after {} page(s)",
                response.pages_processed
            ))
        }
    }
}

fn kind_from_path(path: &Path) -> Result<DocumentKind> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        other => bail!("Unsupported file type '.{other}': expected pdf, jpg, png or webp"),
    };
    DocumentKind::from_mime(mime).context("Unsupported file type")
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .max_pages(cli.max_pages)
        .max_image_edge(cli.max_image_edge)
        .min_confidence(cli.min_confidence)
        .extraction_concurrency(cli.concurrency)
        .max_retries(cli.max_retries);
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    builder.build().context("Invalid configuration")
}

fn build_extractor(cli: &Cli, config: &PipelineConfig) -> Result<Arc<dyn VisionExtractor>> {
    Ok(match cli.extractor {
        ExtractorArg::Responses => Arc::new(
            ResponsesExtractor::from_env(config).context("Responses extractor unavailable")?,
        ),
        ExtractorArg::Llm => Arc::new(
            LlmExtractor::resolve(cli.provider.as_deref(), config)
                .context("LLM provider unavailable")?,
        ),
    })
}

fn build_rasterizer(
    cli: &Cli,
    #[allow(unused_variables)] objects: &Arc<dyn ObjectStorage>,
) -> Option<Arc<dyn PdfRasterizer>> {
    if let Some(ref url) = cli.rasterizer_url {
        let mut http = HttpRasterizer::new(url.clone());
        if let Some(ref token) = cli.rasterizer_token {
            http = http.with_bearer_token(token.clone());
        }
        return Some(Arc::new(http));
    }
    #[cfg(feature = "pdfium")]
    {
        Some(Arc::new(menu_ingest::PdfiumRasterizer::new(Arc::clone(objects))))
    }
    #[cfg(not(feature = "pdfium"))]
    {
        None
    }
}

fn print_summary(merge: &MergeResult, pages: usize, out_dir: &Path) {
    let flagged = merge.rows.iter().filter(|r| !r.flags.is_empty()).count();
    let c = &merge.confidence;
    eprintln!(
        "{}  {} items  {} page(s)  currency {}  →  {}",
        if flagged == 0 { green("✔") } else { cyan("⚠") },
        bold(&merge.items_count.to_string()),
        pages,
        merge.currency,
        bold(&out_dir.display().to_string()),
    );
    eprintln!(
        "   confidence  {} ≥0.90  /  {} ≥0.75  /  {} ≥0.55  /  {} below",
        dim(&c.ge_90.to_string()),
        dim(&c.ge_75.to_string()),
        dim(&c.ge_55.to_string()),
        dim(&c.lt_55.to_string()),
    );
    if flagged > 0 {
        let threshold = merge
            .price_threshold_cents
            .map(|t| format!("{:.2}", t / 100.0))
            .unwrap_or_else(|| "n/a".into());
        eprintln!(
            "   {} rows flagged for review (price threshold {})",
            cyan(&flagged.to_string()),
            threshold
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn provider_reads_edgequake_llm_provider() {
        let cmd = Cli::command();
        let provider = cmd
            .get_arguments()
            .find(|a| a.get_id() == "provider")
            .unwrap();
        assert_eq!(
            provider.get_env(),
            Some(std::ffi::OsStr::new("EDGEQUAKE_LLM_PROVIDER"))
        );
    }

    #[test]
    fn page_errors_are_counted_for_the_failure_summary() {
        let cb = CliProgressCallback::new();
        cb.on_page_error(1, 2, "HTTP 502");
        cb.on_page_error(2, 2, "HTTP 502");
        assert_eq!(cb.errors.load(Ordering::SeqCst), 2);
        cb.finish_failed();
    }
}
