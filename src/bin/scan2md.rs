//! CLI binary for scan2md.
//!
//! A thin shim over the library crate: `run` drives a job through the
//! pipeline, `stage` is the isolated worker entry point, `status` prints
//! what the store knows about a job.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use scan2md::orchestrator::list_runs;
use scan2md::pipeline::assemble::load_final;
use scan2md::pipeline::list_chapters;
use scan2md::pipeline::llm::resolve_provider;
use scan2md::{
    ArtifactStore, ChapterId, CommandStageRunner, DetectorKind, ErrorKind, FsStore,
    JobDescriptor, JobId, LocalStageRunner, LowConfidencePolicy, Pipeline, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, RunReport, Separator, StageContext, StageName,
    StageRunner, WorkerEnv,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
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

/// One bar per stage; chapters tick it as they finish (in any order).
struct CliProgressCallback {
    bar: ProgressBar,
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
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, run: scan2md::RunId, job: &JobId, chapters: usize) {
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(&format!("Job {job}: {chapters} chapters")),
            dim(&format!("run {run}"))
        ));
    }

    fn on_stage_start(&self, stage: StageName, chapters: usize) {
        let len = if stage.is_per_chapter() { chapters } else { 1 };
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} chapters  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(len as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(format!("{stage:<8}"));
        self.bar.reset_elapsed();
    }

    fn on_chapter_complete(&self, stage: StageName, chapter: &ChapterId) {
        self.bar
            .println(format!("  {} {:<8} {}", green("✓"), stage.as_str(), chapter));
        self.bar.inc(1);
    }

    fn on_chapter_retry(&self, stage: StageName, chapter: &ChapterId, attempt: u32, error: &str) {
        self.bar.println(format!(
            "  {} {:<8} {}  {}",
            cyan("↻"),
            stage.as_str(),
            chapter,
            dim(&format!("attempt {attempt}: {}", truncate(error)))
        ));
    }

    fn on_chapter_error(&self, stage: StageName, chapter: &ChapterId, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<8} {}  {}",
            red("✗"),
            stage.as_str(),
            chapter,
            red(&truncate(error))
        ));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: StageName, success: bool) {
        if !stage.is_per_chapter() && success {
            self.bar.inc(1);
        }
    }

    fn on_run_complete(&self, _run: scan2md::RunId, _success: bool) {
        self.bar.finish_and_clear();
    }
}

fn truncate(msg: &str) -> String {
    match msg.char_indices().nth(79) {
        Some((i, _)) => format!("{}\u{2026}", &msg[..i]),
        None => msg.to_string(),
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a folder of chapter folders (01/, 02/, ... each holding page scans)
  scan2md run ./scans --store ./artifacts -o manual.md

  # Re-run the stages over chapters already in the store
  scan2md run --store ./artifacts --job scans

  # Redo OCR and Markdown for two chapters, then reassemble the whole job,
  # each stage in its own worker process
  scan2md run ./scans --chapters 01,02 --isolate

  # Use the LLM structure detector and number chapters
  scan2md run ./scans --detector llm --number-chapters --toc

  # Inspect chapter status and the last runs of a job
  scan2md status --store ./artifacts --job scans

FOLDER LAYOUT:
  scans/
    01-introduction/   page-1.png page-2.png ...
    02-installation/   001.jpg 002.jpg ...
    03-upgrade.docx
  A folder without sub-folders or documents is treated as a single chapter.
  Pages are ordered naturally by file name (page-2 before page-10). The
  pages of a .docx chapter are its embedded images, in archive order.
  Chapters whose source is unchanged since the last intake keep their
  progress.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  SCAN2MD_STORE           Artifact store directory
  RUST_LOG                Log filter (overrides --verbose / --quiet)
"#;

/// Turn scanned chapter folders into one Markdown document.
#[derive(Parser, Debug)]
#[command(
    name = "scan2md",
    version,
    about = "Turn scanned chapter folders into one Markdown document",
    long_about = "Runs a three-stage pipeline over a folder of scanned pages: OCR per chapter \
(vision LLM), Markdown conversion per chapter (heuristic or LLM structure detection), and \
final assembly into one document in chapter order. All intermediate artifacts live in a \
directory store so runs can be resumed, inspected and repeated.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "SCAN2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "SCAN2MD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a job through OCR, Markdown conversion and final assembly.
    Run(RunArgs),
    /// Execute one stage as an isolated worker (configured through
    /// SCAN2MD_* environment variables).
    #[command(hide = true)]
    Stage,
    /// Show chapter status, runs and the final document of a job.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Folder of chapter sub-folders and `.docx` files (or of page images
    /// for one chapter), or a single `.docx`. Omit to re-run over chapters
    /// already staged for --job.
    folder: Option<PathBuf>,

    /// Artifact store directory.
    #[arg(long, env = "SCAN2MD_STORE", default_value = "scan2md-store")]
    store: PathBuf,

    /// Job identifier. Default: derived from the folder name.
    #[arg(long, env = "SCAN2MD_JOB")]
    job: Option<String>,

    /// Redo OCR and Markdown for these chapters only (comma separated).
    /// The final document still covers every chapter of the job.
    #[arg(long, value_delimiter = ',')]
    chapters: Option<Vec<String>>,

    /// Write the final Markdown to this file instead of stdout.
    #[arg(short, long, env = "SCAN2MD_OUTPUT")]
    output: Option<PathBuf>,

    /// Run every stage in a separate worker process.
    #[arg(long, env = "SCAN2MD_ISOLATE")]
    isolate: bool,

    /// Extra attempts for chapters failing with transient errors.
    #[arg(long, env = "SCAN2MD_RETRIES", default_value_t = 2)]
    retries: u32,

    /// Wall-clock budget of one stage in seconds.
    #[arg(long, env = "SCAN2MD_STAGE_TIMEOUT", default_value_t = 1800)]
    stage_timeout: u64,

    /// Chapters processed concurrently within a stage.
    #[arg(long, env = "SCAN2MD_CHAPTER_CONCURRENCY", default_value_t = 4)]
    chapter_concurrency: usize,

    /// Pages recognised concurrently within a chapter.
    #[arg(short = 'c', long, env = "SCAN2MD_PAGE_CONCURRENCY", default_value_t = 4)]
    page_concurrency: usize,

    /// Minimum OCR confidence per page (0.0–1.0).
    #[arg(long, env = "SCAN2MD_MIN_CONFIDENCE", default_value_t = 0.6)]
    min_confidence: f32,

    /// Keep low-confidence pages (flagged) instead of failing the chapter.
    #[arg(long, env = "SCAN2MD_FLAG_LOW_CONFIDENCE")]
    flag_low_confidence: bool,

    /// Structure detector for the Markdown stage.
    #[arg(long, env = "SCAN2MD_DETECTOR", value_enum, default_value = "heuristic")]
    detector: DetectorArg,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "SCAN2MD_PAGE_SEPARATOR", default_value = "none")]
    page_separator: String,

    /// Chapter separator: none, hr, comment, or custom string.
    #[arg(long, env = "SCAN2MD_CHAPTER_SEPARATOR", default_value = "hr")]
    chapter_separator: String,

    /// Prefix chapter titles with their position.
    #[arg(long, env = "SCAN2MD_NUMBER_CHAPTERS")]
    number_chapters: bool,

    /// Emit a linked table of contents.
    #[arg(long, env = "SCAN2MD_TOC")]
    toc: bool,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Max LLM output tokens per page.
    #[arg(long, env = "SCAN2MD_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "SCAN2MD_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "SCAN2MD_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Print the run report as JSON on stdout instead of the document.
    #[arg(long, env = "SCAN2MD_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SCAN2MD_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Artifact store directory.
    #[arg(long, env = "SCAN2MD_STORE", default_value = "scan2md-store")]
    store: PathBuf,

    /// Job identifier.
    #[arg(long, env = "SCAN2MD_JOB")]
    job: String,

    /// Output JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum DetectorArg {
    Heuristic,
    Llm,
}

impl From<DetectorArg> for DetectorKind {
    fn from(v: DetectorArg) -> Self {
        match v {
            DetectorArg::Heuristic => DetectorKind::Heuristic,
            DetectorArg::Llm => DetectorKind::Llm,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs on a terminal run.
    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
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

    match cli.command {
        Command::Run(ref args) => run(args, cli.quiet, show_progress).await,
        Command::Stage => stage_worker().await,
        Command::Status(ref args) => status(args).await,
    }
}

// ── run ──────────────────────────────────────────────────────────────────

async fn run(args: &RunArgs, quiet: bool, show_progress: bool) -> Result<()> {
    let job_id = match (&args.job, &args.folder) {
        (Some(job), _) => JobId::new(job.trim()).context("Invalid --job")?,
        (None, Some(folder)) => {
            let path = folder.canonicalize().unwrap_or_else(|_| folder.clone());
            let name = if path.is_file() { path.file_stem() } else { path.file_name() };
            let name = name
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "job".to_string());
            JobId::sanitized(&name).context("Cannot derive a job id from the folder name; pass --job")?
        }
        (None, None) => anyhow::bail!("Pass a folder to convert, or --job to re-run a staged job"),
    };
    let chapters = args
        .chapters
        .as_ref()
        .map(|list| {
            list.iter()
                .map(|c| ChapterId::new(c.trim()))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .context("Invalid --chapters")?;

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(args, progress)?;

    let store = Arc::new(FsStore::new(&args.store));
    let pipeline = if args.isolate {
        // Fail here rather than once per worker when no provider is set up.
        resolve_provider(None, &config.stage.llm)?;
        let exe = std::env::current_exe().context("Cannot locate the scan2md executable")?;
        let runner = CommandStageRunner::new(exe, &args.store)
            .args(["stage"])
            .with_config(&config);
        Pipeline::new(store, Arc::new(runner), config)
    } else {
        Pipeline::from_config(store, config).context("Failed to set up the pipeline")?
    };

    let job = JobDescriptor {
        job_id: job_id.clone(),
        chapter_folder: args.folder.clone(),
        chapters,
    };
    let report = pipeline.run(job).await.context("Run could not start")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise run report")?
        );
    }

    if let Some(failure) = &report.failure {
        if !quiet {
            print_failure(&report);
        }
        std::process::exit(failure.kind.exit_code());
    }

    if let Some(ref path) = args.output {
        let doc = pipeline
            .export_final(&job_id, path)
            .await
            .context("Failed to export the final document")?;
        if !quiet {
            eprintln!(
                "{}  {} chapters  {}ms  →  {}",
                green("✔"),
                doc.chapters.len(),
                run_millis(&report),
                bold(&path.display().to_string()),
            );
        }
    } else if !args.json {
        let doc = pipeline
            .final_document(&job_id)
            .await
            .context("Failed to read the final document")?;
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(doc.body.as_bytes())
            .context("Failed to write to stdout")?;
        if !quiet {
            eprintln!(
                "{}  {} chapters  {}ms",
                green("✔"),
                doc.chapters.len(),
                run_millis(&report)
            );
        }
    }
    Ok(())
}

fn run_millis(report: &RunReport) -> i64 {
    (report.finished_at - report.started_at).num_milliseconds()
}

fn print_failure(report: &RunReport) {
    let Some(f) = &report.failure else { return };
    let chapter = f
        .chapter
        .as_ref()
        .map(|c| format!(" chapter {c}"))
        .unwrap_or_default();
    eprintln!(
        "{} {} failed in the {} stage{}",
        red("✘"),
        bold(&format!("Run {}", report.run_id)),
        f.stage,
        chapter,
    );
    eprintln!("   {}: {}", red(f.kind.as_str()), f.message);
}

/// Map CLI args to `PipelineConfig`.
fn build_config(args: &RunArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .retry_budget(args.retries)
        .stage_timeout_secs(args.stage_timeout)
        .chapter_concurrency(args.chapter_concurrency)
        .page_concurrency(args.page_concurrency)
        .min_confidence(args.min_confidence)
        .low_confidence(if args.flag_low_confidence {
            LowConfidencePolicy::FlagAndContinue
        } else {
            LowConfidencePolicy::FailChapter
        })
        .detector(args.detector.clone().into())
        .page_separator(parse_separator(&args.page_separator))
        .chapter_separator(parse_separator(&args.chapter_separator))
        .number_chapters(args.number_chapters)
        .table_of_contents(args.toc)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .api_timeout_secs(args.api_timeout);

    if let Some(ref name) = args.provider {
        builder = builder.provider_name(name.clone());
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Parse a `--*-separator` string into a `Separator`.
fn parse_separator(s: &str) -> Separator {
    match s.to_lowercase().as_str() {
        "none" => Separator::None,
        "hr" | "---" => Separator::HorizontalRule,
        "comment" => Separator::Comment,
        _ => Separator::Custom(s.to_string()),
    }
}

// ── stage (isolated worker) ──────────────────────────────────────────────

/// Worker entry point. Exits with the code of the failure's kind; the
/// failure itself goes to stderr as a marker line for the parent.
async fn stage_worker() -> Result<()> {
    let env = match WorkerEnv::from_env() {
        Ok(env) => env,
        Err(e) => exit_worker(scan2md::StageFailure::runner(e.to_string())),
    };
    let store: Arc<dyn ArtifactStore> = Arc::new(FsStore::new(&env.store));
    let ctx = match StageContext::from_settings(store, env.settings, None) {
        Ok(ctx) => ctx,
        Err(e) => exit_worker(scan2md::StageFailure::runner(e.to_string())),
    };

    // The parent relaunches on transient failures, so no retries here.
    let runner = LocalStageRunner::new(Arc::new(ctx));
    let outcome = runner.invoke(env.request).await;
    match outcome.exit.failure {
        None => Ok(()),
        Some(failure) => {
            eprintln!("{}", failure.to_marker_line());
            std::process::exit(outcome.exit.code);
        }
    }
}

fn exit_worker(failure: scan2md::StageFailure) -> ! {
    eprintln!("{}", failure.to_marker_line());
    std::process::exit(ErrorKind::StageRunner.exit_code());
}

// ── status ───────────────────────────────────────────────────────────────

async fn status(args: &StatusArgs) -> Result<()> {
    let job = JobId::new(args.job.trim()).context("Invalid --job")?;
    let store = FsStore::new(&args.store);

    let chapters = list_chapters(&store, &job)
        .await
        .context("Failed to read chapters")?;
    let runs = list_runs(&store, &job)
        .await
        .context("Failed to read run records")?;
    let final_doc = load_final(&store, &job).await;

    if args.json {
        let value = serde_json::json!({
            "job_id": job,
            "chapters": chapters,
            "runs": runs,
            "final_document": final_doc.as_ref().ok().map(|d| serde_json::json!({
                "chapters": d.chapters,
                "generated_at": d.generated_at,
                "digest": d.digest,
            })),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise status")?
        );
        return Ok(());
    }

    println!("Job:       {}", bold(job.as_str()));
    println!("Store:     {}", args.store.display());
    println!();
    if chapters.is_empty() {
        println!("  {}", dim("no chapters staged"));
    }
    for c in &chapters {
        let status = match c.status {
            scan2md::ChapterStatus::MarkdownDone => green(c.status.as_str()),
            scan2md::ChapterStatus::Failed => red(c.status.as_str()),
            _ => cyan(c.status.as_str()),
        };
        println!(
            "  {:<24} {:<24} {:>4} pages  {}",
            c.id.as_str(),
            status,
            c.pages.len(),
            dim(&c.updated_at.to_rfc3339()),
        );
    }
    println!();
    match runs.last() {
        Some(r) => println!(
            "Last run:  {} {}  ({} runs total)",
            r.run_id,
            if r.is_success() { green("Done") } else { red("Failed") },
            runs.len()
        ),
        None => println!("Last run:  {}", dim("none")),
    }
    match final_doc {
        Ok(d) => println!(
            "Final:     {} chapters, sha256 {}",
            d.chapters.len(),
            dim(&d.digest)
        ),
        Err(e) => println!("Final:     {}", dim(&e.to_string().replace('\n', " "))),
    }
    Ok(())
}
