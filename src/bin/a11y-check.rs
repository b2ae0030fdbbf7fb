//! CLI binary for a11y-check.
//!
//! `serve` runs the HTTP service; `inspect` and `check` run the same
//! pipeline against a local file so a document can be reviewed without a
//! browser.

use a11y_check::pipeline::upload::validate_file_meta;
use a11y_check::{
    analysis, router, run_pipeline, AppState, CheckType, Finding, PdfiumExtractor,
    PipelineContext, PipelineObserver, ServerConfig, Severity, Stage, StreamEvent,
    StructureExtractor, ValidatedUpload,
};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
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

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Drives a spinner from pipeline stage events.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new(bar: ProgressBar) -> Arc<Self> {
        Arc::new(Self { bar })
    }
}

impl PipelineObserver for CliObserver {
    fn on_stage_start(&self, stage: Stage) {
        let (prefix, msg) = match stage {
            Stage::Upload => ("Preparing", "Copying PDF…"),
            Stage::Extraction => ("Extracting", "Reading tags and layout…"),
            Stage::Analysis => ("Analyzing", "Waiting for the model…"),
        };
        self.bar.set_prefix(prefix);
        self.bar.set_message(msg);
    }

    fn on_stage_complete(&self, stage: Stage, elapsed: Duration) {
        if stage != Stage::Analysis {
            self.bar.println(format!(
                "{} {} {}",
                green("✓"),
                stage,
                dim(&format!("{:.1}s", elapsed.as_secs_f64()))
            ));
        }
    }

    fn on_finding(&self, index: usize) {
        self.bar.set_message(format!("{index} finding(s) so far"));
    }

    fn on_complete(&self, _findings: usize, _elapsed: Duration) {
        self.bar.finish_and_clear();
    }

    fn on_error(&self, _stage: Stage, _message: &str) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the API for the web frontend (reads .env)
  a11y-check serve --port 8000

  # Print the structural report the model would see (no API key needed)
  a11y-check inspect thesis.pdf

  # Same, as JSON
  a11y-check inspect --json thesis.pdf > structure.json

  # Full review from the terminal
  a11y-check check thesis.pdf --check-type accessibility

  # Use another provider through edgequake-llm
  a11y-check check --provider openai --model gpt-4.1 thesis.pdf

ENVIRONMENT VARIABLES:
  ANTHROPIC_API_KEY       Anthropic API key (required for the default provider)
  ANTHROPIC_BASE_URL      Override the Anthropic API base URL
  A11Y_LLM_PROVIDER       anthropic (default), openai, gemini, ollama, azure
  A11Y_MODEL              Model ID (default claude-sonnet-4-20250514)
  A11Y_MAX_TOKENS         Output token budget for one report (default 8192)
  A11Y_TEMPERATURE        Sampling temperature, 0.0–1.0 (default 0.2)
  A11Y_API_TIMEOUT_SECS   Whole-analysis timeout (default 300)
  A11Y_MAX_UPLOAD_MB      Upload ceiling in MB (default 25)
  A11Y_UPLOAD_DIR         Directory for temporary uploads (default: OS temp dir)
  A11Y_ALLOWED_ORIGINS    Comma-separated CORS origins for the frontend
  A11Y_MAX_CONTENT_CHARS  Document text sent to the model (default 15000)
  HOST, PORT              Bind address (default 0.0.0.0:8000)
  PDFIUM_LIB_PATH         Path to an existing libpdfium; skips auto-download
  RUST_LOG                Log filter (default a11y_check=info,tower_http=info)

  PDFium (~30 MB) is downloaded automatically on first run and cached.
"#;

/// Accessibility and formatting review for dissertation PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "a11y-check",
    version,
    about = "Accessibility and formatting review for dissertation PDFs",
    long_about = "Extracts the structure of a PDF (tags, headings, tables, figures, alt text, \
language) and has a language model review it for WCAG 2.1 AA accessibility and dissertation \
formatting rules. Findings stream to the client as server-sent events.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "A11Y_VERBOSE")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default).
    Serve(ServeArgs),
    /// Extract and print the structural report for a PDF.
    Inspect(InspectArgs),
    /// Review a local PDF and print the findings.
    Check(CheckArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Bind host; overrides HOST.
    #[arg(long)]
    host: Option<String>,

    /// Bind port; overrides PORT.
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for temporary uploads; overrides A11Y_UPLOAD_DIR.
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug, Default)]
struct ModelArgs {
    /// Analysis provider; overrides A11Y_LLM_PROVIDER.
    #[arg(long)]
    provider: Option<String>,

    /// Model ID; overrides A11Y_MODEL.
    #[arg(long)]
    model: Option<String>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// PDF file to inspect.
    pdf: PathBuf,

    /// Print the extracted structure as JSON instead of the report.
    #[arg(long)]
    json: bool,

    /// Document text characters included in the report.
    #[arg(long, default_value_t = a11y_check::config::DEFAULT_MAX_CONTENT_CHARS)]
    max_content_chars: usize,

    /// Path to an existing libpdfium.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// PDF file to review.
    pdf: PathBuf,

    /// What to check.
    #[arg(short = 't', long, value_enum, default_value = "both")]
    check_type: CheckTypeArg,

    #[command(flatten)]
    model: ModelArgs,

    /// Print stream events as JSON lines instead of formatted text.
    #[arg(long)]
    json: bool,

    /// Disable the spinner.
    #[arg(long, env = "A11Y_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CheckTypeArg {
    Accessibility,
    Formatting,
    Both,
}

impl From<CheckTypeArg> for CheckType {
    fn from(v: CheckTypeArg) -> Self {
        match v {
            CheckTypeArg::Accessibility => CheckType::Accessibility,
            CheckTypeArg::Formatting => CheckType::Formatting,
            CheckTypeArg::Both => CheckType::Both,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Populate the environment before clap reads its `env` fallbacks.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(args, cli.verbose).await,
        Command::Inspect(args) => {
            init_cli_logging(cli.verbose);
            inspect(args).await
        }
        Command::Check(args) => {
            init_cli_logging(cli.verbose);
            check(args).await
        }
    }
}

// ── Logging setup ────────────────────────────────────────────────────────────

fn init_server_logging(verbose: bool) {
    let default = if verbose {
        "a11y_check=debug,tower_http=debug"
    } else {
        "a11y_check=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Local commands print their own output; logs stay quiet unless asked for.
fn init_cli_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "error" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();
}

// ── PDFium ───────────────────────────────────────────────────────────────────

/// Make sure the pdfium library is on disk, downloading it on first run.
fn ensure_pdfium(show_progress: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if !show_progress {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

// ── serve ────────────────────────────────────────────────────────────────────

async fn serve(args: ServeArgs, verbose: bool) -> Result<()> {
    init_server_logging(verbose);

    let mut builder = ServerConfig::builder_from_env().context("Invalid environment configuration")?;
    if let Some(host) = args.host {
        builder = builder.host(host);
    }
    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    if let Some(dir) = args.upload_dir {
        builder = builder.upload_dir(dir);
    }
    if let Some(provider) = args.model.provider {
        builder = builder.provider(provider);
    }
    if let Some(model) = args.model.model {
        builder = builder.model(model);
    }
    let config = builder.build().context("Invalid configuration")?;

    // A missing engine only fails the requests that need it.
    if config.pdfium_lib_path.is_none() {
        if let Err(e) = ensure_pdfium(false) {
            warn!("PDFium unavailable at startup: {e:#}. Extraction will retry per request.");
        }
    }

    let addr = config.bind_addr();
    info!(
        "Starting a11y-check v{} (provider={}, model={}, max upload {} MB)",
        env!("CARGO_PKG_VERSION"),
        config.analysis.provider,
        config.analysis.model,
        config.max_upload_bytes / (1024 * 1024)
    );
    info!("Allowed origins: {}", config.allowed_origins.join(", "));

    let state = AppState::from_config(config).context("Failed to initialise the analysis backend")?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("a11y-check listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown..."),
    }
}

// ── inspect ──────────────────────────────────────────────────────────────────

async fn inspect(args: InspectArgs) -> Result<()> {
    if args.pdfium_lib_path.is_none() {
        ensure_pdfium(true)?;
    }
    let file_name = display_name(&args.pdf);
    let extractor = PdfiumExtractor::new(args.pdfium_lib_path.clone());
    let path = args.pdf.clone();
    let structure = tokio::task::spawn_blocking(move || extractor.extract(&path, &file_name))
        .await
        .context("Extraction task failed")?
        .with_context(|| format!("Failed to extract {}", args.pdf.display()))?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&structure).context("Failed to serialize structure")?
        );
    } else {
        println!("{}", structure.to_prompt_report(args.max_content_chars));
    }
    Ok(())
}

// ── check ────────────────────────────────────────────────────────────────────

async fn check(args: CheckArgs) -> Result<()> {
    let mut builder = ServerConfig::builder_from_env().context("Invalid environment configuration")?;
    if let Some(provider) = args.model.provider {
        builder = builder.provider(provider);
    }
    if let Some(model) = args.model.model {
        builder = builder.model(model);
    }
    let config = builder.build().context("Invalid configuration")?;

    let file_name = display_name(&args.pdf);
    validate_file_meta(Some(&file_name), None)?;
    let bytes = tokio::fs::read(&args.pdf)
        .await
        .with_context(|| format!("Failed to read {}", args.pdf.display()))?;
    if bytes.len() as u64 > config.max_upload_bytes {
        bail!(
            "{} is {} MB; the limit is {} MB",
            file_name,
            bytes.len() / (1024 * 1024),
            config.max_upload_bytes / (1024 * 1024)
        );
    }

    let show_progress = !args.no_progress && !args.json;
    if config.pdfium_lib_path.is_none() {
        ensure_pdfium(show_progress)?;
    }

    let analysis = analysis::from_config(&config).context("Failed to initialise the analysis backend")?;
    let extractor = Arc::new(PdfiumExtractor::new(config.pdfium_lib_path.clone()));
    let bar = if show_progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    } else {
        ProgressBar::hidden()
    };

    let ctx = PipelineContext::new(extractor, analysis)
        .observer(CliObserver::new(bar.clone()))
        .upload_dir(config.upload_dir.clone())
        .max_content_chars(config.max_content_chars);
    let check_type = CheckType::from(args.check_type);
    let upload = ValidatedUpload {
        file_name: file_name.clone(),
        content_type: Some("application/pdf".to_string()),
        bytes: Bytes::from(bytes),
        check_type,
    };

    if !args.json {
        eprintln!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Checking {file_name} for {} compliance…", check_type.task_label()))
        );
    }

    let mut handle = run_pipeline(ctx, upload);
    let mut tally = Tally::default();
    let mut failure = None;

    while let Some(event) = handle.events.next().await {
        if args.json {
            println!("{}", serde_json::to_string(&event).context("Failed to serialize event")?);
        } else {
            bar.suspend(|| print_event(&event));
        }
        match event {
            StreamEvent::Finding(ref f) => tally.add(f),
            StreamEvent::Error { stage, message } => failure = Some((stage, message)),
            _ => {}
        }
    }
    handle.task.await.context("Pipeline task failed")?;

    if let Some((stage, message)) = failure {
        bail!("{stage} failed: {message}");
    }
    if !args.json {
        tally.print();
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_event(event: &StreamEvent) {
    match event {
        StreamEvent::Finding(f) => print_finding(f),
        StreamEvent::Summary { text } => println!("\n{}\n", text.trim()),
        StreamEvent::Complete { .. } | StreamEvent::Error { .. } => {}
    }
}

fn print_finding(f: &Finding) {
    let badge = match f.severity {
        Severity::Critical => red("✗ critical  "),
        Severity::Warning => yellow("⚠ warning   "),
        Severity::Suggestion => cyan("• suggestion"),
    };
    let location = match (f.page, f.element.as_deref()) {
        (Some(p), Some(e)) => format!("p.{p} {e}: "),
        (Some(p), None) => format!("p.{p}: "),
        (None, Some(e)) => format!("{e}: "),
        (None, None) => String::new(),
    };
    println!("{badge} {}{}", bold(&location), f.description);
    if let Some(fix) = f.fix.as_deref() {
        println!("              {}", dim(&format!("fix: {fix}")));
    }
    if let Some(wcag) = f.wcag.as_deref() {
        println!("              {}", dim(&format!("WCAG {wcag}")));
    }
}

#[derive(Default)]
struct Tally {
    critical: usize,
    warning: usize,
    suggestion: usize,
}

impl Tally {
    fn add(&mut self, f: &Finding) {
        match f.severity {
            Severity::Critical => self.critical += 1,
            Severity::Warning => self.warning += 1,
            Severity::Suggestion => self.suggestion += 1,
        }
    }

    fn print(&self) {
        let total = self.critical + self.warning + self.suggestion;
        let mark = if self.critical > 0 { red("✘") } else { green("✔") };
        eprintln!(
            "{mark} {} findings: {} critical, {} warning, {} suggestion",
            bold(&total.to_string()),
            red(&self.critical.to_string()),
            yellow(&self.warning.to_string()),
            self.suggestion
        );
    }
}
