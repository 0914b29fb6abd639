//! CLI binary for engrave-desk.
//!
//! A thin shim over the library crate: maps flags to `OrderForm`,
//! `EngraveConfig` and `Credentials`, asks the captcha on the terminal, and
//! writes the finished PNG.

use anyhow::{Context, Result};
use clap::Parser;
use engrave_desk::{
    Credentials, EngraveConfig, EngraveError, Engraver, FormError, OrderForm, ProgressCallback,
    ServiceAccountKey, Session, SheetsConfig, StepTable, SubmissionProgress, TelegramConfig,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Wrong captcha answers tolerated before giving up.
const CAPTCHA_ATTEMPTS: usize = 3;

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
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one spinner line plus a log line per finished stage.
struct CliProgress {
    bar: ProgressBar,
    started: Mutex<HashMap<String, Instant>>,
}

impl CliProgress {
    /// The bar stays hidden until processing starts so it does not draw
    /// over the captcha prompt.
    fn new() -> Arc<Self> {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden());
        let style =
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Engraving");
        Arc::new(Self {
            bar,
            started: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed(&self, stage: &str) -> f64 {
        self.started
            .lock()
            .ok()
            .and_then(|mut m| m.remove(stage))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl SubmissionProgress for CliProgress {
    fn on_submission_start(&self, remote_steps: usize) {
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
        self.bar.enable_steady_tick(Duration::from_millis(80));
        self.bar.println(format!(
            "{} {}",
            bold("◆"),
            bold(&format!("Processing photo ({remote_steps} hosted steps)…"))
        ));
    }

    fn on_stage_start(&self, stage: &str) {
        if let Ok(mut m) = self.started.lock() {
            m.insert(stage.to_string(), Instant::now());
        }
        self.bar.set_message(stage.to_string());
    }

    fn on_stage_complete(&self, stage: &str) {
        let secs = self.elapsed(stage);
        self.bar.println(format!(
            "  {} {:<10}  {}",
            green("✓"),
            stage,
            dim(&format!("{secs:.1}s"))
        ));
    }

    fn on_sink_result(&self, sink: &str, error: Option<&str>) {
        match error {
            None => self.bar.println(format!("  {} sent to {sink}", green("✓"))),
            Some(e) => self
                .bar
                .println(format!("  {} {sink}: {}", yellow("⚠"), yellow(e))),
        }
    }

    fn on_submission_complete(&self, success: bool) {
        self.bar.finish_and_clear();
        if !success {
            eprintln!("{} processing failed", red("✘"));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Minimal order, result written to ./ela_ana_lopez.png
  engrave portrait.jpg --name "Ana Lopez" --amount 45

  # Full order published to Telegram and the orders sheet
  engrave portrait.jpg --name "Ana Lopez" --product Pendant \
      --back-text "Always" --payment-method Transfer --amount 45 --currency EUR \
      --reference TX-1029 --delivery Courier --address "Main St 1" --phone 555-0101

  # Skip the HD steps, brighten a dark photo, custom model table
  engrave dark.jpg --name Luis --amount 30 --no-hd --shadow-reveal 1.4 --steps steps.toml

STEP TABLE (TOML):
  [upscale]
  model = "nightmareai/real-esrgan:<version>"
  params = { scale = 2, face_enhance = true }

  [matte]
  model = "bria/remove-background"
  params = { preserve_alpha = true }

ENVIRONMENT VARIABLES:
  REPLICATE_API_TOKEN          Inference API token (required)
  TELEGRAM_BOT_TOKEN           Bot token; enables the Telegram sink with TELEGRAM_CHAT_ID
  TELEGRAM_CHAT_ID             Target chat id or @channel
  GOOGLE_SERVICE_ACCOUNT_FILE  Service-account JSON key; enables the sheet sink with SHEET_ID
  SHEET_ID                     Spreadsheet id
  SHEET_TAB                    Worksheet name (default Sheet1)
  ENGRAVE_STEPS                Step table TOML file
"#;

/// Turn a customer photo into an engraving-ready PNG and publish the order.
#[derive(Parser, Debug)]
#[command(
    name = "engrave",
    version,
    about = "Turn a customer photo into an engraving-ready PNG and publish the order",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local photo path (PNG/JPEG) or HTTP/HTTPS URL.
    input: String,

    /// Write the PNG here instead of ./ela_<customer>.png.
    #[arg(short, long)]
    output: Option<PathBuf>,

    // ── Order form ───────────────────────────────────────────────────────
    /// Customer name (required).
    #[arg(long)]
    name: String,

    /// Product type.
    #[arg(long, default_value = "")]
    product: String,

    /// Text engraved on the back.
    #[arg(long, default_value = "")]
    back_text: String,

    /// Payment method.
    #[arg(long, default_value = "")]
    payment_method: String,

    /// Amount paid (required). A decimal comma is accepted.
    #[arg(long)]
    amount: String,

    /// Payment currency.
    #[arg(long, default_value = "")]
    currency: String,

    /// Payment reference number.
    #[arg(long, default_value = "")]
    reference: String,

    /// Delivery mode.
    #[arg(long, default_value = "")]
    delivery: String,

    /// Delivery address.
    #[arg(long, default_value = "")]
    address: String,

    /// Contact phone.
    #[arg(long, default_value = "")]
    phone: String,

    // ── Image settings ───────────────────────────────────────────────────
    /// Skip the upscale and restore steps.
    #[arg(long)]
    no_hd: bool,

    /// Brightness boost before the hosted steps (1.0–2.0).
    #[arg(long, default_value_t = 1.0)]
    shadow_reveal: f32,

    /// Final contrast factor (0.5–3.0).
    #[arg(long, default_value_t = 1.2)]
    contrast: f32,

    /// Final sharpness factor (0.0–5.0).
    #[arg(long, default_value_t = 2.0)]
    sharpness: f32,

    /// Downsample inputs above this many pixels (0 disables).
    #[arg(long, env = "ENGRAVE_MAX_PIXELS", default_value_t = 2_000_000)]
    max_pixels: u64,

    /// TOML file mapping upscale/restore/matte to models.
    #[arg(long, env = "ENGRAVE_STEPS")]
    steps: Option<PathBuf>,

    /// Interval between prediction status polls, in milliseconds.
    #[arg(long, env = "ENGRAVE_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Give up on a prediction after this many polls.
    #[arg(long, env = "ENGRAVE_MAX_POLLS", default_value_t = 300)]
    max_polls: u32,

    /// Stream step outputs instead of buffering the download.
    #[arg(long)]
    stream_downloads: bool,

    // ── Credentials ──────────────────────────────────────────────────────
    /// Inference API token.
    #[arg(long, env = "REPLICATE_API_TOKEN", hide_env_values = true)]
    replicate_token: Option<String>,

    /// Telegram bot token.
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_token: Option<String>,

    /// Telegram chat id.
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    telegram_chat: Option<String>,

    /// Google service-account JSON key file.
    #[arg(long, env = "GOOGLE_SERVICE_ACCOUNT_FILE")]
    service_account: Option<PathBuf>,

    /// Spreadsheet id.
    #[arg(long, env = "SHEET_ID")]
    sheet_id: Option<String>,

    /// Worksheet (tab) name.
    #[arg(long, env = "SHEET_TAB", default_value = "Sheet1")]
    sheet_tab: String,

    // ── Output control ───────────────────────────────────────────────────
    /// Print a JSON summary on stdout.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "ENGRAVE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "ENGRAVE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "ENGRAVE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
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

    // ── Build config ─────────────────────────────────────────────────────
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgress::new() as Arc<dyn SubmissionProgress>)
    } else {
        None
    };
    let config = build_config(&cli, progress).await?;
    let credentials = build_credentials(&cli).await?;

    let engraver = match Engraver::new(config, &credentials) {
        Ok(e) => e,
        Err(e @ EngraveError::MissingConfig { .. }) => anyhow::bail!("{}", e.user_message()),
        Err(e) => return Err(e).context("Failed to initialise"),
    };
    if engraver.sinks().is_empty() && !cli.quiet {
        eprintln!(
            "{} no Telegram or spreadsheet configured; the order will only be saved locally",
            dim("ℹ")
        );
    }

    let form = OrderForm {
        customer_name: cli.name.clone(),
        product: cli.product.clone(),
        back_text: cli.back_text.clone(),
        payment_method: cli.payment_method.clone(),
        currency: cli.currency.clone(),
        amount: cli.amount.clone(),
        reference: cli.reference.clone(),
        delivery_mode: cli.delivery.clone(),
        address: cli.address.clone(),
        phone: cli.phone.clone(),
    };

    // ── Captcha + submit ─────────────────────────────────────────────────
    let mut session = Session::new();
    let mut attempt = 0;
    let (outcome, path) = loop {
        attempt += 1;
        let value = tokio::task::block_in_place(|| ask_captcha(&session))?;
        let answer = session.captcha().answer(value);

        match engraver
            .submit_to_file(&mut session, &form, &answer, cli.input.as_str(), cli.output.as_deref())
            .await
        {
            Ok(done) => break done,
            Err(EngraveError::InvalidForm(FormError::WrongCaptcha))
                if attempt < CAPTCHA_ATTEMPTS =>
            {
                eprintln!("{} wrong answer, try again", red("✗"));
            }
            Err(e) => anyhow::bail!("{}", e.user_message()),
        }
    };

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let summary = serde_json::json!({
            "file": path.display().to_string(),
            "width": outcome.image.width,
            "height": outcome.image.height,
            "bytes": outcome.image.png.len(),
            "order": outcome.order,
            "warnings": outcome.warnings,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        for w in &outcome.warnings {
            eprintln!("{} {}", yellow("⚠"), w);
        }
        eprintln!(
            "{}  {}x{}  →  {}",
            if outcome.warnings.is_empty() {
                green("✔")
            } else {
                yellow("⚠")
            },
            outcome.image.width,
            outcome.image.height,
            bold(&path.display().to_string()),
        );
    }

    Ok(())
}

/// Prompt on stderr, read one line from stdin. Non-numbers count as wrong.
fn ask_captcha(session: &Session) -> Result<i64> {
    let mut stderr = io::stderr();
    write!(stderr, "{} {} ", bold("?"), session.captcha().question())?;
    stderr.flush()?;

    let mut line = String::new();
    let read = io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read captcha answer")?;
    if read == 0 {
        anyhow::bail!("No captcha answer given (stdin closed)");
    }
    Ok(line.trim().parse::<i64>().unwrap_or(i64::MIN))
}

/// Map CLI args to `EngraveConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<EngraveConfig> {
    let steps = match cli.steps {
        Some(ref path) => StepTable::load(path)
            .await
            .with_context(|| format!("Failed to load step table from {:?}", path))?,
        None => StepTable::default(),
    };

    let mut builder = EngraveConfig::builder()
        .hd_enabled(!cli.no_hd)
        .shadow_reveal(cli.shadow_reveal)
        .contrast(cli.contrast)
        .sharpness(cli.sharpness)
        .max_input_pixels(cli.max_pixels)
        .steps(steps)
        .poll_interval_ms(cli.poll_interval_ms)
        .max_polls(cli.max_polls)
        .stream_downloads(cli.stream_downloads);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Collect secrets; a sink whose settings are incomplete stays disabled.
async fn build_credentials(cli: &Cli) -> Result<Credentials> {
    let telegram =
        TelegramConfig::from_parts(cli.telegram_token.clone(), cli.telegram_chat.clone());

    let sheets = match (&cli.service_account, &cli.sheet_id) {
        (Some(path), Some(id)) if !id.trim().is_empty() => {
            let key = ServiceAccountKey::load(path)
                .await
                .with_context(|| format!("Failed to load service account key {:?}", path))?;
            Some(SheetsConfig::new(key, id.trim()).with_worksheet(cli.sheet_tab.clone()))
        }
        _ => None,
    };

    Ok(Credentials {
        replicate_api_token: cli.replicate_token.clone(),
        telegram,
        sheets,
    })
}
