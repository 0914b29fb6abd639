//! # engrave-desk
//!
//! Turn a customer photo into a laser-engraving-ready PNG and hand the
//! order to the shop's messaging channel and spreadsheet.
//!
//! ## Why this crate?
//!
//! Engraving a portrait on stainless steel needs a clean cutout with strong
//! local contrast. Phone photos are small, noisy and sit on busy
//! backgrounds. This crate sends the photo through hosted image models
//! (super-resolution, optional face restoration, background removal), then
//! applies a deterministic contrast and sharpness finish locally so the
//! result is the same every time for the same cutout.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Order form + photo
//!  │
//!  ├─ 1. Validate   required fields + arithmetic captcha
//!  ├─ 2. Preprocess shadow reveal, pixel ceiling (spawn_blocking)
//!  ├─ 3. Remote     upscale → restore → matte, one hosted call each
//!  ├─ 4. Finish     contrast then sharpness on the RGBA cutout
//!  └─ 5. Publish    PNG file, Telegram document, spreadsheet row
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use engrave_desk::{Credentials, EngraveConfig, Engraver, OrderForm, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let credentials = Credentials {
//!         replicate_api_token: std::env::var("REPLICATE_API_TOKEN").ok(),
//!         ..Default::default()
//!     };
//!     let engraver = Engraver::new(EngraveConfig::default(), &credentials)?;
//!
//!     let mut session = Session::new();
//!     let (a, b) = session.captcha().operands();
//!     let answer = session.captcha().answer(i64::from(a) + i64::from(b));
//!     let form = OrderForm {
//!         customer_name: "Ana Lopez".into(),
//!         amount: "45".into(),
//!         ..Default::default()
//!     };
//!
//!     let outcome = engraver.submit(&mut session, &form, &answer, "portrait.jpg").await?;
//!     std::fs::write(&outcome.image.filename, &outcome.image.png)?;
//!     for warning in &outcome.warnings {
//!         eprintln!("warning: {warning}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `engrave` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! engrave-desk = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod captcha;
pub mod config;
pub mod error;
pub mod order;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod publish;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use captcha::{Captcha, CaptchaAnswer};
pub use config::{
    Credentials, EngraveConfig, EngraveConfigBuilder, SheetsConfig, ServiceAccountKey, StepKind,
    StepSpec, StepTable, TelegramConfig,
};
pub use error::{EngraveError, FormError, SinkError};
pub use order::{Order, OrderForm};
pub use pipeline::remote::{InferenceBackend, InferenceOutput};
pub use process::{submit_sync, Engraver, PhotoInput, SubmissionOutcome};
pub use progress::{NoopProgress, ProgressCallback, SubmissionProgress};
pub use publish::{Publication, Sink};
pub use session::{transition, FinishedImage, Session, SessionEvent, SessionState};
