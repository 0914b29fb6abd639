//! Configuration types for an engraving submission.
//!
//! Processing behaviour is controlled through [`EngraveConfig`], built via
//! [`EngraveConfigBuilder`]. Secrets live apart from it in [`Credentials`]
//! so a config can be logged with `{:?}` without leaking tokens.
//!
//! Which hosted model runs for each logical step is not compiled in: the
//! [`StepTable`] maps `upscale`, `restore` and `matte` to a model id and its
//! parameters, and is loaded once at startup from TOML (or the built-in
//! defaults).

use crate::error::EngraveError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

/// Slider range for the shadow-reveal brightness factor.
pub const SHADOW_REVEAL_RANGE: (f32, f32) = (1.0, 2.0);
/// Slider range for the contrast factor.
pub const CONTRAST_RANGE: (f32, f32) = (0.5, 3.0);
/// Slider range for the sharpness factor.
pub const SHARPNESS_RANGE: (f32, f32) = (0.0, 5.0);

/// Default Replicate API root.
pub const DEFAULT_REPLICATE_BASE_URL: &str = "https://api.replicate.com/v1";

/// Configuration for one engraving submission.
///
/// # Example
/// ```rust
/// use engrave_desk::EngraveConfig;
///
/// let config = EngraveConfig::builder()
///     .hd_enabled(false)
///     .contrast(1.5)
///     .sharpness(1.0)
///     .build()
///     .unwrap();
/// assert!(!config.hd_enabled);
/// ```
#[derive(Clone)]
pub struct EngraveConfig {
    /// Run the super-resolution (and face-restore) steps. Default: true.
    pub hd_enabled: bool,

    /// Brightness factor applied before any remote call. Range 1.0–2.0, default 1.0.
    ///
    /// Helps background removal separate dark clothing from a dark
    /// background. 1.0 skips the step entirely.
    pub shadow_reveal: f32,

    /// Contrast factor for the finished cutout. Range 0.5–3.0, default 1.2.
    pub contrast: f32,

    /// Sharpness factor for the finished cutout. Range 0.0–5.0, default 2.0.
    pub sharpness: f32,

    /// Pixel-count ceiling for the image sent to the first remote step.
    /// Default: 2 000 000. 0 disables downsampling.
    pub max_input_pixels: u64,

    /// Logical step → hosted model mapping.
    pub steps: StepTable,

    /// Delay between prediction status polls. Default: 1000 ms.
    pub poll_interval_ms: u64,

    /// Polls before a running prediction is reported as stalled. Default: 300.
    pub max_polls: u32,

    /// Encoded inputs above this size are uploaded through the files API
    /// instead of being inlined as a data URI. Default: 256 KiB.
    pub upload_threshold_bytes: usize,

    /// Have the backend hand back URL outputs as a body stream instead of
    /// the bare URL. Default: false.
    pub stream_downloads: bool,

    /// Inference API root. Default: [`DEFAULT_REPLICATE_BASE_URL`].
    pub replicate_base_url: String,

    /// Optional stage-level progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for EngraveConfig {
    fn default() -> Self {
        Self {
            hd_enabled: true,
            shadow_reveal: 1.0,
            contrast: 1.2,
            sharpness: 2.0,
            max_input_pixels: 2_000_000,
            steps: StepTable::default(),
            poll_interval_ms: 1000,
            max_polls: 300,
            upload_threshold_bytes: 256 * 1024,
            stream_downloads: false,
            replicate_base_url: DEFAULT_REPLICATE_BASE_URL.to_string(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for EngraveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngraveConfig")
            .field("hd_enabled", &self.hd_enabled)
            .field("shadow_reveal", &self.shadow_reveal)
            .field("contrast", &self.contrast)
            .field("sharpness", &self.sharpness)
            .field("max_input_pixels", &self.max_input_pixels)
            .field("steps", &self.steps)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_polls", &self.max_polls)
            .field("upload_threshold_bytes", &self.upload_threshold_bytes)
            .field("stream_downloads", &self.stream_downloads)
            .field("replicate_base_url", &self.replicate_base_url)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ProgressCallback>"),
            )
            .finish()
    }
}

impl EngraveConfig {
    /// Create a new builder for `EngraveConfig`.
    pub fn builder() -> EngraveConfigBuilder {
        EngraveConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`EngraveConfig`]. Slider values are clamped into range.
#[derive(Debug)]
pub struct EngraveConfigBuilder {
    config: EngraveConfig,
}

impl EngraveConfigBuilder {
    pub fn hd_enabled(mut self, v: bool) -> Self {
        self.config.hd_enabled = v;
        self
    }

    pub fn shadow_reveal(mut self, f: f32) -> Self {
        self.config.shadow_reveal = f.clamp(SHADOW_REVEAL_RANGE.0, SHADOW_REVEAL_RANGE.1);
        self
    }

    pub fn contrast(mut self, f: f32) -> Self {
        self.config.contrast = f.clamp(CONTRAST_RANGE.0, CONTRAST_RANGE.1);
        self
    }

    pub fn sharpness(mut self, f: f32) -> Self {
        self.config.sharpness = f.clamp(SHARPNESS_RANGE.0, SHARPNESS_RANGE.1);
        self
    }

    pub fn max_input_pixels(mut self, px: u64) -> Self {
        self.config.max_input_pixels = px;
        self
    }

    pub fn steps(mut self, steps: StepTable) -> Self {
        self.config.steps = steps;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn max_polls(mut self, n: u32) -> Self {
        self.config.max_polls = n.max(1);
        self
    }

    pub fn upload_threshold_bytes(mut self, n: usize) -> Self {
        self.config.upload_threshold_bytes = n;
        self
    }

    pub fn stream_downloads(mut self, v: bool) -> Self {
        self.config.stream_downloads = v;
        self
    }

    pub fn replicate_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.replicate_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngraveConfig, EngraveError> {
        let c = &self.config;
        for (name, value) in [
            ("shadow_reveal", c.shadow_reveal),
            ("contrast", c.contrast),
            ("sharpness", c.sharpness),
        ] {
            if !value.is_finite() {
                return Err(EngraveError::InvalidConfig(format!(
                    "{name} must be a finite number, got {value}"
                )));
            }
        }
        if !c.replicate_base_url.starts_with("http://")
            && !c.replicate_base_url.starts_with("https://")
        {
            return Err(EngraveError::InvalidConfig(format!(
                "inference base URL must be http(s), got '{}'",
                c.replicate_base_url
            )));
        }
        c.steps.validate()?;
        Ok(self.config)
    }
}

// ── Step table ───────────────────────────────────────────────────────────

/// Logical remote step. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Super-resolution.
    Upscale,
    /// Face restoration.
    Restore,
    /// Background removal producing the cutout.
    Matte,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Upscale => "upscale",
            StepKind::Restore => "restore",
            StepKind::Matte => "matte",
        }
    }

    /// Whether the step belongs to the optional HD group.
    pub fn is_hd(&self) -> bool {
        matches!(self, StepKind::Upscale | StepKind::Restore)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_image_field() -> String {
    "image".to_string()
}

/// One hosted model invocation: which model, and with what fixed inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// `owner/name` or `owner/name:version`.
    pub model: String,

    /// Input field that receives the image reference.
    #[serde(default = "default_image_field")]
    pub image_field: String,

    /// Model-specific scalar/boolean inputs sent with every call.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl StepSpec {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            image_field: default_image_field(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Split the model id into `(owner/name, version)`.
    pub fn model_ref(&self) -> (&str, Option<&str>) {
        match self.model.split_once(':') {
            Some((name, version)) => (name, Some(version)),
            None => (self.model.as_str(), None),
        }
    }
}

/// Mapping from each logical step to the hosted model that implements it.
///
/// A step absent from the table is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTable {
    #[serde(default)]
    pub upscale: Option<StepSpec>,
    #[serde(default)]
    pub restore: Option<StepSpec>,
    #[serde(default)]
    pub matte: Option<StepSpec>,
}

impl Default for StepTable {
    fn default() -> Self {
        Self {
            upscale: Some(
                StepSpec::new(
                    "nightmareai/real-esrgan:42fed1c4974146d4d2414e2be2c5277c7fcf05fcc3a73abf41610695738c1d7b",
                )
                .param("scale", 2)
                .param("face_enhance", true),
            ),
            restore: None,
            matte: Some(StepSpec::new("bria/remove-background").param("preserve_alpha", true)),
        }
    }
}

impl StepTable {
    /// A table with no steps: the pipeline becomes purely local.
    pub fn empty() -> Self {
        Self {
            upscale: None,
            restore: None,
            matte: None,
        }
    }

    pub fn get(&self, kind: StepKind) -> Option<&StepSpec> {
        match kind {
            StepKind::Upscale => self.upscale.as_ref(),
            StepKind::Restore => self.restore.as_ref(),
            StepKind::Matte => self.matte.as_ref(),
        }
    }

    /// The steps to run, in execution order.
    pub fn plan(&self, hd_enabled: bool) -> Vec<(StepKind, &StepSpec)> {
        [StepKind::Upscale, StepKind::Restore, StepKind::Matte]
            .into_iter()
            .filter(|k| hd_enabled || !k.is_hd())
            .filter_map(|k| self.get(k).map(|spec| (k, spec)))
            .collect()
    }

    /// Parse a TOML step table.
    pub fn from_toml_str(s: &str) -> Result<Self, EngraveError> {
        let table: StepTable = toml::from_str(s)
            .map_err(|e| EngraveError::InvalidConfig(format!("step table: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    /// Read and parse a TOML step table from disk.
    pub async fn load(path: &Path) -> Result<Self, EngraveError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngraveError::InvalidConfig(format!("cannot read step table {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), EngraveError> {
        for kind in [StepKind::Upscale, StepKind::Restore, StepKind::Matte] {
            if let Some(spec) = self.get(kind) {
                let (name, version) = spec.model_ref();
                if name.split('/').filter(|p| !p.is_empty()).count() != 2 {
                    return Err(EngraveError::InvalidConfig(format!(
                        "{kind}: model must look like owner/name[:version], got '{}'",
                        spec.model
                    )));
                }
                if version == Some("") {
                    return Err(EngraveError::InvalidConfig(format!(
                        "{kind}: empty version in '{}'",
                        spec.model
                    )));
                }
                if spec.image_field.is_empty() {
                    return Err(EngraveError::InvalidConfig(format!(
                        "{kind}: image_field must not be empty"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

/// External secrets. Absence of a sink section disables that sink; absence
/// of the inference token blocks processing.
#[derive(Clone, Default)]
pub struct Credentials {
    pub replicate_api_token: Option<String>,
    pub telegram: Option<TelegramConfig>,
    pub sheets: Option<SheetsConfig>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field(
                "replicate_api_token",
                &self.replicate_api_token.as_ref().map(|_| "<redacted>"),
            )
            .field("telegram", &self.telegram)
            .field("sheets", &self.sheets)
            .finish()
    }
}

impl Credentials {
    /// The inference token, or the blocking configuration error.
    pub fn require_replicate_token(&self) -> Result<&str, EngraveError> {
        match self.replicate_api_token.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(t),
            _ => Err(EngraveError::MissingConfig {
                key: "REPLICATE_API_TOKEN".into(),
                hint: "Processing needs an inference API token. Set REPLICATE_API_TOKEN.".into(),
            }),
        }
    }
}

/// Default Telegram Bot API root.
pub const DEFAULT_TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

/// Messaging-channel settings.
#[derive(Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Numeric id or `@channel` name.
    pub chat_id: String,
    pub api_base: String,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_base: DEFAULT_TELEGRAM_BASE_URL.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Both values present and non-blank.
    pub fn from_parts(token: Option<String>, chat_id: Option<String>) -> Option<Self> {
        match (token, chat_id) {
            (Some(t), Some(c)) if !t.trim().is_empty() && !c.trim().is_empty() => {
                Some(Self::new(t.trim(), c.trim()))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Default Sheets v4 API root.
pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com/v4";

/// Fields of a Google service-account JSON key that the token exchange needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    pub fn from_json(s: &str) -> Result<Self, EngraveError> {
        serde_json::from_str(s)
            .map_err(|e| EngraveError::InvalidConfig(format!("service account key: {e}")))
    }

    pub async fn load(path: &Path) -> Result<Self, EngraveError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngraveError::InvalidConfig(format!(
                "cannot read service account key {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&content)
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// Spreadsheet sink settings.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub key: ServiceAccountKey,
    pub spreadsheet_id: String,
    /// Tab the row is appended to.
    pub worksheet: String,
    pub api_base: String,
}

impl SheetsConfig {
    pub fn new(key: ServiceAccountKey, spreadsheet_id: impl Into<String>) -> Self {
        Self {
            key,
            spreadsheet_id: spreadsheet_id.into(),
            worksheet: "Sheet1".to_string(),
            api_base: DEFAULT_SHEETS_BASE_URL.to_string(),
        }
    }

    pub fn with_worksheet(mut self, name: impl Into<String>) -> Self {
        self.worksheet = name.into();
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }
}
