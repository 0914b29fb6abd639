//! Submission entry points.
//!
//! [`Engraver`] owns everything that lives longer than one order: the HTTP
//! client, the validated configuration, the inference backend and the
//! configured sinks. A [`Session`] is borrowed for each submission and
//! driven through its state machine here; nothing else mutates it.
//!
//! ```text
//! form + captcha ─▶ validate ─▶ resolve photo ─▶ preprocess ─▶ remote steps
//!                                                                  │
//!                            publish ◀─ encode PNG ◀─ finish ◀────┘
//! ```

use crate::captcha::CaptchaAnswer;
use crate::config::{Credentials, EngraveConfig};
use crate::error::{EngraveError, SinkError};
use crate::order::{Order, OrderForm};
use crate::pipeline::input::{self, SourceImage};
use crate::pipeline::remote::{self, EncodedImage, InferenceBackend, ReplicateBackend};
use crate::pipeline::{encode, finish, preprocess};
use crate::publish::{self, Publication, Sink};
use crate::session::{FinishedImage, Session, SessionEvent};
use bytes::Bytes;
use chrono::Utc;
use image::DynamicImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where the customer photo comes from.
#[derive(Debug, Clone)]
pub enum PhotoInput {
    /// Local path or http(s) URL.
    Location(String),
    /// Bytes already in memory, e.g. a form upload.
    Upload(Bytes),
}

impl From<&str> for PhotoInput {
    fn from(s: &str) -> Self {
        PhotoInput::Location(s.to_string())
    }
}

impl From<String> for PhotoInput {
    fn from(s: String) -> Self {
        PhotoInput::Location(s)
    }
}

impl From<Bytes> for PhotoInput {
    fn from(b: Bytes) -> Self {
        PhotoInput::Upload(b)
    }
}

impl From<Vec<u8>> for PhotoInput {
    fn from(b: Vec<u8>) -> Self {
        PhotoInput::Upload(Bytes::from(b))
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub order: Order,
    pub image: FinishedImage,
    /// Sinks that failed. The image is valid regardless.
    pub warnings: Vec<SinkError>,
}

/// Long-lived submission handler.
pub struct Engraver {
    client: reqwest::Client,
    config: EngraveConfig,
    backend: Arc<dyn InferenceBackend>,
    sinks: Vec<Arc<dyn Sink>>,
}

impl std::fmt::Debug for Engraver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sinks: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("Engraver")
            .field("config", &self.config)
            .field("sinks", &sinks)
            .finish()
    }
}

impl Engraver {
    /// Build the production handler: Replicate backend plus whichever sinks
    /// the credentials enable.
    ///
    /// # Errors
    /// [`EngraveError::MissingConfig`] when no inference token is set.
    pub fn new(config: EngraveConfig, credentials: &Credentials) -> Result<Self, EngraveError> {
        let token = credentials.require_replicate_token()?;
        let client = build_client()?;
        let backend = Arc::new(ReplicateBackend::new(client.clone(), token, &config));
        let sinks = publish::sinks_from_credentials(&client, credentials);
        Ok(Self {
            client,
            config,
            backend,
            sinks,
        })
    }

    /// Assemble a handler from explicit parts.
    pub fn with_backend(
        config: EngraveConfig,
        backend: Arc<dyn InferenceBackend>,
        sinks: Vec<Arc<dyn Sink>>,
    ) -> Result<Self, EngraveError> {
        Ok(Self {
            client: build_client()?,
            config,
            backend,
            sinks,
        })
    }

    pub fn config(&self) -> &EngraveConfig {
        &self.config
    }

    pub fn sinks(&self) -> &[Arc<dyn Sink>] {
        &self.sinks
    }

    /// Run one order through validation, image work and publishing.
    ///
    /// The session moves `FormFilled → Validating → Processing` and ends in
    /// `Published` or `Error`. A validation failure returns it to
    /// `FormFilled`. Sinks run only after the image is finished, so a failed
    /// submission never publishes anything.
    ///
    /// # Errors
    /// * [`EngraveError::SessionBusy`] if the session holds a published
    ///   order that has not been reset.
    /// * [`EngraveError::InvalidForm`] for captcha or required-field problems.
    /// * Any input or remote error from the image pipeline.
    pub async fn submit(
        &self,
        session: &mut Session,
        form: &OrderForm,
        answer: &CaptchaAnswer,
        photo: impl Into<PhotoInput>,
    ) -> Result<SubmissionOutcome, EngraveError> {
        session.apply(SessionEvent::FormEdited);
        if !session.can_submit() {
            return Err(EngraveError::SessionBusy {
                state: session.state(),
            });
        }
        session.apply(SessionEvent::Submit);

        let order = match validate(session, form, answer) {
            Ok(order) => order,
            Err(e) => {
                debug!(error = %e, "Validation failed");
                session.apply(SessionEvent::ValidationFailed);
                return Err(e.into());
            }
        };
        session.apply(SessionEvent::ValidationPassed);
        info!(customer = %order.customer_name(), "Order accepted, processing photo");

        let progress = self.config.progress_callback.as_ref();
        if let Some(cb) = progress {
            cb.on_submission_start(self.config.steps.plan(self.config.hd_enabled).len());
        }

        let finished = match self.produce(photo.into(), &order).await {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "Processing failed");
                session.apply(SessionEvent::ProcessingFailed);
                if let Some(cb) = progress {
                    cb.on_submission_complete(false);
                }
                return Err(e);
            }
        };

        if let Some(cb) = progress {
            cb.on_stage_start("publish");
        }
        let publication = Publication {
            order: order.clone(),
            png: finished.png.clone(),
            filename: finished.filename.clone(),
            created_at: Utc::now(),
        };
        let warnings = publish::publish_all(&self.sinks, &publication, progress).await;
        if let Some(cb) = progress {
            cb.on_stage_complete("publish");
        }

        session.record_success(order.clone(), finished.clone());
        if let Some(cb) = progress {
            cb.on_submission_complete(true);
        }

        Ok(SubmissionOutcome {
            order,
            image: finished,
            warnings,
        })
    }

    /// [`submit`](Self::submit), then write the PNG atomically.
    ///
    /// With `output = None` the file is written to the current directory
    /// under the order's download file name. Nothing is written when the
    /// submission fails.
    pub async fn submit_to_file(
        &self,
        session: &mut Session,
        form: &OrderForm,
        answer: &CaptchaAnswer,
        photo: impl Into<PhotoInput>,
        output: Option<&Path>,
    ) -> Result<(SubmissionOutcome, PathBuf), EngraveError> {
        let outcome = self.submit(session, form, answer, photo).await?;
        let path = match output {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(&outcome.image.filename),
        };
        write_atomic(&path, &outcome.image.png).await?;
        info!(path = %path.display(), "Wrote finished image");
        Ok((outcome, path))
    }

    /// Resolve, enhance, finish and encode.
    async fn produce(
        &self,
        photo: PhotoInput,
        order: &Order,
    ) -> Result<FinishedImage, EngraveError> {
        let start = Instant::now();
        let source = match photo {
            PhotoInput::Location(loc) => input::resolve_input(&loc, &self.client).await?,
            PhotoInput::Upload(bytes) => input::decode_source(bytes)?,
        };

        let image = self.process_image(source).await?;
        let (width, height) = (image.width(), image.height());

        let png = tokio::task::spawn_blocking(move || encode::encode_png(&image))
            .await
            .map_err(|e| EngraveError::Internal(format!("encode task panicked: {e}")))?
            .map_err(|e| EngraveError::Internal(format!("PNG encoding failed: {e}")))?;

        info!(
            "Finished {}x{} image ({} bytes) in {}ms",
            width,
            height,
            png.len(),
            start.elapsed().as_millis()
        );
        Ok(FinishedImage {
            png,
            filename: order.download_filename(),
            width,
            height,
        })
    }

    /// The image part of a submission, without any session bookkeeping.
    pub async fn process_image(&self, source: SourceImage) -> Result<DynamicImage, EngraveError> {
        let cfg = &self.config;
        let progress = cfg.progress_callback.as_ref();

        // ── Pre-process ──────────────────────────────────────────────────
        if let Some(cb) = progress {
            cb.on_stage_start("preprocess");
        }
        let SourceImage { bytes, format, image } = source;
        let (shadow, ceiling) = (cfg.shadow_reveal, cfg.max_input_pixels);
        let pre =
            tokio::task::spawn_blocking(move || preprocess::preprocess(image, shadow, ceiling))
                .await
                .map_err(|e| EngraveError::Internal(format!("preprocess task panicked: {e}")))?;

        let mut current = if pre.changed {
            let img = pre.image.clone();
            let png = tokio::task::spawn_blocking(move || encode::encode_png(&img))
                .await
                .map_err(|e| EngraveError::Internal(format!("encode task panicked: {e}")))?
                .map_err(|e| EngraveError::Internal(format!("PNG encoding failed: {e}")))?;
            EncodedImage::png(png)
        } else {
            EncodedImage {
                bytes,
                mime: format.to_mime_type(),
            }
        };
        let mut decoded = pre.image;
        if let Some(cb) = progress {
            cb.on_stage_complete("preprocess");
        }

        // ── Remote steps ─────────────────────────────────────────────────
        let plan = cfg.steps.plan(cfg.hd_enabled);
        if plan.is_empty() {
            warn!("No remote steps configured; finishing the photo as is");
        }
        let last = plan.len().saturating_sub(1);
        for (i, (step, spec)) in plan.into_iter().enumerate() {
            if let Some(cb) = progress {
                cb.on_stage_start(step.as_str());
            }
            decoded =
                remote::run_step(self.backend.as_ref(), &self.client, step, spec, &current).await?;
            if i < last {
                let img = decoded.clone();
                let png = tokio::task::spawn_blocking(move || encode::encode_png(&img))
                    .await
                    .map_err(|e| EngraveError::Internal(format!("encode task panicked: {e}")))?
                    .map_err(|e| EngraveError::Internal(format!("PNG encoding failed: {e}")))?;
                current = EncodedImage::png(png);
            }
            if let Some(cb) = progress {
                cb.on_stage_complete(step.as_str());
            }
        }

        // ── Finish ───────────────────────────────────────────────────────
        if let Some(cb) = progress {
            cb.on_stage_start("finish");
        }
        let (contrast, sharpness) = (cfg.contrast, cfg.sharpness);
        let finished =
            tokio::task::spawn_blocking(move || finish::finish(&decoded, contrast, sharpness))
                .await
                .map_err(|e| EngraveError::Internal(format!("finish task panicked: {e}")))?;
        if let Some(cb) = progress {
            cb.on_stage_complete("finish");
        }
        Ok(finished)
    }
}

/// Synchronous wrapper around [`Engraver::submit`].
///
/// Creates a temporary tokio runtime internally.
pub fn submit_sync(
    engraver: &Engraver,
    session: &mut Session,
    form: &OrderForm,
    answer: &CaptchaAnswer,
    photo: impl Into<PhotoInput>,
) -> Result<SubmissionOutcome, EngraveError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| EngraveError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(engraver.submit(session, form, answer, photo))
}

/// Captcha first, then the form fields.
fn validate(
    session: &Session,
    form: &OrderForm,
    answer: &CaptchaAnswer,
) -> Result<Order, crate::error::FormError> {
    session.captcha().check(answer)?;
    form.validate()
}

fn build_client() -> Result<reqwest::Client, EngraveError> {
    reqwest::Client::builder()
        .user_agent(concat!("engrave-desk/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| EngraveError::Internal(format!("HTTP client: {e}")))
}

/// Write through a temp file in the target directory, then rename over
/// the destination.
async fn write_atomic(path: &Path, data: &Bytes) -> Result<(), EngraveError> {
    let write_err = |e: std::io::Error| EngraveError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir).await.map_err(write_err)?;

    let target = path.to_path_buf();
    let data = data.clone();
    tokio::task::spawn_blocking(move || {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(|e| EngraveError::Internal(format!("write task panicked: {e}")))?
    .map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::Captcha;
    use crate::config::{StepKind, StepSpec, StepTable};
    use crate::error::FormError;
    use crate::pipeline::remote::InferenceOutput;
    use crate::session::SessionState;
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Answers every step with a fixed RGBA cutout and records what it saw.
    struct CutoutBackend {
        calls: Mutex<Vec<(StepKind, &'static str)>>,
    }

    impl CutoutBackend {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for CutoutBackend {
        async fn run(
            &self,
            step: StepKind,
            _spec: &StepSpec,
            image: &EncodedImage,
        ) -> Result<InferenceOutput, EngraveError> {
            self.calls.lock().unwrap().push((step, image.mime));
            let cutout =
                DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 6, Rgba([90, 100, 110, 128])));
            let png = encode::encode_png(&cutout).unwrap();
            Ok(InferenceOutput::Reader(Box::new(Cursor::new(png.to_vec()))))
        }
    }

    fn session() -> Session {
        Session::with_captcha(Captcha::generate_with(&mut StdRng::seed_from_u64(3)))
    }

    fn correct_answer(session: &Session) -> CaptchaAnswer {
        let (a, b) = session.captcha().operands();
        session.captcha().answer(i64::from(a) + i64::from(b))
    }

    fn form() -> OrderForm {
        OrderForm {
            customer_name: "José Pérez".into(),
            amount: "35,50".into(),
            ..Default::default()
        }
    }

    fn photo() -> Bytes {
        let img =
            DynamicImage::ImageRgb8(image::RgbImage::from_pixel(20, 10, image::Rgb([30, 60, 90])));
        encode::encode_png(&img).unwrap()
    }

    fn engraver(backend: Arc<CutoutBackend>) -> Engraver {
        let config = EngraveConfig::builder().build().unwrap();
        Engraver::with_backend(config, backend, Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn successful_submission_publishes_session() {
        let backend = Arc::new(CutoutBackend::new());
        let engraver = engraver(backend.clone());
        let mut session = session();
        let answer = correct_answer(&session);

        let outcome = engraver.submit(&mut session, &form(), &answer, photo()).await.unwrap();

        assert_eq!(session.state(), SessionState::Published);
        assert_eq!(outcome.image.filename, "ela_jos_p_rez.png");
        assert_eq!((outcome.image.width, outcome.image.height), (8, 6));
        assert!(outcome.warnings.is_empty());
        assert_eq!(session.result(), Some(&outcome.image));

        let decoded = image::load_from_memory(&outcome.image.png).unwrap();
        assert!(decoded.color().has_alpha());

        // Untouched upload is sent as-is; later steps get PNG.
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(StepKind::Upscale, "image/png"), (StepKind::Matte, "image/png")]
        );
    }

    #[tokio::test]
    async fn hd_off_runs_only_matte() {
        let backend = Arc::new(CutoutBackend::new());
        let config = EngraveConfig::builder().hd_enabled(false).build().unwrap();
        let engraver = Engraver::with_backend(config, backend.clone(), Vec::new()).unwrap();
        let mut session = session();
        let answer = correct_answer(&session);

        engraver.submit(&mut session, &form(), &answer, photo()).await.unwrap();
        let steps: Vec<StepKind> = backend.calls.lock().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(steps, vec![StepKind::Matte]);
    }

    #[tokio::test]
    async fn wrong_captcha_returns_to_form() {
        let backend = Arc::new(CutoutBackend::new());
        let engraver = engraver(backend.clone());
        let mut session = session();
        let (a, b) = session.captcha().operands();
        let wrong = session.captcha().answer(i64::from(a) + i64::from(b) + 1);

        let err = engraver.submit(&mut session, &form(), &wrong, photo()).await.unwrap_err();
        assert!(matches!(err, EngraveError::InvalidForm(FormError::WrongCaptcha)));
        assert_eq!(session.state(), SessionState::FormFilled);
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_amount_is_rejected_before_processing() {
        let backend = Arc::new(CutoutBackend::new());
        let engraver = engraver(backend.clone());
        let mut session = session();
        let answer = correct_answer(&session);
        let form = OrderForm {
            customer_name: "Ana".into(),
            ..Default::default()
        };

        let err = engraver.submit(&mut session, &form, &answer, photo()).await.unwrap_err();
        assert!(matches!(err, EngraveError::InvalidForm(FormError::MissingAmount)));
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn published_session_must_be_reset() {
        let engraver = engraver(Arc::new(CutoutBackend::new()));
        let mut session = session();
        let answer = correct_answer(&session);
        engraver.submit(&mut session, &form(), &answer, photo()).await.unwrap();

        let err = engraver.submit(&mut session, &form(), &answer, photo()).await.unwrap_err();
        assert!(matches!(err, EngraveError::SessionBusy { .. }));
        assert_eq!(session.state(), SessionState::Published);
    }

    #[tokio::test]
    async fn no_steps_still_finishes() {
        let backend = Arc::new(CutoutBackend::new());
        let config = EngraveConfig::builder().steps(StepTable::empty()).build().unwrap();
        let engraver = Engraver::with_backend(config, backend.clone(), Vec::new()).unwrap();
        let source = input::decode_source(photo()).unwrap();

        let out = engraver.process_image(source).await.unwrap();
        assert_eq!((out.width(), out.height()), (20, 10));
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out.png");
        write_atomic(&target, &Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn missing_token_blocks_construction() {
        let config = EngraveConfig::builder().build().unwrap();
        let err = Engraver::new(config, &Credentials::default()).unwrap_err();
        assert!(matches!(err, EngraveError::MissingConfig { .. }));
    }
}
