//! Error types for the engrave-desk library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`EngraveError`] — **Fatal**: the submission cannot produce an image
//!   (missing API token, bad form input, a remote step failed). Returned as
//!   `Err(EngraveError)` from [`crate::process::Engraver::submit`] and friends. No
//!   partial result is ever published alongside one of these.
//!
//! * [`SinkError`] — **Non-fatal**: the image is finished but one of the
//!   delivery targets (messaging channel, spreadsheet) refused it. Stored in
//!   [`crate::process::SubmissionOutcome::warnings`] so the caller can still
//!   show and save the image.

use crate::session::SessionState;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the engrave-desk library.
#[derive(Debug, Error)]
pub enum EngraveError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// A setting required for processing is absent.
    #[error("Missing configuration '{key}'.\n{hint}")]
    MissingConfig { key: String, hint: String },

    /// Builder validation or step-table parsing failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Form errors ───────────────────────────────────────────────────────
    /// The order form did not pass validation.
    #[error("{0}")]
    InvalidForm(#[from] FormError),

    /// The session is not in a state that accepts a submission.
    #[error("A new order must be started before submitting again (session is {state})")]
    SessionBusy { state: SessionState },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Source photo was not found at the given path.
    #[error("Image file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Source photo URL could not be downloaded.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Bytes at some stage did not decode as an image.
    #[error("{stage}: image could not be decoded: {detail}")]
    UndecodableImage { stage: String, detail: String },

    // ── Remote errors ─────────────────────────────────────────────────────
    /// Transport-level failure talking to the inference service.
    #[error("{step}: request to inference service failed: {reason}")]
    RemoteRequest { step: String, reason: String },

    /// The inference service (or output host) answered with a non-2xx status.
    #[error("{step}: inference service returned HTTP {status}: {body}")]
    RemoteStatus {
        step: String,
        status: u16,
        body: String,
    },

    /// The prediction finished in a failed or canceled state.
    #[error("{step}: prediction {status}: {detail}")]
    PredictionFailed {
        step: String,
        status: String,
        detail: String,
    },

    /// The prediction never reached a terminal state.
    #[error("{step}: prediction still running after {polls} polls")]
    PredictionStalled { step: String, polls: u32 },

    /// The service returned an output shape the client cannot turn into bytes.
    #[error("{step}: unrecognized output from inference service ({kind})")]
    UnrecognizedOutput { step: String, kind: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write the finished PNG.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngraveError {
    /// True for failures of the remote enhancement stage.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            EngraveError::RemoteRequest { .. }
                | EngraveError::RemoteStatus { .. }
                | EngraveError::PredictionFailed { .. }
                | EngraveError::PredictionStalled { .. }
                | EngraveError::UnrecognizedOutput { .. }
                | EngraveError::UndecodableImage { .. }
        )
    }

    /// Text shown to the operator for this error.
    ///
    /// Configuration and form problems are shown verbatim so they can be
    /// fixed inline. Everything else is reported as a technical error with
    /// the underlying detail appended.
    pub fn user_message(&self) -> String {
        match self {
            EngraveError::MissingConfig { .. }
            | EngraveError::InvalidConfig(_)
            | EngraveError::InvalidForm(_)
            | EngraveError::SessionBusy { .. } => self.to_string(),
            other => format!("A technical error occurred: {other}"),
        }
    }
}

/// Problems with the order form itself. Submission stays editable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("Customer name is required")]
    MissingCustomerName,

    #[error("Payment amount is required")]
    MissingAmount,

    #[error("Payment amount '{0}' is not a number")]
    InvalidAmount(String),

    #[error("Captcha answer is wrong")]
    WrongCaptcha,

    /// The answer was computed for a captcha that has since been replaced.
    #[error("Captcha has expired, solve the new one")]
    StaleCaptcha,
}

/// A non-fatal delivery failure for one sink.
///
/// Surfaced to the operator as a warning; the finished image is unaffected.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum SinkError {
    /// The sink endpoint could not be reached.
    #[error("{sink}: request failed: {detail}")]
    Transport { sink: String, detail: String },

    /// The sink answered with an unexpected status.
    #[error("{sink}: HTTP {status}: {body}")]
    Rejected {
        sink: String,
        status: u16,
        body: String,
    },

    /// Credentials could not be loaded or exchanged for a token.
    #[error("{sink}: authentication failed: {detail}")]
    Auth { sink: String, detail: String },
}

impl SinkError {
    /// Name of the sink that produced this error.
    pub fn sink(&self) -> &str {
        match self {
            SinkError::Transport { sink, .. }
            | SinkError::Rejected { sink, .. }
            | SinkError::Auth { sink, .. } => sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_display() {
        let e = EngraveError::MissingConfig {
            key: "REPLICATE_API_TOKEN".into(),
            hint: "Set it in the environment.".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("REPLICATE_API_TOKEN"), "got: {msg}");
    }

    #[test]
    fn form_errors_are_shown_verbatim() {
        let e = EngraveError::from(FormError::WrongCaptcha);
        assert_eq!(e.user_message(), "Captcha answer is wrong");
        assert!(!e.is_remote());
    }

    #[test]
    fn remote_errors_become_generic_message() {
        let e = EngraveError::UnrecognizedOutput {
            step: "matte".into(),
            kind: "number".into(),
        };
        assert!(e.is_remote());
        let msg = e.user_message();
        assert!(msg.starts_with("A technical error occurred"), "got: {msg}");
        assert!(msg.contains("matte"));
    }

    #[test]
    fn remote_status_display() {
        let e = EngraveError::RemoteStatus {
            step: "upscale".into(),
            status: 422,
            body: "invalid version".into(),
        };
        assert!(e.to_string().contains("HTTP 422"));
        assert!(e.to_string().contains("invalid version"));
    }

    #[test]
    fn sink_error_reports_sink_name() {
        let e = SinkError::Rejected {
            sink: "telegram".into(),
            status: 400,
            body: "chat not found".into(),
        };
        assert_eq!(e.sink(), "telegram");
        assert!(e.to_string().contains("chat not found"));
    }
}
