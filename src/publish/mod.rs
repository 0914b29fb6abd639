//! Result publishing: optional delivery of the finished order.
//!
//! Each [`Sink`] is built only when its configuration is present. Sinks run
//! one after another once the image is finished. A failing sink never
//! affects the image or the other sinks; its [`SinkError`] is handed back
//! as a warning.
//!
//! * [`telegram`] — the PNG as a document with a formatted caption
//! * [`sheets`]   — one appended spreadsheet row per order

pub mod sheets;
pub mod telegram;

use crate::config::Credentials;
use crate::error::SinkError;
use crate::order::Order;
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub use sheets::SheetsSink;
pub use telegram::TelegramSink;

/// Everything a sink may deliver for one order.
#[derive(Debug, Clone)]
pub struct Publication {
    pub order: Order,
    pub png: Bytes,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// A downstream delivery target.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs and warnings.
    fn name(&self) -> &str;

    async fn publish(&self, publication: &Publication) -> Result<(), SinkError>;
}

/// Build the sinks whose configuration is present.
pub fn sinks_from_credentials(
    client: &reqwest::Client,
    credentials: &Credentials,
) -> Vec<Arc<dyn Sink>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();

    match &credentials.telegram {
        Some(cfg) => sinks.push(Arc::new(TelegramSink::new(client.clone(), cfg.clone()))),
        None => info!("Messaging sink disabled: no bot token / chat id configured"),
    }
    match &credentials.sheets {
        Some(cfg) => sinks.push(Arc::new(SheetsSink::new(client.clone(), cfg.clone()))),
        None => info!("Spreadsheet sink disabled: no service account configured"),
    }

    sinks
}

/// Deliver to every sink in order, collecting failures.
pub async fn publish_all(
    sinks: &[Arc<dyn Sink>],
    publication: &Publication,
    progress: Option<&ProgressCallback>,
) -> Vec<SinkError> {
    let mut warnings = Vec::new();
    for sink in sinks {
        let result = sink.publish(publication).await;
        if let Some(cb) = progress {
            let msg = result.as_ref().err().map(|e| e.to_string());
            cb.on_sink_result(sink.name(), msg.as_deref());
        }
        match result {
            Ok(()) => info!(sink = sink.name(), "Order published"),
            Err(e) => {
                warn!(sink = sink.name(), error = %e, "Sink failed");
                warnings.push(e);
            }
        }
    }
    warnings
}

/// Strip the request URL from a reqwest error; URLs can carry tokens.
pub(crate) fn transport_error(sink: &str, e: reqwest::Error) -> SinkError {
    SinkError::Transport {
        sink: sink.to_string(),
        detail: e.without_url().to_string(),
    }
}
