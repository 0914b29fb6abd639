//! Messaging sink: post the finished PNG to a Telegram chat.
//!
//! Uses `sendDocument` rather than `sendPhoto` so Telegram does not
//! recompress the image or drop its alpha channel.

use super::{transport_error, Publication, Sink};
use crate::config::TelegramConfig;
use crate::error::SinkError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::debug;

const SINK_NAME: &str = "telegram";

/// Sends each order to one chat.
pub struct TelegramSink {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramSink {
    pub fn new(client: reqwest::Client, config: TelegramConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendDocument",
            self.config.api_base, self.config.bot_token
        )
    }
}

#[async_trait]
impl Sink for TelegramSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn publish(&self, publication: &Publication) -> Result<(), SinkError> {
        let document = Part::bytes(publication.png.to_vec())
            .file_name(publication.filename.clone())
            .mime_str("image/png")
            .map_err(|e| transport_error(SINK_NAME, e))?;

        let form = Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .text("caption", publication.order.caption())
            .text("parse_mode", "Markdown")
            .part("document", document);

        debug!(chat_id = %self.config.chat_id, bytes = publication.png.len(), "Sending document");
        let response = self
            .client
            .post(self.endpoint())
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(SINK_NAME, e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                sink: SINK_NAME.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
