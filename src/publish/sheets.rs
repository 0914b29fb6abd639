//! Spreadsheet sink: append one row per order to a Google Sheets tab.
//!
//! Authentication is the service-account flow: a short RS256-signed JWT is
//! exchanged at the key's `token_uri` for a bearer token, which is cached
//! until shortly before it expires.

use super::{transport_error, Publication, Sink};
use crate::config::SheetsConfig;
use crate::error::SinkError;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const SINK_NAME: &str = "sheets";
const SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh the cached token this long before it actually expires.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Appends order rows to one worksheet.
pub struct SheetsSink {
    client: reqwest::Client,
    config: SheetsConfig,
    token: Mutex<Option<CachedToken>>,
}

impl SheetsSink {
    pub fn new(client: reqwest::Client, config: SheetsConfig) -> Self {
        Self {
            client,
            config,
            token: Mutex::new(None),
        }
    }

    fn auth_error(detail: impl Into<String>) -> SinkError {
        SinkError::Auth {
            sink: SINK_NAME.to_string(),
            detail: detail.into(),
        }
    }

    /// Signed JWT assertion for the token exchange.
    fn assertion(&self) -> Result<String, SinkError> {
        let key = &self.config.key;
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &key.client_email,
            scope: SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Self::auth_error(format!("invalid private key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| Self::auth_error(format!("cannot sign assertion: {e}")))
    }

    async fn access_token(&self) -> Result<String, SinkError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_SLACK {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.assertion()?;
        debug!(
            client_email = %self.config.key.client_email,
            "Exchanging service account assertion"
        );
        let response = self
            .client
            .post(&self.config.key.token_uri)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| transport_error(SINK_NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::auth_error(format!("token endpoint HTTP {status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Self::auth_error(format!("bad token response: {}", e.without_url())))?;

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    /// `{base}/spreadsheets/{id}/values/'{tab}':append?...`
    fn append_url(&self) -> Result<Url, SinkError> {
        let mut url = Url::parse(&self.config.api_base).map_err(|e| SinkError::Transport {
            sink: SINK_NAME.to_string(),
            detail: format!("invalid sheets base url: {e}"),
        })?;
        let range = format!("'{}':append", self.config.worksheet.replace('\'', "''"));
        url.path_segments_mut()
            .map_err(|_| SinkError::Transport {
                sink: SINK_NAME.to_string(),
                detail: "sheets base url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend([
                "spreadsheets",
                self.config.spreadsheet_id.as_str(),
                "values",
                range.as_str(),
            ]);
        // RAW: cells hold exactly what was typed, never formulas or numbers.
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        Ok(url)
    }
}

#[async_trait]
impl Sink for SheetsSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn publish(&self, publication: &Publication) -> Result<(), SinkError> {
        let token = self.access_token().await?;
        let row = publication.order.sheet_row(publication.created_at);
        let body = serde_json::json!({ "values": [row] });

        let response = self
            .client
            .post(self.append_url()?)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(SINK_NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                sink: SINK_NAME.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        debug!(worksheet = %self.config.worksheet, "Row appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceAccountKey;
    use crate::order::OrderForm;
    use bytes::Bytes;
    use chrono::TimeZone;
    use mockito::Matcher;

    fn key(token_uri: String) -> ServiceAccountKey {
        let mut key = ServiceAccountKey::from_json(include_str!(
            "../../tests/fixtures/service_account.json"
        ))
        .unwrap();
        key.token_uri = token_uri;
        key
    }

    fn publication() -> Publication {
        let order = OrderForm {
            customer_name: "Marta Ruiz".into(),
            product: "Pendant".into(),
            payment_method: "Transfer".into(),
            amount: "120".into(),
            currency: "EUR".into(),
            reference: "TX-9".into(),
            delivery_mode: "Courier".into(),
            phone: "555-0101".into(),
            ..Default::default()
        }
        .validate()
        .unwrap();
        Publication {
            filename: order.download_filename(),
            order,
            png: Bytes::from_static(b"png"),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn exchanges_token_and_appends_row() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(
                    "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer".into(),
                ),
                Matcher::Regex("assertion=ey".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.test","expires_in":3599,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;
        let append_mock = server
            .mock(
                "POST",
                Matcher::Regex(r"^/spreadsheets/sheet-123/values/.*Orders.*:append$".into()),
            )
            .match_header("authorization", "Bearer ya29.test")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("valueInputOption".into(), "RAW".into()),
                Matcher::UrlEncoded("insertDataOption".into(), "INSERT_ROWS".into()),
            ]))
            .match_body(Matcher::Json(serde_json::json!({
                "values": [[
                    "2024-05-01 09:30:00", "Marta Ruiz", "Pendant", "Transfer",
                    "120", "EUR", "TX-9", "Courier", "555-0101"
                ]]
            })))
            .with_status(200)
            .with_body("{}")
            .expect(2)
            .create_async()
            .await;

        let config = SheetsConfig::new(key(format!("{}/token", server.url())), "sheet-123")
            .with_worksheet("Orders")
            .with_api_base(server.url());
        let sink = SheetsSink::new(reqwest::Client::new(), config);

        sink.publish(&publication()).await.unwrap();
        // Second publish reuses the cached token.
        sink.publish(&publication()).await.unwrap();

        token_mock.assert_async().await;
        append_mock.assert_async().await;
    }

    #[tokio::test]
    async fn typed_values_are_stored_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.raw"}"#)
            .create_async()
            .await;
        let append = server
            .mock("POST", Matcher::Regex("^/spreadsheets/sheet-123/values/".into()))
            .match_query(Matcher::UrlEncoded("valueInputOption".into(), "RAW".into()))
            .match_body(Matcher::Json(serde_json::json!({
                "values": [[
                    "2024-05-01 09:30:00", "=HYPERLINK(\"x\")", "Pendant", "Transfer",
                    "25,50", "EUR", "TX-9", "Courier", "0412345678"
                ]]
            })))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let mut publication = publication();
        publication.order = OrderForm {
            customer_name: "=HYPERLINK(\"x\")".into(),
            product: "Pendant".into(),
            payment_method: "Transfer".into(),
            amount: "25,50".into(),
            currency: "EUR".into(),
            reference: "TX-9".into(),
            delivery_mode: "Courier".into(),
            phone: "0412345678".into(),
            ..Default::default()
        }
        .validate()
        .unwrap();

        let config = SheetsConfig::new(key(format!("{}/token", server.url())), "sheet-123")
            .with_api_base(server.url());
        SheetsSink::new(reqwest::Client::new(), config)
            .publish(&publication)
            .await
            .unwrap();
        append.assert_async().await;
    }

    #[tokio::test]
    async fn token_rejection_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;
        let append = server
            .mock("POST", Matcher::Regex("^/spreadsheets/".into()))
            .expect(0)
            .create_async()
            .await;

        let config = SheetsConfig::new(key(format!("{}/token", server.url())), "sheet-123")
            .with_api_base(server.url());
        let err = SheetsSink::new(reqwest::Client::new(), config)
            .publish(&publication())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Auth { .. }), "{err:?}");
        append.assert_async().await;
    }

    #[test]
    fn bad_private_key_is_auth_error() {
        let mut k = key("http://localhost/token".into());
        k.private_key = "not a key".into();
        let sink = SheetsSink::new(reqwest::Client::new(), SheetsConfig::new(k, "x"));
        assert!(matches!(sink.assertion(), Err(SinkError::Auth { .. })));
    }

    #[test]
    fn append_url_quotes_worksheet() {
        let config = SheetsConfig::new(key("http://localhost/token".into()), "abc")
            .with_worksheet("Orders");
        let sink = SheetsSink::new(reqwest::Client::new(), config);
        let url = sink.append_url().unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc/values/'Orders':append\
             ?valueInputOption=RAW&insertDataOption=INSERT_ROWS"
        );
    }
}
