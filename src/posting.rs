//! Downstream posting: reshape a [`CanonicalInvoice`] and submit it.
//!
//! The backend expects a two-step handshake on one cookie session:
//!
//! 1. `GET` the endpoint with `X-CSRF-Token: Fetch` to receive a token.
//! 2. `POST` the payload with that token echoed back.
//!
//! Posting never fails the extraction. Every outcome, including a missing
//! token, is folded into a [`PostingReport`].

use crate::document::CanonicalInvoice;
use crate::error::PostingError;
use crate::pipeline::postprocess::strip_amount_separators;
use crate::rules::RuleTables;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

const CSRF_HEADER: &str = "x-csrf-token";

/// Endpoint and credentials for the downstream backend.
#[derive(Clone, Default)]
pub struct PostingConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for PostingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostingConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl PostingConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs.max(1);
        self
    }
}

/// Line item as the backend expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostingItem {
    pub invoice_doc_item: String,
    pub po_number: String,
    pub po_item: String,
    pub quantity: String,
    pub unit: String,
    pub item_amount: String,
    pub sheet_no: String,
}

/// Request body for the write step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostingPayload {
    pub doc_date: String,
    pub posting_date: String,
    pub ref_doc_no: String,
    pub company_code: String,
    pub currency: String,
    pub gross_amount: String,
    pub items: Vec<PostingItem>,
}

impl PostingPayload {
    /// Strip separators from money fields and fill absent PO numbers with
    /// the placeholder from `rules`.
    pub fn from_invoice(invoice: &CanonicalInvoice, rules: &RuleTables) -> Self {
        let items = invoice
            .items
            .iter()
            .map(|item| PostingItem {
                invoice_doc_item: item.invoice_doc_item.clone(),
                po_number: if item.po_number.trim().is_empty() {
                    rules.default_po_number.clone()
                } else {
                    item.po_number.clone()
                },
                po_item: item.po_item.clone(),
                quantity: item.quantity.clone(),
                unit: item.unit.clone(),
                item_amount: strip_amount_separators(&item.item_amount),
                sheet_no: item.sheet_no.clone(),
            })
            .collect();

        Self {
            doc_date: invoice.doc_date.clone(),
            posting_date: invoice.posting_date.clone(),
            ref_doc_no: invoice.ref_docno.clone(),
            company_code: invoice.company_code.clone(),
            currency: invoice.currency.clone(),
            gross_amount: strip_amount_separators(&invoice.gross_amount),
            items,
        }
    }
}

/// Outcome of one posting attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostingReport {
    pub posted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub message: String,
    /// Backend response body (JSON when it parses, otherwise a string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl PostingReport {
    fn failed(err: &PostingError) -> Self {
        let http_status = match err {
            PostingError::MissingToken { status, .. } | PostingError::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        };
        Self {
            posted: false,
            http_status,
            message: err.to_string(),
            response: None,
        }
    }
}

/// Post `invoice` downstream. Never returns an error; see [`PostingReport`].
pub async fn post_invoice(
    invoice: &CanonicalInvoice,
    config: &PostingConfig,
    rules: &RuleTables,
) -> PostingReport {
    let payload = PostingPayload::from_invoice(invoice, rules);
    match send(&payload, config).await {
        Ok((status, response)) => {
            info!("Posted {} line items (HTTP {})", payload.items.len(), status);
            PostingReport {
                posted: true,
                http_status: Some(status),
                message: "posted".into(),
                response: Some(response),
            }
        }
        Err(e) => {
            warn!("Posting failed: {}", e);
            PostingReport::failed(&e)
        }
    }
}

async fn send(payload: &PostingPayload, config: &PostingConfig) -> Result<(u16, Value), PostingError> {
    let url = config.endpoint.trim();
    if url.is_empty() {
        return Err(PostingError::NotConfigured);
    }

    let request_err = |e: reqwest::Error| PostingError::Request {
        url: url.to_string(),
        detail: e.to_string(),
    };

    let client = reqwest::Client::builder()
        .cookie_store(true)
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .build()
        .map_err(request_err)?;

    let authed = |rb: reqwest::RequestBuilder| match &config.username {
        Some(user) => rb.basic_auth(user, config.password.as_deref()),
        None => rb,
    };

    // Step 1: token fetch.
    let fetch = authed(client.get(url))
        .header(CSRF_HEADER, "Fetch")
        .send()
        .await
        .map_err(request_err)?;

    let status = fetch.status().as_u16();
    let token = fetch
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("required"))
        .ok_or_else(|| PostingError::MissingToken {
            url: url.to_string(),
            status,
        })?;

    // Step 2: write.
    let response = authed(client.post(url))
        .header(CSRF_HEADER, token)
        .json(payload)
        .send()
        .await
        .map_err(request_err)?;

    let status = response.status();
    let body = response.text().await.map_err(request_err)?;
    if !status.is_success() {
        return Err(PostingError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let parsed = serde_json::from_str(&body).unwrap_or(Value::String(body));
    Ok((status.as_u16(), parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::LineItem;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn invoice() -> CanonicalInvoice {
        CanonicalInvoice {
            doc_date: "20240115".into(),
            posting_date: "20240115".into(),
            ref_docno: "INV-7".into(),
            company_code: "2000".into(),
            currency: "SAR".into(),
            gross_amount: "1,234.50".into(),
            items: vec![
                LineItem {
                    invoice_doc_item: "000001".into(),
                    po_number: "".into(),
                    po_item: "00010".into(),
                    quantity: "1".into(),
                    unit: "EA".into(),
                    item_amount: "1,234.50".into(),
                    sheet_no: "1234567890".into(),
                },
                LineItem {
                    invoice_doc_item: "000002".into(),
                    po_number: "4500000777".into(),
                    ..LineItem::default()
                },
            ],
        }
    }

    #[test]
    fn payload_strips_separators_and_defaults_po() {
        let payload = PostingPayload::from_invoice(&invoice(), &RuleTables::default());
        assert_eq!(payload.gross_amount, "1234.50");
        assert_eq!(payload.items[0].item_amount, "1234.50");
        assert_eq!(payload.items[0].po_number, "4500000000");
        assert_eq!(payload.items[1].po_number, "4500000777");
    }

    #[test]
    fn payload_uses_pascal_case() {
        let payload = PostingPayload::from_invoice(&invoice(), &RuleTables::default());
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["RefDocNo"], "INV-7");
        assert_eq!(v["Items"][0]["InvoiceDocItem"], "000001");
    }

    #[test]
    fn debug_hides_password() {
        let c = PostingConfig::new("http://x").with_credentials("u", "secret");
        assert!(!format!("{c:?}").contains("secret"));
    }

    #[test]
    fn missing_endpoint_is_reported() {
        let report = tokio_test::block_on(post_invoice(
            &invoice(),
            &PostingConfig::default(),
            &RuleTables::default(),
        ));
        assert!(!report.posted);
        assert!(report.message.contains("not configured"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_reported_not_raised() {
        let config = PostingConfig::new("http://127.0.0.1:1/invoice").with_timeout(2);
        let report = post_invoice(&invoice(), &config, &RuleTables::default()).await;
        assert!(!report.posted);
        assert_eq!(report.http_status, None);
    }

    /// Serve `responses` in order, one per connection, recording each request.
    async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for response in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = sock.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let len = text[..end]
                            .lines()
                            .find_map(|l| {
                                let lower = l.to_ascii_lowercase();
                                lower
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if buf.len() >= end + 4 + len {
                            break;
                        }
                    }
                }
                log.lock().unwrap().push(String::from_utf8_lossy(&buf).to_string());
                sock.write_all(response.as_bytes()).await.unwrap();
                sock.shutdown().await.ok();
            }
        });
        (format!("http://{addr}/invoice"), seen)
    }

    #[tokio::test]
    async fn handshake_echoes_token() {
        let (url, seen) = serve(vec![
            "HTTP/1.1 200 OK\r\nx-csrf-token: tok-42\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"id\":\"9\"}\n".into(),
        ])
        .await;

        let config = PostingConfig::new(url).with_credentials("user", "pw").with_timeout(5);
        let report = post_invoice(&invoice(), &config, &RuleTables::default()).await;
        assert!(report.posted, "{report:?}");
        assert_eq!(report.http_status, Some(201));
        assert_eq!(report.response.unwrap()["id"], "9");

        let requests = seen.lock().unwrap().clone();
        assert!(requests[0].starts_with("GET "));
        assert!(requests[0].to_ascii_lowercase().contains("x-csrf-token: fetch"));
        assert!(requests[0].to_ascii_lowercase().contains("authorization: basic"));
        assert!(requests[1].starts_with("POST "));
        assert!(requests[1].contains("tok-42"));
        assert!(requests[1].contains("\"GrossAmount\":\"1234.50\""));
    }

    #[tokio::test]
    async fn missing_token_is_reported() {
        let (url, _) = serve(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
        ])
        .await;
        let report = post_invoice(&invoice(), &PostingConfig::new(url), &RuleTables::default()).await;
        assert!(!report.posted);
        assert_eq!(report.http_status, Some(200));
        assert!(report.message.contains("x-csrf-token"));
    }
}
