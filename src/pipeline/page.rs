//! Page Extractor: one page image in, one classified field set out.
//!
//! Always returns a `Result` the orchestrator records per page; a failure
//! here never aborts sibling pages.

use crate::config::ExtractionConfig;
use crate::document::{FieldMap, PageExtraction, PageImage};
use crate::error::PageError;
use crate::pipeline::encode::encode_page;
use crate::pipeline::llm::{call_with_retry, CallFailure, ModelRequest, ModelService};
use crate::pipeline::postprocess::parse_json_object;
use crate::prompts::EXTRACTION_PROMPT;
use serde_json::Value;
use tracing::debug;

/// User turn sent next to the page image.
const PAGE_USER_TEXT: &str = "Classify and extract this page.";

/// Send one page to the vision model and validate the answer.
pub async fn extract_page(
    service: &dyn ModelService,
    page: &PageImage,
    config: &ExtractionConfig,
) -> Result<PageExtraction, PageError> {
    let page_num = page.page_num;
    let image = encode_page(page).map_err(|e| PageError::EncodeFailed {
        page: page_num,
        detail: e.to_string(),
    })?;

    let request = ModelRequest {
        page: Some(page_num),
        system: config
            .extraction_prompt
            .as_deref()
            .unwrap_or(EXTRACTION_PROMPT)
            .to_string(),
        user: PAGE_USER_TEXT.to_string(),
        image: Some(image),
    };

    let reply = call_with_retry(service, &request, config.retry_policy())
        .await
        .map_err(|failure| match failure {
            CallFailure::Failed { retries, detail } => PageError::LlmFailed {
                page: page_num,
                retries,
                detail,
            },
            CallFailure::TimedOut { secs } => PageError::Timeout {
                page: page_num,
                secs,
            },
        })?;

    let mut extraction = parse_extraction(page_num, &reply.content)?;
    extraction.input_tokens = reply.input_tokens;
    extraction.output_tokens = reply.output_tokens;
    debug!(
        "Page {}: declared '{}', {} top-level fields",
        page_num,
        extraction.document_type,
        extraction.data.len()
    );
    Ok(extraction)
}

/// Validate a raw extraction reply.
///
/// Expected shape: `{"document_type": string, "data": object}`. When `data`
/// is absent the whole object is taken as the data.
pub fn parse_extraction(page_num: usize, content: &str) -> Result<PageExtraction, PageError> {
    let malformed = |detail: String| PageError::MalformedResponse {
        page: page_num,
        detail,
    };

    let obj = parse_json_object(content).map_err(malformed)?;

    let document_type = match obj.get("document_type") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => {
            return Err(malformed(format!(
                "document_type must be a string, got {}",
                other
            )))
        }
    };

    let nested: Option<FieldMap> = match obj.get("data") {
        Some(Value::Object(data)) => Some(data.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(malformed("data must be a JSON object".to_string())),
    };
    let data = nested.unwrap_or(obj);

    Ok(PageExtraction {
        page_num,
        document_type,
        data,
        input_tokens: 0,
        output_tokens: 0,
    })
}
