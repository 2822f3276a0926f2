//! Transformer: merged bucket documents → [`CanonicalInvoice`].
//!
//! One sequential call per document. Any failure here is fatal for the
//! run: a half-transformed canonical record is never returned.

use crate::config::ExtractionConfig;
use crate::document::CanonicalInvoice;
use crate::error::PipelineError;
use crate::output::RawExtraction;
use crate::pipeline::llm::{call_with_retry, CallFailure, ModelReply, ModelRequest, ModelService};
use crate::pipeline::postprocess::{apply_canonical_rules, invoice_from_object, parse_json_object};
use crate::prompts::{transform_system_prompt, transform_user_message, TRANSFORM_PROMPT};
use crate::rules::RuleTables;
use tracing::info;

/// Ask the text model for the canonical record and enforce its rules.
///
/// Returns the invoice together with the reply's token counts.
pub async fn transform(
    service: &dyn ModelService,
    buckets: &RawExtraction,
    config: &ExtractionConfig,
) -> Result<(CanonicalInvoice, ModelReply), PipelineError> {
    let template = config
        .transform_prompt
        .as_deref()
        .unwrap_or(TRANSFORM_PROMPT);

    let request = ModelRequest {
        page: None,
        system: transform_system_prompt(template, &config.rules),
        user: transform_user_message(buckets),
        image: None,
    };

    let reply = call_with_retry(service, &request, config.retry_policy())
        .await
        .map_err(|failure| match failure {
            CallFailure::Failed { retries, detail } => {
                PipelineError::TransformFailed { retries, detail }
            }
            CallFailure::TimedOut { secs } => PipelineError::TransformTimeout { secs },
        })?;

    let invoice = finalize(&reply.content, &config.rules)?;
    info!(
        "Transformed into canonical record with {} line items",
        invoice.items.len()
    );
    Ok((invoice, reply))
}

/// Validate the raw reply and apply the canonical rules.
pub fn finalize(content: &str, rules: &RuleTables) -> Result<CanonicalInvoice, PipelineError> {
    let obj = parse_json_object(content)
        .map_err(|detail| PipelineError::TransformMalformed { detail })?;
    let mut invoice =
        invoice_from_object(&obj).map_err(|detail| PipelineError::TransformMalformed { detail })?;
    apply_canonical_rules(&mut invoice, rules);
    Ok(invoice)
}
