//! Pipeline integration tests driven by scripted model services.
//!
//! No network, no pdfium: pages are synthetic images handed straight to
//! [`extract_pages`], and both model services answer from a script keyed by
//! page number.
//!
//! Run with:
//!   cargo test --test pipeline

use async_trait::async_trait;
use edgequake_invoice::extract::write_output;
use edgequake_invoice::{
    extract_from_bytes, extract_pages, ExtractionConfig, ExtractionProgressCallback,
    ModelReply, ModelRequest, ModelService, PageImage, PipelineError, PipelineStage,
};
use image::DynamicImage;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

enum Step {
    Reply(String),
    Fail(String),
    Delayed(u64, String),
}

/// Vision service answering per page from a script.
struct ScriptedVision {
    steps: HashMap<usize, Step>,
    calls: AtomicUsize,
}

impl ScriptedVision {
    fn new(steps: Vec<(usize, Step)>) -> Arc<Self> {
        Arc::new(Self {
            steps: steps.into_iter().collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ModelService for ScriptedVision {
    fn name(&self) -> String {
        "scripted/vision".into()
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.image.is_some(), "page calls must carry an image");
        let page = request.page.ok_or("page call without page number")?;
        match self.steps.get(&page) {
            Some(Step::Reply(content)) => Ok(reply(content)),
            Some(Step::Delayed(ms, content)) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(reply(content))
            }
            Some(Step::Fail(msg)) => Err(msg.clone()),
            None => Err(format!("no script for page {page}")),
        }
    }
}

/// Text service returning a fixed answer and recording what it was sent.
struct RecordingText {
    answer: Result<String, String>,
    seen: Mutex<Vec<String>>,
}

impl RecordingText {
    fn ok(answer: Value) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(answer.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn raw(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(answer.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(msg: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Err(msg.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// The three bucket documents from the last call.
    fn last_buckets(&self) -> Value {
        let seen = self.seen.lock().unwrap();
        let user = seen.last().expect("text service was not called");
        let body = user.split_once("\n\n").map(|(_, b)| b).unwrap_or(user);
        serde_json::from_str(body).expect("bucket payload is JSON")
    }

    fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelService for RecordingText {
    fn name(&self) -> String {
        "scripted/text".into()
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, String> {
        assert!(request.image.is_none());
        assert_eq!(request.page, None);
        self.seen.lock().unwrap().push(request.user.clone());
        self.answer.clone().map(|c| reply(&c))
    }
}

#[derive(Default)]
struct StageLog(Mutex<Vec<PipelineStage>>);

impl ExtractionProgressCallback for StageLog {
    fn on_stage(&self, stage: PipelineStage) {
        self.0.lock().unwrap().push(stage);
    }
}

fn reply(content: &str) -> ModelReply {
    ModelReply {
        content: content.to_string(),
        input_tokens: 10,
        output_tokens: 5,
    }
}

fn page(document_type: &str, data: Value) -> Step {
    Step::Reply(json!({"document_type": document_type, "data": data}).to_string())
}

fn images(n: usize) -> Vec<PageImage> {
    (1..=n)
        .map(|page_num| PageImage {
            page_num,
            image: DynamicImage::new_rgb8(8, 8),
        })
        .collect()
}

fn canonical() -> Value {
    json!({
        "docDate": "2024-01-15",
        "refDocno": "INV-100",
        "companyCode": "9999",
        "currency": "USD",
        "grossAmount": "1,150.00",
        "items": [
            {"poNumber": "4500000001", "quantity": "1", "unit": "EA", "itemAmount": "1,000.00"},
            {"poNumber": "4500000001", "quantity": "2", "unit": "EA", "itemAmount": "100.00"},
            {"poNumber": "4500000001", "quantity": "3", "unit": "EA", "itemAmount": "50.00"}
        ]
    })
}

fn config(
    vision: Arc<ScriptedVision>,
    text: Arc<RecordingText>,
) -> edgequake_invoice::ExtractionConfigBuilder {
    ExtractionConfig::builder()
        .vision_service(vision)
        .text_service(text)
        .max_retries(0)
        .retry_backoff_ms(1)
        .api_timeout_secs(5)
}

// ── Merge and bucketing ──────────────────────────────────────────────────────

#[tokio::test]
async fn two_page_invoice_concatenates_line_items() {
    let vision = ScriptedVision::new(vec![
        (1, page("invoice", json!({"invoice_no": "INV-100", "items": ["A"]}))),
        (2, page("tax_invoice", json!({"items": ["B"]}))),
    ]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision, text.clone()).build().unwrap();

    let out = extract_pages(images(2), &cfg).await.unwrap();

    let buckets = text.last_buckets();
    assert_eq!(buckets["tax_invoice"]["items"], json!(["A", "B"]));
    assert_eq!(buckets["tax_invoice"]["invoice_no"], "INV-100");
    assert_eq!(buckets["purchase_order"], Value::Null);
    assert_eq!(buckets["gl_document"], Value::Null);

    let raw = &out.raw_extraction;
    assert_eq!(raw.tax_invoice.as_ref().unwrap()["items"], json!(["A", "B"]));
    assert!(raw.errors.is_empty());
    assert_eq!(out.stage, PipelineStage::Done);
}

#[tokio::test]
async fn failed_page_is_recorded_and_siblings_survive() {
    let vision = ScriptedVision::new(vec![
        (1, Step::Fail("HTTP 500".into())),
        (2, page("po", json!({"po_number": "4500000001"}))),
    ]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision, text).build().unwrap();

    let out = extract_pages(images(2), &cfg).await.unwrap();

    let raw = &out.raw_extraction;
    assert_eq!(raw.errors.len(), 1);
    assert_eq!(raw.errors[0].page_index, 1);
    assert!(raw.errors[0].message.contains("HTTP 500"));
    assert_eq!(
        raw.purchase_order.as_ref().unwrap()["po_number"],
        "4500000001"
    );
    assert!(raw.tax_invoice.is_none());
    assert!(raw.gl_document.is_none());
    assert_eq!(out.stage, PipelineStage::PartialFailure);
    assert!(out.is_partial());
    assert_eq!(out.stats.failed_pages, 1);
    assert_eq!(out.stats.extracted_pages, 1);
}

#[tokio::test]
async fn malformed_page_reply_is_a_page_error() {
    let vision = ScriptedVision::new(vec![
        (1, Step::Reply("I cannot read this page".into())),
        (2, page("invoice", json!({"total": 5}))),
    ]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision, text).build().unwrap();

    let out = extract_pages(images(2), &cfg).await.unwrap();
    assert_eq!(out.raw_extraction.errors.len(), 1);
    assert_eq!(out.raw_extraction.errors[0].page_index, 1);
    assert!(out.raw_extraction.tax_invoice.is_some());
}

#[tokio::test]
async fn unclassified_pages_are_excluded_but_transform_still_runs() {
    let vision = ScriptedVision::new(vec![(
        1,
        page("receipt", json!({"shop": "Corner Cafe", "total": 12})),
    )]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision, text.clone()).build().unwrap();

    let out = extract_pages(images(1), &cfg).await.unwrap();

    assert_eq!(out.raw_extraction.unclassified_pages, vec![1]);
    assert!(out.raw_extraction.errors.is_empty());
    assert_eq!(text.call_count(), 1);
    let buckets = text.last_buckets();
    for key in ["tax_invoice", "purchase_order", "gl_document"] {
        assert_eq!(buckets[key], Value::Null, "{key}");
    }
    assert_eq!(out.stats.unclassified_pages, 1);
}

#[tokio::test]
async fn arabic_keyword_fallback_routes_page() {
    let vision = ScriptedVision::new(vec![
        (1, page("مستند", json!({"العنوان": "فاتورة ضريبية", "البنود": [{"الوصف": "ورق"}]}))),
        (2, page("other", json!({"العنوان": "قيد يومية", "مدين": 100}))),
    ]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision, text).build().unwrap();

    let out = extract_pages(images(2), &cfg).await.unwrap();
    let raw = &out.raw_extraction;
    assert_eq!(
        raw.tax_invoice.as_ref().unwrap()["البنود"],
        json!([{"الوصف": "ورق"}])
    );
    assert_eq!(raw.gl_document.as_ref().unwrap()["مدين"], 100);
    assert!(raw.purchase_order.is_none());
}

#[tokio::test]
async fn page_order_survives_out_of_order_completion() {
    let vision = ScriptedVision::new(vec![
        (
            1,
            Step::Delayed(200, json!({"document_type": "invoice", "data": {"items": ["p1"]}}).to_string()),
        ),
        (2, page("invoice", json!({"items": ["p2"]}))),
        (
            3,
            Step::Delayed(50, json!({"document_type": "invoice", "data": {"items": ["p3"]}}).to_string()),
        ),
    ]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision.clone(), text.clone())
        .concurrency(3)
        .build()
        .unwrap();

    // Hand the pages over shuffled as well.
    let mut pages = images(3);
    pages.reverse();
    extract_pages(pages, &cfg).await.unwrap();

    assert_eq!(vision.calls.load(Ordering::SeqCst), 3);
    assert_eq!(text.last_buckets()["tax_invoice"]["items"], json!(["p1", "p2", "p3"]));
}

#[tokio::test]
async fn page_cap_limits_extraction_calls() {
    let steps = (1..=8)
        .map(|n| (n, page("invoice", json!({"items": [n]}))))
        .collect();
    let vision = ScriptedVision::new(steps);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision.clone(), text.clone()).max_pages(5).build().unwrap();

    let out = extract_pages(images(8), &cfg).await.unwrap();

    assert_eq!(vision.calls.load(Ordering::SeqCst), 5);
    assert_eq!(out.stats.total_pages, 5);
    assert_eq!(text.last_buckets()["tax_invoice"]["items"], json!([1, 2, 3, 4, 5]));
}

// ── Canonical rules ──────────────────────────────────────────────────────────

#[tokio::test]
async fn canonical_record_obeys_fixed_rules() {
    let vision = ScriptedVision::new(vec![(1, page("invoice", json!({"total": 1150})))]);
    let text = RecordingText::raw(&format!("```json\n{}\n```", canonical()));
    let cfg = config(vision, text).build().unwrap();

    let out = extract_pages(images(1), &cfg).await.unwrap();
    let inv = &out.final_output;

    assert_eq!(inv.company_code, "2000");
    assert_eq!(inv.currency, "SAR");
    assert_eq!(inv.doc_date, "20240115");
    assert_eq!(inv.posting_date, "20240115");
    assert_eq!(inv.gross_amount, "1150.00");

    let numbers: Vec<&str> = inv.items.iter().map(|i| i.invoice_doc_item.as_str()).collect();
    assert_eq!(numbers, vec!["000001", "000002", "000003"]);
    let po_items: Vec<&str> = inv.items.iter().map(|i| i.po_item.as_str()).collect();
    assert_eq!(po_items, vec!["00010", "00020", "00030"]);
    for item in &inv.items {
        assert_eq!(item.sheet_no.len(), 10);
        assert!(item.sheet_no.chars().all(|c| c.is_ascii_digit()));
    }
}

#[tokio::test]
async fn known_bad_po_numbers_are_substituted() {
    let vision = ScriptedVision::new(vec![(1, page("po", json!({"po": "45000123"})))]);
    let text = RecordingText::ok(json!({
        "docDate": "20240301",
        "items": [{"poNumber": "45000123"}, {"poNumber": "4500000999"}]
    }));
    let cfg = config(vision, text).build().unwrap();

    let out = extract_pages(images(1), &cfg).await.unwrap();
    assert_eq!(out.final_output.items[0].po_number, "4500000123");
    assert_eq!(out.final_output.items[1].po_number, "4500000999");
}

// ── Fatal paths ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn transform_failure_is_fatal() {
    let vision = ScriptedVision::new(vec![(1, page("invoice", json!({"total": 1})))]);
    let text = RecordingText::failing("upstream 503");
    let stages = Arc::new(StageLog::default());
    let cfg = config(vision, text)
        .progress_callback(stages.clone())
        .build()
        .unwrap();

    let err = extract_pages(images(1), &cfg).await.unwrap_err();
    assert!(matches!(err, PipelineError::TransformFailed { .. }), "{err}");
    assert!(err.to_string().contains("upstream 503"));
    assert_eq!(stages.0.lock().unwrap().last(), Some(&PipelineStage::Failed));
}

#[tokio::test]
async fn non_object_transform_reply_is_fatal() {
    let vision = ScriptedVision::new(vec![(1, page("invoice", json!({"total": 1})))]);
    let text = RecordingText::raw("[1, 2, 3]");
    let cfg = config(vision, text).build().unwrap();

    let err = extract_pages(images(1), &cfg).await.unwrap_err();
    assert!(matches!(err, PipelineError::TransformMalformed { .. }), "{err}");
}

#[tokio::test]
async fn every_page_failing_still_returns_a_record() {
    let vision = ScriptedVision::new(vec![
        (1, Step::Fail("boom".into())),
        (2, Step::Fail("boom".into())),
    ]);
    let text = RecordingText::ok(canonical());
    let stages = Arc::new(StageLog::default());
    let cfg = config(vision, text.clone())
        .progress_callback(stages.clone())
        .build()
        .unwrap();

    let out = extract_pages(images(2), &cfg).await.unwrap();

    let failed: Vec<_> = out.raw_extraction.errors.iter().map(|e| e.page_index).collect();
    assert_eq!(failed, vec![1, 2]);
    assert!(out.raw_extraction.errors.iter().all(|e| e.message.contains("boom")));
    assert_eq!(out.stats.extracted_pages, 0);
    assert_eq!(out.stats.failed_pages, 2);
    assert_eq!(out.stage, PipelineStage::PartialFailure);

    assert_eq!(text.call_count(), 1);
    let buckets = text.last_buckets();
    for key in ["tax_invoice", "purchase_order", "gl_document"] {
        assert_eq!(buckets[key], Value::Null, "{key}");
    }
    assert_eq!(out.final_output.company_code, "2000");
    assert!(!stages.0.lock().unwrap().contains(&PipelineStage::Failed));
}

#[tokio::test]
async fn no_pages_is_fatal() {
    let vision = ScriptedVision::new(vec![]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision, text).build().unwrap();

    let err = extract_pages(Vec::new(), &cfg).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoPages));
}

#[tokio::test]
async fn non_pdf_bytes_are_rejected_before_any_call() {
    let vision = ScriptedVision::new(vec![]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision.clone(), text.clone()).build().unwrap();

    let err = extract_from_bytes(b"PK\x03\x04zipfile".to_vec(), &cfg)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotAPdf { .. }), "{err}");
    let err = extract_from_bytes(Vec::new(), &cfg).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotAPdf { .. }), "{err}");
    assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    assert_eq!(text.call_count(), 0);
}

// ── Observability and output ─────────────────────────────────────────────────

#[tokio::test]
async fn stages_are_reported_in_order() {
    let vision = ScriptedVision::new(vec![
        (1, Step::Fail("x".into())),
        (2, page("invoice", json!({"total": 1}))),
    ]);
    let text = RecordingText::ok(canonical());
    let stages = Arc::new(StageLog::default());
    let cfg = config(vision, text)
        .progress_callback(stages.clone())
        .build()
        .unwrap();

    let out = extract_pages(images(2), &cfg).await.unwrap();

    assert_eq!(
        *stages.0.lock().unwrap(),
        vec![
            PipelineStage::Start,
            PipelineStage::Extracting,
            PipelineStage::PartialFailure,
            PipelineStage::Merging,
            PipelineStage::Transforming,
            PipelineStage::Done,
        ]
    );
    // 1 page + transform call, 10/5 tokens each.
    assert_eq!(out.stats.total_input_tokens, 20);
    assert_eq!(out.stats.total_output_tokens, 10);
}

#[tokio::test]
async fn output_serialises_and_writes_atomically() {
    let vision = ScriptedVision::new(vec![(1, page("invoice", json!({"items": ["A"]})))]);
    let text = RecordingText::ok(canonical());
    let cfg = config(vision, text).build().unwrap();
    let out = extract_pages(images(1), &cfg).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out.json");
    write_output(&out, &path).await.unwrap();

    let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["final_output"]["companyCode"], "2000");
    assert_eq!(written["raw_extraction"]["tax_invoice"]["items"], json!(["A"]));
    assert_eq!(written["stage"], "DONE");
    assert!(!path.with_extension("json.tmp").exists());
}
