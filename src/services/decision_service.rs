//! Decision engine.
//!
//! The [`DecisionService`] walks unprocessed messages newest first and gives
//! each exactly one decision per cycle: an override rule when one matches,
//! otherwise the model's salvaged answer, otherwise a conservative `keep`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use super::record_writer::{DecisionRecord, DecisionRecordWriter, RecordError};
use super::rule_service::{RuleMatch, RuleSet};
use super::salvage::{salvage, Salvaged};
use crate::domain::{
    normalize_labels, Decision, DecisionSource, Disposition, Message, StoredDecision,
    DEFAULT_MARKER_PREFIX,
};
use crate::providers::ai::{GenerationClient, GenerationError, GenerationParams, GenerationRequest};
use crate::providers::retry::{with_retry, RetryPolicy};
use crate::storage::{DatabaseError, MessageStore};

/// Errors that stop a decision pass.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Failed to write decision record: {0}")]
    Record(#[from] RecordError),
}

/// Result type for decision operations.
pub type Result<T> = std::result::Result<T, DecisionError>;

/// Builds the classification prompt, clipping the body to `clip_chars`.
pub fn build_prompt(message: &Message, clip_chars: usize) -> String {
    let body: String = message
        .body_text
        .as_deref()
        .unwrap_or_default()
        .chars()
        .take(clip_chars)
        .collect();
    let from = &message.from;
    let subject = message.subject.as_deref().unwrap_or_default();

    format!(
        r#"You sort e-mail and decide what to do with each message.

Possible dispositions:
- "keep"    : leave it in the inbox (useful, sensitive, or needs action soon)
- "archive" : take it out of the inbox but keep it
- "delete"  : worthless or redundant content

Policy (careful but effective):
- Keep security, banking, invoices, HR, health and recent important confirmations.
- Archive recent newsletters and promotions, and anything non-critical that may be useful later.
- Delete old promotions and newsletters, advertising, and redundant technical noise.

Decide only from the sender, subject and body below.
Be brief, and answer with STRICT JSON using exactly these keys:

{{"disposition": "keep|archive|delete", "labels": ["..."], "confidence": 0.0-1.0, "reason": "...", "summary": "..."}}

From: {from}
Subject: {subject}
---
{body}
---
"#
    )
}

/// Parameters of one decision pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DecideOptions {
    pub model: String,
    pub params: GenerationParams,
    /// Body characters included in the prompt.
    pub clip_chars: usize,
    pub cycle: String,
    /// Decide again even if already decided under `cycle`.
    pub reprocess: bool,
    pub limit: Option<usize>,
    /// Model deletes below this confidence become archives. `0.0` disables it.
    pub min_confidence_delete: f32,
    pub marker_prefix: String,
    pub warm_up: bool,
}

impl Default for DecideOptions {
    fn default() -> Self {
        Self {
            model: "mistral".to_string(),
            params: GenerationParams::default(),
            clip_chars: 1500,
            cycle: "default".to_string(),
            reprocess: false,
            limit: None,
            min_confidence_delete: 0.0,
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            warm_up: true,
        }
    }
}

/// Counts from one decision pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecideReport {
    /// Messages selected for the pass.
    pub selected: usize,
    pub by_override: usize,
    pub by_model: usize,
    pub by_fallback: usize,
    /// Messages left unprocessed because the model could not be reached.
    pub generation_failures: usize,
    /// The stop flag ended the pass before every selected message was seen.
    pub stopped: bool,
}

impl DecideReport {
    pub fn decided(&self) -> usize {
        self.by_override + self.by_model + self.by_fallback
    }

    pub fn has_failures(&self) -> bool {
        self.generation_failures > 0
    }
}

/// Counts from re-evaluating override rules over decided messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverridesReport {
    pub examined: usize,
    /// Messages that received a new override decision.
    pub changed: usize,
    /// Matches left alone because the current decision is already applied.
    pub skipped_applied: usize,
    pub stopped: bool,
}

/// Outcome for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecideOutcome {
    Decided(DecisionSource),
    GenerationFailed,
}

/// Decides messages and persists the result.
pub struct DecisionService {
    store: Arc<dyn MessageStore>,
    generator: Arc<dyn GenerationClient>,
    rules: Arc<RuleSet>,
    options: DecideOptions,
    retry: RetryPolicy,
    records: Option<DecisionRecordWriter>,
    stop: Arc<AtomicBool>,
}

impl DecisionService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        generator: Arc<dyn GenerationClient>,
        rules: Arc<RuleSet>,
        options: DecideOptions,
    ) -> Self {
        Self {
            store,
            generator,
            rules,
            options,
            retry: RetryPolicy::default(),
            records: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Streams a record per decided message to `writer`.
    pub fn with_records(mut self, writer: DecisionRecordWriter) -> Self {
        self.records = Some(writer);
        self
    }

    /// Shares a stop flag; the pass ends before the next message once set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn options(&self) -> &DecideOptions {
        &self.options
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Decides every selected message, one at a time.
    pub async fn decide_batch(&self) -> Result<DecideReport> {
        let messages = if self.options.reprocess {
            self.store.list_active(self.options.limit).await?
        } else {
            self.store
                .list_unprocessed(&self.options.cycle, self.options.limit)
                .await?
        };

        let mut report = DecideReport {
            selected: messages.len(),
            ..Default::default()
        };
        tracing::info!(
            selected = messages.len(),
            cycle = %self.options.cycle,
            model = %self.options.model,
            reprocess = self.options.reprocess,
            "Starting decision pass"
        );
        if messages.is_empty() {
            return Ok(report);
        }

        if self.options.warm_up && self.needs_model(&messages) {
            if let Err(e) = self.generator.warm_up(&self.options.model).await {
                tracing::warn!(model = %self.options.model, error = %e, "Model warm-up failed");
            }
        }

        for (idx, message) in messages.iter().enumerate() {
            if self.stopped() {
                tracing::info!(remaining = messages.len() - idx, "Decision pass stopped");
                report.stopped = true;
                break;
            }

            match self.decide_message(message).await? {
                DecideOutcome::Decided(DecisionSource::Override) => report.by_override += 1,
                DecideOutcome::Decided(DecisionSource::Model) => report.by_model += 1,
                DecideOutcome::Decided(DecisionSource::Fallback) => report.by_fallback += 1,
                DecideOutcome::GenerationFailed => report.generation_failures += 1,
            }
        }

        tracing::info!(
            decided = report.decided(),
            overrides = report.by_override,
            fallbacks = report.by_fallback,
            failures = report.generation_failures,
            "Decision pass finished"
        );
        Ok(report)
    }

    /// Decides and stores one message.
    pub async fn decide_message(&self, message: &Message) -> Result<DecideOutcome> {
        let cycle = &self.options.cycle;

        let decision = match self.rules.evaluate(message, cycle) {
            Some(matched) => self.override_decision(message, matched).await,
            None => match self.generate(message).await {
                Ok(raw) => self.model_decision(raw),
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.id,
                        error = %e,
                        "Generation failed, message left unprocessed"
                    );
                    return Ok(DecideOutcome::GenerationFailed);
                }
            },
        };

        let source = decision.source;
        self.persist(message, decision).await?;
        Ok(DecideOutcome::Decided(source))
    }

    /// Re-evaluates override rules over decided messages.
    ///
    /// Applied decisions are only superseded when `force` is set; the new
    /// decision then becomes the next version.
    pub async fn reapply_overrides(&self, force: bool) -> Result<OverridesReport> {
        let messages = self.store.list_decided(self.options.limit).await?;
        let mut report = OverridesReport::default();

        for message in &messages {
            if self.stopped() {
                report.stopped = true;
                break;
            }
            let Some(current) = message.decision.as_ref() else {
                continue;
            };
            report.examined += 1;

            let Some(matched) = self.rules.evaluate(message, &self.options.cycle) else {
                continue;
            };

            let mut labels: Vec<String> = matched.decision.labels.iter().cloned().collect();
            if matched.merge_model_labels && current.decision.source == DecisionSource::Model {
                labels.extend(current.decision.labels.iter().cloned());
            }
            let decision = Decision {
                labels: normalize_labels(labels, &self.options.marker_prefix),
                summary: current.decision.summary.clone(),
                ..matched.decision
            };

            if current.decision.source == DecisionSource::Override && current.decision.same_outcome(&decision) {
                continue;
            }
            if current.is_applied() && !force {
                tracing::info!(
                    message_id = %message.id,
                    rule = %matched.rule_name,
                    "Override matches an applied decision, skipped without --force"
                );
                report.skipped_applied += 1;
                continue;
            }

            self.persist(message, decision).await?;
            report.changed += 1;
        }

        tracing::info!(
            examined = report.examined,
            changed = report.changed,
            skipped_applied = report.skipped_applied,
            "Override pass finished"
        );
        Ok(report)
    }

    fn needs_model(&self, messages: &[Message]) -> bool {
        messages.iter().any(|m| {
            self.rules
                .evaluate(m, &self.options.cycle)
                .map_or(true, |matched| matched.merge_model_labels)
        })
    }

    async fn generate(&self, message: &Message) -> std::result::Result<String, GenerationError> {
        let request = GenerationRequest::new(
            self.options.model.clone(),
            build_prompt(message, self.options.clip_chars),
        )
        .with_params(self.options.params.clone());

        with_retry(&self.retry, "generate", || self.generator.generate(&request)).await
    }

    async fn override_decision(&self, message: &Message, matched: RuleMatch) -> Decision {
        let mut labels: Vec<String> = matched.decision.labels.iter().cloned().collect();
        let mut summary = None;

        if matched.merge_model_labels {
            match self.generate(message).await.map(|raw| salvage(&raw)) {
                Ok(Ok(salvaged)) => {
                    labels.extend(salvaged.labels);
                    summary = salvaged.summary;
                }
                Ok(Err(failure)) => {
                    tracing::debug!(message_id = %message.id, kind = %failure.kind, "No model labels to merge");
                }
                Err(e) => {
                    tracing::warn!(message_id = %message.id, error = %e, "Generation failed, keeping rule labels only");
                }
            }
        }

        Decision {
            labels: normalize_labels(labels, &self.options.marker_prefix),
            summary,
            ..matched.decision
        }
    }

    fn model_decision(&self, raw: String) -> Decision {
        let cycle = self.options.cycle.clone();
        match salvage(&raw) {
            Ok(salvaged) => self.from_salvaged(salvaged, cycle, raw),
            Err(failure) => {
                tracing::warn!(kind = %failure.kind, "Unusable model output, falling back to keep");
                Decision::fallback(cycle, raw, format!("parse failure: {}", failure))
            }
        }
    }

    fn from_salvaged(&self, salvaged: Salvaged, cycle: String, raw: String) -> Decision {
        let mut disposition = salvaged.disposition;
        let mut reason = salvaged.reason;

        let threshold = self.options.min_confidence_delete;
        if disposition == Disposition::Delete
            && threshold > 0.0
            && salvaged.confidence.unwrap_or(0.0) < threshold
        {
            disposition = Disposition::Archive;
            let note = format!("downgraded: confidence below {}", threshold);
            reason = Some(match reason {
                Some(r) => format!("{} | {}", r, note),
                None => note,
            });
        }

        let mut decision = Decision::new(disposition, DecisionSource::Model, cycle)
            .with_labels(normalize_labels(salvaged.labels, &self.options.marker_prefix))
            .with_raw_output(raw);
        decision.confidence = salvaged.confidence;
        decision.reason = reason;
        decision.summary = salvaged.summary;
        decision
    }

    async fn persist(&self, message: &Message, decision: Decision) -> Result<()> {
        let version = self.store.set_decision(&message.id, &decision).await?;
        tracing::info!(
            message_id = %message.id,
            disposition = %decision.disposition,
            source = %decision.source,
            labels = ?decision.labels,
            version = %version,
            "Decided"
        );

        if let Some(records) = &self.records {
            let stored = StoredDecision {
                version,
                decision,
                decided_at: Utc::now(),
                applied_at: None,
            };
            records.write(&DecisionRecord::new(message, &stored))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Condition, EmailId, OverrideRule, RuleField, RuleOperator};
    use crate::providers::ai::MockGenerationClient;
    use crate::services::test_support::{new_message, store_with};
    use std::collections::BTreeSet;

    fn options() -> DecideOptions {
        DecideOptions {
            cycle: "c1".to_string(),
            warm_up: false,
            ..Default::default()
        }
    }

    fn answering(times: usize, answer: &'static str) -> Arc<MockGenerationClient> {
        let mut mock = MockGenerationClient::new();
        mock.expect_generate()
            .times(times)
            .returning(move |_| Ok(answer.to_string()));
        Arc::new(mock)
    }

    fn service(
        store: &Arc<dyn MessageStore>,
        generator: Arc<MockGenerationClient>,
        rules: RuleSet,
        options: DecideOptions,
    ) -> DecisionService {
        DecisionService::new(store.clone(), generator, Arc::new(rules), options).with_retry(RetryPolicy::none())
    }

    fn receipts_rule(merge_model_labels: bool) -> RuleSet {
        RuleSet::new(vec![OverrideRule {
            name: "receipts".to_string(),
            priority: 0,
            when: vec![Condition::new(RuleField::Subject, RuleOperator::Contains, "receipt")],
            disposition: Disposition::Keep,
            labels: vec!["Receipts".to_string()],
            merge_model_labels,
        }])
        .unwrap()
    }

    async fn current(store: &Arc<dyn MessageStore>, id: &str) -> Option<StoredDecision> {
        store.get_decision(&EmailId::from(id)).await.unwrap()
    }

    #[tokio::test]
    async fn second_pass_calls_no_model_and_changes_nothing() {
        let store = store_with(&[
            new_message("m1", "news@example.com", "Weekly", 1),
            new_message("m2", "shop@example.com", "Sale", 2),
        ])
        .await;
        let generator = answering(2, r#"{"disposition": "archive", "labels": ["newsletter"], "confidence": 0.9}"#);
        let svc = service(&store, generator, RuleSet::empty(), options());

        let first = svc.decide_batch().await.unwrap();
        assert_eq!(first.by_model, 2);
        let before = current(&store, "m1").await.unwrap();

        let second = svc.decide_batch().await.unwrap();
        assert_eq!(second.selected, 0);
        assert_eq!(second.decided(), 0);
        assert_eq!(current(&store, "m1").await.unwrap(), before);
        assert_eq!(before.decision.labels, BTreeSet::from(["Newsletter".to_string()]));
    }

    #[tokio::test]
    async fn matching_rule_skips_the_model() {
        let store = store_with(&[new_message("m1", "shop@example.com", "Your receipt", 1)]).await;
        let svc = service(&store, answering(0, "unused"), receipts_rule(false), options());

        let report = svc.decide_batch().await.unwrap();
        assert_eq!(report.by_override, 1);

        let stored = current(&store, "m1").await.unwrap();
        assert_eq!(stored.decision.source, DecisionSource::Override);
        assert_eq!(stored.decision.disposition, Disposition::Keep);
        assert_eq!(stored.decision.reason.as_deref(), Some("rule: receipts"));
    }

    #[tokio::test]
    async fn rule_can_merge_model_labels() {
        let store = store_with(&[new_message("m1", "air@example.com", "Flight receipt", 1)]).await;
        let generator = answering(1, r#"{"disposition": "delete", "labels": ["Travel", "_AI_KEEP"], "summary": "Flight to Oslo"}"#);
        let svc = service(&store, generator, receipts_rule(true), options());

        svc.decide_batch().await.unwrap();

        let stored = current(&store, "m1").await.unwrap();
        assert_eq!(stored.decision.source, DecisionSource::Override);
        assert_eq!(stored.decision.disposition, Disposition::Keep);
        assert_eq!(
            stored.decision.labels,
            BTreeSet::from(["Receipts".to_string(), "Travel".to_string()])
        );
        assert_eq!(stored.decision.summary.as_deref(), Some("Flight to Oslo"));
    }

    #[tokio::test]
    async fn unusable_output_falls_back_to_keep() {
        let store = store_with(&[
            new_message("m1", "a@example.com", "One", 1),
            new_message("m2", "b@example.com", "Two", 2),
        ])
        .await;
        let mut mock = MockGenerationClient::new();
        mock.expect_generate().times(2).returning(|request| {
            if request.prompt.contains("Subject: One") {
                Ok("I am not sure what to do here.".to_string())
            } else {
                Ok(r#"{"disposition": "obliterate"}"#.to_string())
            }
        });
        let svc = service(&store, Arc::new(mock), RuleSet::empty(), options());

        let report = svc.decide_batch().await.unwrap();
        assert_eq!(report.by_fallback, 2);

        for id in ["m1", "m2"] {
            let stored = current(&store, id).await.unwrap();
            assert_eq!(stored.decision.disposition, Disposition::Keep);
            assert_eq!(stored.decision.source, DecisionSource::Fallback);
            assert!(stored.decision.labels.is_empty());
            assert!(stored.decision.raw_model_output.is_some());
        }
        let m2 = current(&store, "m2").await.unwrap();
        assert!(m2.decision.reason.unwrap().contains("unknown_disposition"));
    }

    #[tokio::test]
    async fn generation_failure_leaves_message_unprocessed() {
        let store = store_with(&[new_message("m1", "a@example.com", "One", 1)]).await;
        let mut mock = MockGenerationClient::new();
        mock.expect_generate()
            .times(1)
            .returning(|_| Err(GenerationError::Connection("connection refused".to_string())));
        let svc = service(&store, Arc::new(mock), RuleSet::empty(), options());

        let report = svc.decide_batch().await.unwrap();
        assert_eq!(report.generation_failures, 1);
        assert!(report.has_failures());
        assert!(current(&store, "m1").await.is_none());
        assert_eq!(store.list_unprocessed("c1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_generation_errors_are_retried() {
        let store = store_with(&[new_message("m1", "a@example.com", "One", 1)]).await;
        let mut mock = MockGenerationClient::new();
        let mut calls = 0;
        mock.expect_generate().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(GenerationError::Timeout("45s".to_string()))
            } else {
                Ok(r#"{"disposition": "keep"}"#.to_string())
            }
        });
        let svc = DecisionService::new(store.clone(), Arc::new(mock), Arc::new(RuleSet::empty()), options())
            .with_retry(RetryPolicy::new(2, std::time::Duration::ZERO, std::time::Duration::ZERO));

        assert_eq!(svc.decide_batch().await.unwrap().by_model, 1);
    }

    #[tokio::test]
    async fn limit_takes_newest_first() {
        let store = store_with(&[
            new_message("old", "a@example.com", "Old", 300),
            new_message("new", "b@example.com", "New", 1),
            new_message("mid", "c@example.com", "Mid", 60),
        ])
        .await;
        let svc = service(
            &store,
            answering(2, r#"{"disposition": "keep"}"#),
            RuleSet::empty(),
            DecideOptions {
                limit: Some(2),
                ..options()
            },
        );

        assert_eq!(svc.decide_batch().await.unwrap().decided(), 2);
        assert!(current(&store, "new").await.is_some());
        assert!(current(&store, "mid").await.is_some());
        assert!(current(&store, "old").await.is_none());
    }

    #[tokio::test]
    async fn low_confidence_delete_is_downgraded() {
        let store = store_with(&[new_message("m1", "a@example.com", "Promo", 1)]).await;
        let svc = service(
            &store,
            answering(1, r#"{"disposition": "delete", "confidence": 0.3, "reason": "promo"}"#),
            RuleSet::empty(),
            DecideOptions {
                min_confidence_delete: 0.6,
                ..options()
            },
        );

        svc.decide_batch().await.unwrap();

        let stored = current(&store, "m1").await.unwrap();
        assert_eq!(stored.decision.disposition, Disposition::Archive);
        assert_eq!(
            stored.decision.reason.as_deref(),
            Some("promo | downgraded: confidence below 0.6")
        );
    }

    #[tokio::test]
    async fn stop_flag_ends_the_pass() {
        let store = store_with(&[new_message("m1", "a@example.com", "One", 1)]).await;
        let stop = Arc::new(AtomicBool::new(true));
        let svc = service(&store, answering(0, "unused"), RuleSet::empty(), options()).with_stop_flag(stop);

        let report = svc.decide_batch().await.unwrap();
        assert!(report.stopped);
        assert_eq!(report.decided(), 0);
    }

    #[tokio::test]
    async fn warm_up_failure_is_not_fatal() {
        let store = store_with(&[new_message("m1", "a@example.com", "One", 1)]).await;
        let mut mock = MockGenerationClient::new();
        mock.expect_warm_up()
            .times(1)
            .returning(|_| Err(GenerationError::Connection("refused".to_string())));
        mock.expect_generate()
            .times(1)
            .returning(|_| Ok(r#"{"disposition": "keep"}"#.to_string()));
        let svc = service(
            &store,
            Arc::new(mock),
            RuleSet::empty(),
            DecideOptions {
                warm_up: true,
                ..options()
            },
        );

        assert_eq!(svc.decide_batch().await.unwrap().by_model, 1);
    }

    #[tokio::test]
    async fn reprocess_overwrites_unapplied_decision() {
        let store = store_with(&[new_message("m1", "a@example.com", "One", 1)]).await;
        service(&store, answering(1, r#"{"disposition": "keep"}"#), RuleSet::empty(), options())
            .decide_batch()
            .await
            .unwrap();

        let report = service(
            &store,
            answering(1, r#"{"disposition": "archive"}"#),
            RuleSet::empty(),
            DecideOptions {
                reprocess: true,
                ..options()
            },
        )
        .decide_batch()
        .await
        .unwrap();
        assert_eq!(report.by_model, 1);

        let stored = current(&store, "m1").await.unwrap();
        assert_eq!(stored.version.0, 1);
        assert_eq!(stored.decision.disposition, Disposition::Archive);
    }

    #[tokio::test]
    async fn records_are_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let store = store_with(&[
            new_message("m1", "a@example.com", "One", 1),
            new_message("m2", "b@example.com", "Two", 2),
        ])
        .await;
        let svc = service(&store, answering(2, r#"{"disposition": "keep"}"#), RuleSet::empty(), options())
            .with_records(DecisionRecordWriter::append(&path).unwrap());

        svc.decide_batch().await.unwrap();
        drop(svc);

        let text = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<EmailId> = text
            .lines()
            .map(|l| serde_json::from_str::<DecisionRecord>(l).unwrap().id)
            .collect();
        assert_eq!(ids, vec![EmailId::from("m1"), EmailId::from("m2")]);
    }

    #[tokio::test]
    async fn overrides_respect_applied_decisions_unless_forced() {
        let store = store_with(&[new_message("m1", "shop@example.com", "Your receipt", 1)]).await;
        service(&store, answering(1, r#"{"disposition": "delete"}"#), RuleSet::empty(), options())
            .decide_batch()
            .await
            .unwrap();
        let id = EmailId::from("m1");
        store
            .mark_applied(&id, crate::domain::DecisionVersion::FIRST, &BTreeSet::new())
            .await
            .unwrap();

        let svc = service(&store, answering(0, "unused"), receipts_rule(false), options());

        let report = svc.reapply_overrides(false).await.unwrap();
        assert_eq!(report.skipped_applied, 1);
        assert_eq!(current(&store, "m1").await.unwrap().decision.disposition, Disposition::Delete);

        let report = svc.reapply_overrides(true).await.unwrap();
        assert_eq!(report.changed, 1);
        let stored = current(&store, "m1").await.unwrap();
        assert_eq!(stored.version.0, 2);
        assert_eq!(stored.decision.source, DecisionSource::Override);
        assert!(!stored.is_applied());

        let again = svc.reapply_overrides(true).await.unwrap();
        assert_eq!(again.changed, 0);
    }

    #[tokio::test]
    async fn overrides_can_match_model_labels() {
        let store = store_with(&[
            new_message("m1", "news@example.com", "Weekly", 1),
            new_message("m2", "friend@example.com", "Dinner", 2),
        ])
        .await;
        let mut mock = MockGenerationClient::new();
        mock.expect_generate().times(2).returning(|request| {
            Ok(if request.prompt.contains("Weekly") {
                r#"{"disposition": "keep", "labels": ["Newsletter"]}"#.to_string()
            } else {
                r#"{"disposition": "keep", "labels": ["Personal"]}"#.to_string()
            })
        });
        service(&store, Arc::new(mock), RuleSet::empty(), options())
            .decide_batch()
            .await
            .unwrap();

        let rules = RuleSet::new(vec![OverrideRule {
            name: "newsletters".to_string(),
            priority: 0,
            when: vec![Condition::new(RuleField::Labels, RuleOperator::Matches, "^(newsletter|promotions?)$")],
            disposition: Disposition::Delete,
            labels: Vec::new(),
            merge_model_labels: true,
        }])
        .unwrap();
        let report = service(&store, answering(0, "unused"), rules, options())
            .reapply_overrides(false)
            .await
            .unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 1);

        let m1 = current(&store, "m1").await.unwrap();
        assert_eq!(m1.decision.disposition, Disposition::Delete);
        assert_eq!(m1.decision.source, DecisionSource::Override);
        assert!(m1.decision.labels.contains("Newsletter"));
        assert_eq!(current(&store, "m2").await.unwrap().decision.disposition, Disposition::Keep);
    }

    #[test]
    fn prompt_clips_body() {
        let mut message = Message {
            id: EmailId::from("m1"),
            message_id: None,
            remote_id: None,
            from: "Alice <alice@example.com>".to_string(),
            subject: None,
            date: Utc::now(),
            size_bytes: 0,
            body_text: Some("abcdefghij".repeat(10)),
            remote_labels: BTreeSet::new(),
            decision: None,
            applied_version: None,
            trashed_at: None,
        };
        let prompt = build_prompt(&message, 15);
        assert!(prompt.contains("From: Alice <alice@example.com>"));
        assert!(prompt.contains("---\nabcdefghijabcde\n---"));

        message.body_text = None;
        assert!(build_prompt(&message, 15).contains("Subject: \n"));
    }

    #[test]
    fn prompt_placeholders_in_headers_stay_literal() {
        let message = Message {
            id: EmailId::from("m1"),
            message_id: None,
            remote_id: None,
            from: "{subject} <x@example.com>".to_string(),
            subject: Some("About {body}".to_string()),
            date: Utc::now(),
            size_bytes: 0,
            body_text: Some("real body".to_string()),
            remote_labels: BTreeSet::new(),
            decision: None,
            applied_version: None,
            trashed_at: None,
        };
        let prompt = build_prompt(&message, 100);
        assert!(prompt.contains("From: {subject} <x@example.com>\nSubject: About {body}\n"));
        assert_eq!(prompt.matches("real body").count(), 1);
        assert!(prompt.contains(r#"{"disposition": "keep|archive|delete""#));
    }
}
