pub mod budget;
pub mod compaction;
pub mod config;
pub mod confirm;
pub mod error;
pub mod events;
pub mod format;
pub mod guard;
pub mod notify;
pub mod rewrite;
pub mod session;
pub mod state;
pub mod strategy;
pub mod tools;
pub mod types;

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use budget::{infer_context_limit, ContextBudget};
pub use compaction::{
    CompactionController, CompactionPhase, CompactionReport, NoSummarizer, Summarizer,
};
pub use config::{CompactionConfig, PruneConfig, StrategyConfig, ToolsConfig};
pub use confirm::{ConfirmationBroker, PendingConfirmation};
pub use error::PruneError;
pub use events::{PruneEvent, PrunedItem};
pub use format::{AuxPlacement, FormatDescriptor, WireFormat};
pub use guard::ProtectionGuard;
pub use notify::{ChannelNotifier, NoNotifier, Notifier};
pub use rewrite::{AppliedPrune, RewriteReport};
pub use session::{FileSessionStore, NoSessionStore, SessionStore};
pub use state::{ConversationState, SyncReport};
pub use strategy::{Deduplication, PruneStrategy, SupersedeWrites};
pub use tools::{PruneToolCall, ToolOutcome};
pub use types::{PruneMark, PruneReason, PruneStats, ToolInvocationRecord, ToolStatus, Usage};

/// What one transform did to the outgoing request.
#[derive(Debug, Clone, Default)]
pub struct TransformReport {
    /// Detected wire format; `None` leaves the body untouched.
    pub format: Option<WireFormat>,
    pub sync: SyncReport,
    /// Marks added by strategies in this pass.
    pub marked: usize,
    pub rewrite: RewriteReport,
    pub compaction: Option<CompactionReport>,
    pub injected_list: bool,
}

/// The pruning engine. Owns the state of every conversation it has seen,
/// keyed by conversation id.
///
/// Call [`transform`](Self::transform) on each outgoing request body,
/// [`record_usage`](Self::record_usage) with each response's usage, and
/// route `discard` / `extract` / `pin` calls to
/// [`handle_tool_call`](Self::handle_tool_call).
pub struct PruneEngine {
    config: PruneConfig,
    guard: ProtectionGuard,
    strategies: Vec<Box<dyn PruneStrategy>>,
    conversations: Mutex<HashMap<String, ConversationState>>,
    compaction: CompactionController,
    confirmations: ConfirmationBroker,
    session: Box<dyn SessionStore>,
    notifier: Box<dyn Notifier>,
    summarizer: Box<dyn Summarizer>,
}

impl PruneEngine {
    pub fn new(config: PruneConfig) -> Self {
        Self {
            guard: ProtectionGuard::from_config(&config),
            strategies: strategy::from_config(&config.strategies),
            compaction: CompactionController::new(config.compaction.clone()),
            conversations: Mutex::new(HashMap::new()),
            confirmations: ConfirmationBroker::new(),
            session: Box::new(NoSessionStore),
            notifier: Box::new(NoNotifier),
            summarizer: Box::new(NoSummarizer),
            config,
        }
    }

    pub fn with_session(mut self, session: impl SessionStore + 'static) -> Self {
        self.session = Box::new(session);
        self
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn with_summarizer(mut self, summarizer: impl Summarizer + 'static) -> Self {
        self.summarizer = Box::new(summarizer);
        self
    }

    /// Run an extra strategy after the built-in ones.
    pub fn with_strategy(mut self, strategy: impl PruneStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn config(&self) -> &PruneConfig {
        &self.config
    }

    pub fn confirmations(&self) -> &ConfirmationBroker {
        &self.confirmations
    }

    /// Definitions of the enabled prune tools, to add to the request's tool list.
    pub fn tool_schemas(&self) -> Vec<Value> {
        tools::schemas(&self.config.tools)
    }

    /// Prune the outgoing request body in place.
    ///
    /// Sync, strategies, rewrite and compaction run in that order. Failures
    /// degrade to "no additional pruning"; this never fails the request.
    pub async fn transform(&self, conversation_id: &str, body: &mut Value) -> TransformReport {
        let mut report = TransformReport::default();
        if !self.config.enabled {
            return report;
        }
        let Some(descriptor) = format::detect(body) else {
            debug!(conversation = conversation_id, "unrecognized request shape, skipping");
            return report;
        };
        report.format = Some(descriptor.format());
        let model = body
            .get("model")
            .or_else(|| body.get("modelId"))
            .and_then(Value::as_str)
            .map(String::from);
        let placement = format::resolve_placement(
            descriptor,
            model.as_deref(),
            &self.config.assistant_injection_models,
        );
        let Some(data) = descriptor.data_array_mut(body) else {
            return report;
        };

        let snapshot = {
            let mut conversations = self.conversations.lock().await;
            let state = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationState::new(conversation_id));
            if let Some(model) = &model {
                state.set_model(model);
            }

            report.sync = state.sync(
                descriptor,
                data.as_slice(),
                &self.guard,
                self.config.max_cached_invocations,
            );
            report.marked = self.run_strategies(state);
            report.rewrite = rewrite::apply_marks(
                descriptor,
                data.as_mut_slice(),
                state,
                &self.config.placeholder,
            );

            report.compaction = self
                .compact(conversation_id, descriptor, data.as_mut_slice(), state, &mut report.rewrite)
                .await;

            state.refresh_canonical(&self.guard);
            if self.config.inject_prunable_list {
                if let Some(list) = tools::render_prunable_list(state, &self.config.tools) {
                    descriptor.inject_auxiliary_content(data, &list, placement);
                    report.injected_list = true;
                }
            }
            state.touch();
            state.clone()
        };

        if let Some(compaction) = &report.compaction {
            self.emit(PruneEvent::CompactionTriggered {
                conversation_id: conversation_id.to_string(),
                usage_ratio: compaction.ratio_before,
            })
            .await;
        }
        if !report.rewrite.applied.is_empty() {
            self.emit(PruneEvent::Pruned {
                conversation_id: conversation_id.to_string(),
                items: report
                    .rewrite
                    .applied
                    .iter()
                    .map(|a| PrunedItem {
                        tool_name: a.tool_name.clone(),
                        reason: a.reason,
                    })
                    .collect(),
                tokens_saved: report.rewrite.tokens_saved(),
                total_tokens_saved: snapshot.stats().tokens_saved,
            })
            .await;
        }
        if let Some(compaction) = report.compaction.as_mut() {
            if compaction.needs_summary() {
                self.summarize(conversation_id, snapshot.last_model(), compaction)
                    .await;
            }
            self.emit(PruneEvent::CompactionFinished {
                conversation_id: conversation_id.to_string(),
                phases: compaction.phases.clone(),
                usage_ratio: compaction.ratio_after,
            })
            .await;
        }

        self.persist(conversation_id, &snapshot).await;
        report
    }

    /// Add strategy marks for anything still auto-prunable. The guard and
    /// the reason are re-checked here so custom strategies can't mark
    /// protected records or speak for the LLM.
    fn run_strategies(&self, state: &mut ConversationState) -> usize {
        let mut added = 0;
        for strategy in &self.strategies {
            let marks = strategy.evaluate(state, &self.guard);
            for mark in marks {
                if !mark.reason.is_automatic() {
                    warn!(
                        strategy = strategy.name(),
                        key = %mark.correlation_key,
                        reason = %mark.reason,
                        "strategy issued a user-directed reason, ignoring"
                    );
                    continue;
                }
                if !state.is_auto_prunable(&mark.correlation_key, &self.guard) {
                    continue;
                }
                debug!(
                    strategy = strategy.name(),
                    key = %mark.correlation_key,
                    reason = %mark.reason,
                    "marked"
                );
                if state.mark(mark) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Evaluate the compaction controller against the last recorded usage.
    /// Strategies and rewrite already ran in this transform; their savings
    /// count toward the strategies phase.
    async fn compact(
        &self,
        conversation_id: &str,
        descriptor: &dyn FormatDescriptor,
        data: &mut [Value],
        state: &mut ConversationState,
        rewrite: &mut RewriteReport,
    ) -> Option<CompactionReport> {
        let usage = state.last_usage()?;
        let limit = infer_context_limit(state.last_model().unwrap_or_default());
        let measured = ContextBudget::new(limit, usage.total());
        if !self.compaction.try_begin(conversation_id, &measured).await {
            return None;
        }
        // This usage has been acted on.
        state.take_usage();

        let config = self.compaction.config();
        let mut report = CompactionReport::new(measured.usage_ratio());
        let mut budget = measured.after_savings(rewrite.tokens_saved());
        report.tokens_saved = rewrite.tokens_saved();
        report.enter(CompactionPhase::StrategiesApplied);

        if budget.usage_ratio() >= config.threshold {
            let excess = budget.excess_over(config.target_ratio);
            let keys = self.compaction.select_truncation(state, &self.guard, excess);
            for key in &keys {
                state.mark(
                    PruneMark::new(key.clone(), PruneReason::Size)
                        .with_replacement(config.truncated_placeholder.clone()),
                );
            }
            let truncation = rewrite::apply_marks(descriptor, data, state, &self.config.placeholder);
            budget = budget.after_savings(truncation.tokens_saved());
            report.tokens_saved += truncation.tokens_saved();
            report.truncated = keys;
            rewrite.rewritten += truncation.rewritten;
            rewrite.applied.extend(truncation.applied);
            rewrite.refused.extend(truncation.refused);
        }
        report.enter(CompactionPhase::TruncationApplied);

        report.ratio_after = budget.usage_ratio();
        report.enter(CompactionPhase::Decision);
        if report.ratio_after < config.threshold {
            report.enter(CompactionPhase::Skipped);
            self.compaction.finish(conversation_id, false).await;
        } else {
            report.enter(CompactionPhase::SummarizationFallback);
        }
        info!(
            conversation = conversation_id,
            before = report.ratio_before,
            after = report.ratio_after,
            outcome = %report.final_phase(),
            "compaction evaluated"
        );
        Some(report)
    }

    /// Run the summarization fallback. Failures are logged and reported;
    /// the conversation is left as it is.
    async fn summarize(&self, conversation_id: &str, model: Option<&str>, report: &mut CompactionReport) {
        if let Err(e) = self.summarizer.summarize(conversation_id, model).await {
            warn!(conversation = conversation_id, error = %e, "summarization fallback failed");
            report.summarization_error = Some(e.to_string());
            self.emit(PruneEvent::Error {
                conversation_id: conversation_id.to_string(),
                message: e.to_string(),
            })
            .await;
        }
        self.compaction.finish(conversation_id, true).await;
    }

    /// Store the provider-reported usage of the last response. Compaction
    /// evaluates it on the next transform.
    pub async fn record_usage(&self, conversation_id: &str, model: Option<&str>, usage: Usage) {
        let mut conversations = self.conversations.lock().await;
        conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationState::new(conversation_id))
            .record_usage(model, usage);
    }

    /// Handle a `discard` / `extract` / `pin` call from the LLM. Errors are
    /// meant to go back to the LLM as a failed tool result.
    ///
    /// Ids refer to the `<prunable-tools>` list of the last transform. The
    /// rewrite itself happens on the next transform.
    pub async fn handle_tool_call(
        &self,
        conversation_id: &str,
        name: &str,
        input: &Value,
    ) -> Result<String, PruneError> {
        let call = PruneToolCall::parse(name, input, &self.config.tools)?;
        let unknown = || PruneError::StaleReference {
            ids: call.ids().to_vec(),
        };

        if self.config.tools.require_confirmation && call.removes_content() {
            let summary = {
                let conversations = self.conversations.lock().await;
                let state = conversations.get(conversation_id).ok_or_else(unknown)?;
                call.describe(state)?
            };
            let pending = self.confirmations.request(conversation_id, summary.clone()).await?;
            self.emit(PruneEvent::ConfirmationRequested {
                conversation_id: conversation_id.to_string(),
                request_id: pending.request_id.clone(),
                summary,
            })
            .await;
            if !pending.wait().await? {
                info!(conversation = conversation_id, tool = call.name(), "prune declined");
                return Ok(format!(
                    "The user declined this {}. The outputs stay in context.",
                    call.name()
                ));
            }
        }

        let (outcome, snapshot) = {
            let mut conversations = self.conversations.lock().await;
            let state = conversations.get_mut(conversation_id).ok_or_else(unknown)?;
            let outcome = call.apply(state, self.config.tools.default_pin_turns)?;
            state.touch();
            (outcome, state.clone())
        };
        info!(
            conversation = conversation_id,
            tool = call.name(),
            count = outcome.keys.len(),
            "prune tool applied"
        );
        self.persist(conversation_id, &snapshot).await;
        Ok(outcome.message)
    }

    /// Load persisted state at session start. Returns whether any was found.
    pub async fn restore(&self, conversation_id: &str) -> Result<bool, PruneError> {
        let Some(state) = self.session.load(conversation_id).await? else {
            return Ok(false);
        };
        info!(
            conversation = conversation_id,
            turn = state.turn_counter(),
            records = state.invocation_count(),
            "restored conversation state"
        );
        self.conversations
            .lock()
            .await
            .insert(conversation_id.to_string(), state);
        Ok(true)
    }

    /// Forget a deleted conversation, including its persisted copy.
    pub async fn evict(&self, conversation_id: &str) -> Result<(), PruneError> {
        self.conversations.lock().await.remove(conversation_id);
        self.compaction.forget(conversation_id).await;
        self.confirmations.cancel(conversation_id).await;
        self.session.delete(conversation_id).await
    }

    pub async fn stats(&self, conversation_id: &str) -> Option<PruneStats> {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .map(ConversationState::stats)
    }

    /// Correlation keys in canonical order as of the last transform;
    /// canonical id `n` is element `n - 1`.
    pub async fn canonical_keys(&self, conversation_id: &str) -> Vec<String> {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .map(|s| s.canonical_keys().to_vec())
            .unwrap_or_default()
    }

    /// A copy of the conversation's state.
    pub async fn state(&self, conversation_id: &str) -> Option<ConversationState> {
        self.conversations.lock().await.get(conversation_id).cloned()
    }

    async fn emit(&self, event: PruneEvent) {
        if let Err(e) = self.notifier.notify(event).await {
            warn!(error = %e, "event delivery failed");
        }
    }

    async fn persist(&self, conversation_id: &str, state: &ConversationState) {
        if let Err(e) = self.session.save(conversation_id, state).await {
            warn!(conversation = conversation_id, error = %e, "failed to persist state");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::config::DEFAULT_TRUNCATED_PLACEHOLDER;

    const CLAUDE: &str = "claude-sonnet-4-20250514";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// One assistant step per call; each answered with `"x" * size`.
    fn chat(model: &str, calls: &[(&str, &str, Value, usize)]) -> Value {
        let mut messages = vec![
            json!({"role": "system", "content": "be brief"}),
            json!({"role": "user", "content": "start"}),
        ];
        for (id, tool, args, size) in calls {
            messages.push(json!({"role": "assistant", "content": null, "tool_calls": [
                {"id": id, "type": "function", "function": {"name": tool, "arguments": args.to_string()}}
            ]}));
            messages.push(json!({"role": "tool", "tool_call_id": id, "content": "x".repeat(*size)}));
        }
        json!({"model": model, "messages": messages})
    }

    fn messages(body: &Value) -> &Vec<Value> {
        body["messages"].as_array().unwrap()
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<PruneEvent>) -> Vec<PruneEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    struct CountingSummarizer {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, _: &str, model: Option<&str>) -> Result<(), PruneError> {
            assert_eq!(model, Some(CLAUDE));
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PruneError::Summarization("provider timeout".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_read_keeps_only_the_latest() {
        init_tracing();
        let (notifier, mut rx) = ChannelNotifier::channel(16);
        let engine = PruneEngine::new(PruneConfig::default()).with_notifier(notifier);
        let mut body = chat(
            "gpt-4o",
            &[
                ("r1", "read", json!({"filePath": "/a.ts"}), 800),
                ("g2", "glob", json!({"pattern": "*.ts"}), 10),
                ("r3", "read", json!({"filePath": "/a.ts"}), 800),
            ],
        );

        let report = engine.transform("conv", &mut body).await;
        assert_eq!(report.format, Some(WireFormat::OpenAiChat));
        assert_eq!(report.marked, 1);
        let msgs = messages(&body);
        assert_eq!(msgs[3]["content"], PruneConfig::default().placeholder);
        assert_eq!(msgs[7]["content"], "x".repeat(800));

        let stats = engine.stats("conv").await.unwrap();
        assert_eq!(stats.pruned_count, 1);
        assert!(stats.tokens_saved > 150);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            PruneEvent::Pruned { items, .. } if items == &[PrunedItem { tool_name: "read".into(), reason: PruneReason::Duplicate }]
        )));
    }

    #[tokio::test]
    async fn write_input_superseded_by_later_read() {
        let engine = PruneEngine::new(PruneConfig::default());
        let mut body = chat(
            "gpt-4o",
            &[
                ("s1", "bash", json!({"command": "ls"}), 10),
                ("w2", "write", json!({"filePath": "/b.ts", "content": "export const b = 1;"}), 20),
                ("s3", "bash", json!({"command": "pwd"}), 10),
                ("s4", "glob", json!({"pattern": "*"}), 10),
                ("r5", "read", json!({"filePath": "/b.ts"}), 300),
            ],
        );
        engine.transform("conv", &mut body).await;
        let msgs = messages(&body);
        assert_eq!(msgs[4]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(msgs[10]["tool_calls"][0]["function"]["arguments"], "{\"filePath\":\"/b.ts\"}");
        assert_eq!(msgs[11]["content"], "x".repeat(300));
        let state = engine.state("conv").await.unwrap();
        assert_eq!(state.mark_for("w2").unwrap().reason, PruneReason::Superseded);
        assert!(!state.is_marked("r5"));
    }

    #[tokio::test]
    async fn extract_maps_canonical_ids_and_rejects_stale_ones() {
        let engine = PruneEngine::new(PruneConfig::default());
        let ids = ["c1", "c2", "c3", "c4", "c5", "c6", "call_abc", "c8", "call_xyz"];
        let calls: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, "bash", json!({"command": format!("step {i}")}), 50))
            .collect();
        let mut body = chat("gpt-4o", &calls);
        engine.transform("conv", &mut body).await;
        assert_eq!(engine.canonical_keys("conv").await[6], "call_abc");

        let reply = engine
            .handle_tool_call(
                "conv",
                "extract",
                &json!({"ids": ["7", "9"], "distillation": ["summary A", "summary B"]}),
            )
            .await
            .unwrap();
        assert!(reply.starts_with("Extracted 2"));

        let before = engine.state("conv").await.unwrap().marks_in_order();
        let err = engine
            .handle_tool_call("conv", "extract", &json!({"ids": ["99"], "distillation": ["x"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, PruneError::StaleReference { ref ids } if ids == &["99".to_string()]));
        assert_eq!(engine.state("conv").await.unwrap().marks_in_order(), before);

        let mut body = chat("gpt-4o", &calls);
        engine.transform("conv", &mut body).await;
        let msgs = messages(&body);
        assert_eq!(msgs[15]["content"], "summary A");
        assert_eq!(msgs[19]["content"], "summary B");
        assert_eq!(msgs[13]["content"], "x".repeat(50));
    }

    #[tokio::test]
    async fn compaction_skips_summary_when_truncation_suffices() {
        init_tracing();
        let calls = Arc::new(AtomicUsize::new(0));
        let (notifier, mut rx) = ChannelNotifier::channel(16);
        let engine = PruneEngine::new(PruneConfig::default())
            .with_notifier(notifier)
            .with_summarizer(CountingSummarizer {
                calls: calls.clone(),
                fail: false,
            });
        let ids: Vec<String> = (0..6).map(|i| format!("b{i}")).collect();
        let history: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), "bash", json!({"command": format!("cat big{i}")}), 40_000))
            .collect();
        let mut body = chat(CLAUDE, &history);

        engine
            .record_usage("conv", Some(CLAUDE), Usage {
                input_tokens: 170_000,
                output_tokens: 2_000,
                cache_read_tokens: 8_000,
            })
            .await;
        let report = engine.transform("conv", &mut body).await;
        let compaction = report.compaction.unwrap();
        assert_eq!(
            compaction.phases,
            vec![
                CompactionPhase::Triggered,
                CompactionPhase::StrategiesApplied,
                CompactionPhase::TruncationApplied,
                CompactionPhase::Decision,
                CompactionPhase::Skipped,
            ]
        );
        assert!((compaction.ratio_before - 0.90).abs() < 1e-9);
        assert!(compaction.ratio_after < 0.85);
        assert_eq!(compaction.truncated, vec!["b0", "b1", "b2", "b3"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let msgs = messages(&body);
        assert_eq!(msgs[3]["content"], DEFAULT_TRUNCATED_PLACEHOLDER);
        // The protected recent window is untouched.
        assert_eq!(msgs[11]["content"], "x".repeat(40_000));
        assert_eq!(msgs[13]["content"], "x".repeat(40_000));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, PruneEvent::CompactionTriggered { .. })));
        assert!(events.iter().any(|e| matches!(e, PruneEvent::CompactionFinished { .. })));

        // Usage was consumed; the next transform doesn't compact again.
        let mut body = chat(CLAUDE, &history);
        assert!(engine.transform("conv", &mut body).await.compaction.is_none());
    }

    #[tokio::test]
    async fn compaction_falls_back_to_summarization() {
        init_tracing();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = PruneEngine::new(PruneConfig::default()).with_summarizer(CountingSummarizer {
            calls: calls.clone(),
            fail: false,
        });
        let history = [
            ("a", "bash", json!({"command": "ls"}), 2_000),
            ("b", "bash", json!({"command": "pwd"}), 2_000),
            ("c", "bash", json!({"command": "env"}), 2_000),
            ("d", "bash", json!({"command": "id"}), 2_000),
        ];
        let usage = Usage {
            input_tokens: 174_000,
            output_tokens: 0,
            cache_read_tokens: 0,
        };

        engine.record_usage("conv", Some(CLAUDE), usage).await;
        let mut body = chat(CLAUDE, &history);
        let compaction = engine.transform("conv", &mut body).await.compaction.unwrap();
        assert_eq!(compaction.final_phase(), CompactionPhase::SummarizationFallback);
        assert!(compaction.ratio_after >= 0.85);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Cooldown: fresh usage right away does not re-trigger.
        engine.record_usage("conv", Some(CLAUDE), usage).await;
        let mut body = chat(CLAUDE, &history);
        assert!(engine.transform("conv", &mut body).await.compaction.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn summarization_failure_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (notifier, mut rx) = ChannelNotifier::channel(16);
        let config = PruneConfig::default()
            .with_compaction(CompactionConfig::default().with_cooldown_secs(0));
        let engine = PruneEngine::new(config)
            .with_notifier(notifier)
            .with_summarizer(CountingSummarizer {
                calls: calls.clone(),
                fail: true,
            });
        let history = [("a", "bash", json!({"command": "ls"}), 100)];
        let mut body = chat(CLAUDE, &history);
        let original_len = messages(&body).len();

        engine
            .record_usage("conv", Some(CLAUDE), Usage {
                input_tokens: 190_000,
                output_tokens: 0,
                cache_read_tokens: 0,
            })
            .await;
        let report = engine.transform("conv", &mut body).await;
        let compaction = report.compaction.unwrap();
        assert_eq!(compaction.summarization_error.as_deref(), Some("summarization failed: provider timeout"));
        assert!(!engine.compaction.is_in_progress("conv").await);
        // The request itself still goes out.
        assert!(messages(&body).len() >= original_len);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PruneEvent::Error { .. })));
    }

    #[tokio::test]
    async fn small_conversations_never_compact() {
        let engine = PruneEngine::new(PruneConfig::default());
        let mut body = chat("gpt-4", &[("a", "bash", json!({"command": "ls"}), 100)]);
        engine
            .record_usage("conv", None, Usage {
                input_tokens: 7_900,
                output_tokens: 0,
                cache_read_tokens: 0,
            })
            .await;
        // 7.9k of an 8k window, but under the 20k floor.
        assert!(engine.transform("conv", &mut body).await.compaction.is_none());
    }

    #[tokio::test]
    async fn protected_tools_and_paths_are_never_marked() {
        let config = PruneConfig::default()
            .protect_tool("bash")
            .protect_path("**/secret/**");
        let guard = ProtectionGuard::from_config(&config);
        let engine = PruneEngine::new(config);

        let mut seed = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        for round in 0..40 {
            let conv = format!("conv-{round}");
            let mut calls = Vec::new();
            for i in 0..(3 + next() % 10) {
                let path = ["/a.ts", "/secret/key.ts", "/b.ts"][(next() % 3) as usize];
                let (tool, args) = match next() % 6 {
                    0 => ("read", json!({"filePath": path})),
                    1 => ("write", json!({"filePath": path, "content": "v"})),
                    2 => ("bash", json!({"command": "ls"})),
                    3 => ("todowrite", json!({"todos": []})),
                    4 => ("discard", json!({"ids": ["1"], "reason": "noise"})),
                    _ => ("edit", json!({"filePath": path, "oldString": "a", "newString": "b"})),
                };
                calls.push((format!("k{i}"), tool, args, 20));
            }
            let calls: Vec<_> = calls
                .iter()
                .map(|(id, tool, args, size)| (id.as_str(), *tool, args.clone(), *size))
                .collect();
            let mut body = chat("gpt-4o", &calls);
            engine.transform(&conv, &mut body).await;

            let state = engine.state(&conv).await.unwrap();
            for record in state.records() {
                if guard.protects(record) {
                    assert!(
                        !state.is_marked(&record.correlation_key),
                        "protected {} marked in round {round}",
                        record.tool_name
                    );
                    assert!(state.canonical_id(&record.correlation_key).is_none());
                }
            }
        }
    }

    #[tokio::test]
    async fn canonical_ids_stay_put_across_transforms() {
        let engine = PruneEngine::new(PruneConfig::default());
        let history = [
            ("a", "read", json!({"filePath": "/a.ts"}), 30),
            ("b", "read", json!({"filePath": "/b.ts"}), 30),
            ("c", "glob", json!({"pattern": "*"}), 30),
        ];
        let mut first = chat("gpt-4o", &history);
        engine.transform("conv", &mut first).await;
        let keys = engine.canonical_keys("conv").await;
        for _ in 0..3 {
            let mut body = chat("gpt-4o", &history);
            engine.transform("conv", &mut body).await;
            assert_eq!(engine.canonical_keys("conv").await, keys);
            assert_eq!(body, first);
        }
    }

    #[tokio::test]
    async fn prunable_list_goes_to_last_user_or_synthetic_assistant() {
        let engine = PruneEngine::new(PruneConfig::default());
        let mut body = chat("gpt-4o", &[("a", "read", json!({"filePath": "/a.ts"}), 30)]);
        let report = engine.transform("conv", &mut body).await;
        assert!(report.injected_list);
        let user = messages(&body)[1]["content"].as_str().unwrap();
        assert!(user.contains("<prunable-tools>"));
        assert!(user.contains("1: read(filePath=\"/a.ts\")"));

        let mut config = PruneConfig::default();
        config.assistant_injection_models = vec!["copilot".into()];
        let engine = PruneEngine::new(config);
        let mut body = chat("copilot/gpt-4o", &[("a", "read", json!({"filePath": "/a.ts"}), 30)]);
        engine.transform("conv", &mut body).await;
        let last = messages(&body).last().unwrap();
        assert_eq!(last["role"], "assistant");
        assert!(last["content"].as_str().unwrap().contains("<prunable-tools>"));
    }

    #[tokio::test]
    async fn positional_duplicates_are_pruned_in_pairs() {
        let engine = PruneEngine::new(PruneConfig::default().with_prunable_list(false));
        let mut body = json!({"contents": [
            {"role": "user", "parts": [{"text": "go"}]},
            {"role": "model", "parts": [{"functionCall": {"name": "read", "args": {"filePath": "/a.ts"}}}]},
            {"role": "user", "parts": [{"functionResponse": {"name": "read", "response": {"output": "A".repeat(200)}}}]},
            {"role": "model", "parts": [{"functionCall": {"name": "read", "args": {"filePath": "/a.ts"}}}]},
            {"role": "user", "parts": [{"functionResponse": {"name": "read", "response": {"output": "A".repeat(200)}}}]}
        ]});
        let report = engine.transform("conv", &mut body).await;
        assert_eq!(report.format, Some(WireFormat::Gemini));
        assert_eq!(report.rewrite.applied.len(), 1);
        assert_eq!(report.rewrite.applied[0].correlation_key, "1:0");
        assert_eq!(
            body["contents"][2]["parts"][0]["functionResponse"]["response"]["output"],
            PruneConfig::default().placeholder
        );
        assert_eq!(
            body["contents"][4]["parts"][0]["functionResponse"]["response"]["output"],
            "A".repeat(200)
        );
    }

    #[tokio::test]
    async fn trimmed_positional_history_keeps_later_calls_intact() {
        let engine = PruneEngine::new(PruneConfig::default().with_prunable_list(false));
        let pair = |tool: &str, args: Value, output: &str| {
            [
                json!({"role": "model", "parts": [{"functionCall": {"name": tool, "args": args}}]}),
                json!({"role": "user", "parts": [{"functionResponse": {"name": tool, "response": {"output": output}}}]}),
            ]
        };
        let read = pair("read", json!({"filePath": "/a.ts"}), &"A".repeat(300));
        let test_run = pair("bash", json!({"command": "cargo test"}), "test result: ok");
        let mut contents = vec![json!({"role": "user", "parts": [{"text": "go"}]})];
        contents.extend(read.clone());
        contents.extend(read);
        contents.extend(test_run.clone());

        let mut body = json!({"contents": contents});
        engine.transform("conv", &mut body).await;
        assert!(engine.state("conv").await.unwrap().is_marked("1:0"));

        // The host summarized away the reads; the bash pair is now first.
        let mut trimmed = json!({"contents": [
            {"role": "user", "parts": [{"text": "summary of earlier work"}]},
            test_run[0].clone(),
            test_run[1].clone()
        ]});
        let report = engine.transform("conv", &mut trimmed).await;
        assert!(report.rewrite.applied.is_empty());
        let contents = &trimmed["contents"];
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"], json!({"command": "cargo test"}));
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["output"],
            "test result: ok"
        );
        let state = engine.state("conv").await.unwrap();
        assert_eq!(state.record("1:0").unwrap().tool_name, "bash");
        assert!(!state.is_marked("1:0"));
    }

    #[tokio::test]
    async fn undrained_notifier_does_not_stall_transform() {
        let (notifier, _rx) = ChannelNotifier::channel(1);
        let engine = PruneEngine::new(PruneConfig::default()).with_notifier(notifier);
        let history = [
            ("r1", "read", json!({"filePath": "/a.ts"}), 800),
            ("r2", "read", json!({"filePath": "/a.ts"}), 800),
            ("r3", "read", json!({"filePath": "/a.ts"}), 800),
        ];
        let mut body = chat("gpt-4o", &history[..2]);
        engine.transform("conv", &mut body).await;

        // The channel is full; this one's event has nowhere to go.
        let mut body = chat("gpt-4o", &history);
        let report = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            engine.transform("conv", &mut body),
        )
        .await
        .expect("transform blocked on a full notifier");
        assert_eq!(report.marked, 1);
        assert_eq!(messages(&body)[5]["content"], PruneConfig::default().placeholder);
    }

    #[tokio::test]
    async fn strategies_cannot_issue_user_directed_marks() {
        struct Overreaching;

        impl PruneStrategy for Overreaching {
            fn name(&self) -> &str {
                "overreaching"
            }

            fn evaluate(&self, state: &ConversationState, _: &ProtectionGuard) -> Vec<PruneMark> {
                state
                    .records()
                    .map(|r| PruneMark::new(r.correlation_key.clone(), PruneReason::Noise))
                    .collect()
            }
        }

        let engine = PruneEngine::new(PruneConfig::default()).with_strategy(Overreaching);
        let mut body = chat("gpt-4o", &[("a", "bash", json!({"command": "ls"}), 300)]);
        let report = engine.transform("conv", &mut body).await;
        assert_eq!(report.marked, 0);
        assert_eq!(messages(&body)[3]["content"], "x".repeat(300));
    }

    #[tokio::test]
    async fn confirmation_gates_discard() {
        init_tracing();
        let (notifier, mut rx) = ChannelNotifier::channel(16);
        let config = PruneConfig::default().with_tools(ToolsConfig {
            require_confirmation: true,
            ..ToolsConfig::default()
        });
        let engine = Arc::new(PruneEngine::new(config).with_notifier(notifier));
        let mut body = chat("gpt-4o", &[("a", "bash", json!({"command": "ls"}), 30)]);
        engine.transform("conv", &mut body).await;

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_tool_call("conv", "discard", &json!({"ids": ["1"], "reason": "noise"}))
                    .await
            })
        };
        let request_id = loop {
            match rx.recv().await {
                Some(PruneEvent::ConfirmationRequested { request_id, summary, .. }) => {
                    assert_eq!(summary, "discard #1 bash");
                    break request_id;
                }
                Some(_) => continue,
                None => panic!("notifier closed"),
            }
        };
        engine.confirmations().resolve(&request_id, true).await.unwrap();
        let reply = task.await.unwrap().unwrap();
        assert!(reply.starts_with("Discarded 1"));
        assert!(engine.state("conv").await.unwrap().is_marked("a"));
    }

    #[tokio::test]
    async fn declined_confirmation_changes_nothing() {
        let (notifier, mut rx) = ChannelNotifier::channel(16);
        let config = PruneConfig::default().with_tools(ToolsConfig {
            require_confirmation: true,
            ..ToolsConfig::default()
        });
        let engine = Arc::new(PruneEngine::new(config).with_notifier(notifier));
        let mut body = chat("gpt-4o", &[("a", "bash", json!({"command": "ls"}), 30)]);
        engine.transform("conv", &mut body).await;

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_tool_call("conv", "discard", &json!({"ids": ["1"], "reason": "noise"}))
                    .await
            })
        };
        let request_id = loop {
            if let Some(PruneEvent::ConfirmationRequested { request_id, .. }) = rx.recv().await {
                break request_id;
            }
        };
        engine.confirmations().resolve(&request_id, false).await.unwrap();
        assert!(task.await.unwrap().unwrap().contains("declined"));
        assert!(!engine.state("conv").await.unwrap().is_marked("a"));
    }

    #[tokio::test]
    async fn state_survives_restart_and_eviction_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let history = [
            ("r1", "read", json!({"filePath": "/a.ts"}), 100),
            ("r2", "read", json!({"filePath": "/a.ts"}), 100),
        ];
        {
            let engine = PruneEngine::new(PruneConfig::default())
                .with_session(FileSessionStore::new(dir.path()));
            let mut body = chat("gpt-4o", &history);
            engine.transform("conv", &mut body).await;
        }

        let engine =
            PruneEngine::new(PruneConfig::default()).with_session(FileSessionStore::new(dir.path()));
        assert!(engine.restore("conv").await.unwrap());
        let state = engine.state("conv").await.unwrap();
        assert_eq!(state.turn_counter(), 2);
        assert!(state.is_applied("r1"));
        let saved = state.stats();

        // Re-applying after restart does not double count.
        let mut body = chat("gpt-4o", &history);
        engine.transform("conv", &mut body).await;
        assert_eq!(engine.stats("conv").await.unwrap(), saved);

        engine.evict("conv").await.unwrap();
        assert!(engine.state("conv").await.is_none());
        assert!(!engine.restore("conv").await.unwrap());
    }

    #[tokio::test]
    async fn disabled_engine_and_unknown_shapes_pass_through() {
        let mut config = PruneConfig::default();
        config.enabled = false;
        let engine = PruneEngine::new(config);
        let mut body = chat(
            "gpt-4o",
            &[
                ("r1", "read", json!({"filePath": "/a.ts"}), 100),
                ("r2", "read", json!({"filePath": "/a.ts"}), 100),
            ],
        );
        let original = body.clone();
        let report = engine.transform("conv", &mut body).await;
        assert!(report.format.is_none());
        assert_eq!(body, original);

        let engine = PruneEngine::new(PruneConfig::default());
        let mut body = json!({"prompt": "complete this"});
        assert!(engine.transform("conv", &mut body).await.format.is_none());
        assert_eq!(body, json!({"prompt": "complete this"}));
    }

    #[tokio::test]
    async fn tool_calls_for_unknown_conversations_are_stale() {
        let engine = PruneEngine::new(PruneConfig::default());
        let err = engine
            .handle_tool_call("nobody", "pin", &json!({"ids": ["1"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, PruneError::StaleReference { .. }));
        let err = engine
            .handle_tool_call("nobody", "compress", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PruneError::UnknownTool(_)));
        assert_eq!(engine.tool_schemas().len(), 3);
    }
}
