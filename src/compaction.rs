use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::budget::{tokens_to_bytes, ContextBudget};
use crate::config::CompactionConfig;
use crate::error::PruneError;
use crate::guard::ProtectionGuard;
use crate::state::ConversationState;

/// Steps of one compaction run, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionPhase {
    Idle,
    Triggered,
    StrategiesApplied,
    TruncationApplied,
    Decision,
    Skipped,
    SummarizationFallback,
}

impl std::fmt::Display for CompactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompactionPhase::Idle => "idle",
            CompactionPhase::Triggered => "triggered",
            CompactionPhase::StrategiesApplied => "strategies-applied",
            CompactionPhase::TruncationApplied => "truncation-applied",
            CompactionPhase::Decision => "decision",
            CompactionPhase::Skipped => "skipped",
            CompactionPhase::SummarizationFallback => "summarization-fallback",
        };
        f.write_str(s)
    }
}

/// Summarizes a conversation when pruning alone can't bring usage down.
/// Implemented by the host; returns once summarization is complete.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, conversation_id: &str, model: Option<&str>) -> Result<(), PruneError>;
}

/// No summarization. The fallback is reported but does nothing.
pub struct NoSummarizer;

#[async_trait]
impl Summarizer for NoSummarizer {
    async fn summarize(&self, _: &str, _: Option<&str>) -> Result<(), PruneError> {
        Ok(())
    }
}

/// What a compaction run did.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub phases: Vec<CompactionPhase>,
    pub ratio_before: f64,
    pub ratio_after: f64,
    /// Keys truncated during the truncation phase.
    pub truncated: Vec<String>,
    pub tokens_saved: u64,
    /// Set when the summarization fallback was attempted and failed.
    pub summarization_error: Option<String>,
}

impl CompactionReport {
    pub fn new(ratio_before: f64) -> Self {
        Self {
            phases: vec![CompactionPhase::Triggered],
            ratio_before,
            ratio_after: ratio_before,
            truncated: Vec::new(),
            tokens_saved: 0,
            summarization_error: None,
        }
    }

    pub fn enter(&mut self, phase: CompactionPhase) {
        debug!(%phase, "compaction phase");
        self.phases.push(phase);
    }

    pub fn final_phase(&self) -> CompactionPhase {
        self.phases.last().copied().unwrap_or(CompactionPhase::Idle)
    }

    pub fn needs_summary(&self) -> bool {
        self.final_phase() == CompactionPhase::SummarizationFallback
    }
}

/// Threshold-triggered escalation: strategies, then largest-first
/// truncation, then summarization.
///
/// Runs are single-flight per conversation. The cooldown starts only when
/// a run reaches the summarization fallback.
pub struct CompactionController {
    config: CompactionConfig,
    in_progress: Mutex<HashSet<String>>,
    last_run: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CompactionController {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            in_progress: Mutex::new(HashSet::new()),
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Usage alone is high enough to compact.
    pub fn over_threshold(&self, budget: &ContextBudget) -> bool {
        self.config.enabled
            && budget.used_tokens >= self.config.min_total_tokens
            && budget.usage_ratio() >= self.config.threshold
    }

    pub async fn in_cooldown(&self, conversation_id: &str) -> bool {
        let last_run = self.last_run.lock().await;
        let Some(last) = last_run.get(conversation_id) else {
            return false;
        };
        let cooldown = i64::try_from(self.config.cooldown_secs).unwrap_or(i64::MAX);
        (Utc::now() - *last).num_seconds() < cooldown
    }

    pub async fn is_in_progress(&self, conversation_id: &str) -> bool {
        self.in_progress.lock().await.contains(conversation_id)
    }

    /// Claim the conversation for a run. False when usage is under the
    /// threshold, a run is already in progress, or the cooldown is active.
    pub async fn try_begin(&self, conversation_id: &str, budget: &ContextBudget) -> bool {
        if !self.over_threshold(budget) || self.in_cooldown(conversation_id).await {
            return false;
        }
        let claimed = self
            .in_progress
            .lock()
            .await
            .insert(conversation_id.to_string());
        if claimed {
            info!(
                conversation = conversation_id,
                ratio = budget.usage_ratio(),
                "compaction triggered"
            );
        }
        claimed
    }

    /// Release the conversation. A summarization attempt, successful or
    /// not, starts the cooldown.
    pub async fn finish(&self, conversation_id: &str, summarization_attempted: bool) {
        self.in_progress.lock().await.remove(conversation_id);
        if summarization_attempted {
            self.last_run
                .lock()
                .await
                .insert(conversation_id.to_string(), Utc::now());
        }
    }

    /// Drop all bookkeeping for a deleted conversation.
    pub async fn forget(&self, conversation_id: &str) {
        self.in_progress.lock().await.remove(conversation_id);
        self.last_run.lock().await.remove(conversation_id);
    }

    /// Pick tool results to truncate, largest first, until their combined
    /// size covers `excess_tokens`. Results in the protected recent window
    /// and anything not auto-prunable are skipped.
    pub fn select_truncation(
        &self,
        state: &ConversationState,
        guard: &ProtectionGuard,
        excess_tokens: u64,
    ) -> Vec<String> {
        let target = tokens_to_bytes(excess_tokens);
        if target == 0 {
            return Vec::new();
        }
        let window_start = state
            .message_count()
            .saturating_sub(self.config.protected_recent_messages);
        let mut candidates: Vec<_> = state
            .live_outputs()
            .iter()
            .filter(|o| o.message_index < window_start)
            .filter(|o| state.is_auto_prunable(&o.correlation_key, guard))
            .collect();
        // Stable sort keeps older results first among equal sizes.
        candidates.sort_by(|a, b| b.size.cmp(&a.size));

        let mut selected = Vec::new();
        let mut covered = 0u64;
        for output in candidates {
            if covered >= target {
                break;
            }
            covered += output.size as u64;
            selected.push(output.correlation_key.clone());
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatDescriptor, OPENAI_CHAT};
    use serde_json::json;

    fn controller() -> CompactionController {
        CompactionController::new(CompactionConfig::default())
    }

    #[test]
    fn phases_render_kebab_case() {
        assert_eq!(CompactionPhase::StrategiesApplied.to_string(), "strategies-applied");
        assert_eq!(
            serde_json::to_value(CompactionPhase::SummarizationFallback).unwrap(),
            json!("summarization-fallback")
        );
    }

    #[test]
    fn trigger_needs_ratio_and_floor() {
        let c = controller();
        assert!(c.over_threshold(&ContextBudget::new(200_000, 180_000)));
        assert!(!c.over_threshold(&ContextBudget::new(200_000, 160_000)));
        // 90% of a tiny window is still below the 20k floor.
        assert!(!c.over_threshold(&ContextBudget::new(16_000, 14_400)));

        let off = CompactionController::new(CompactionConfig {
            enabled: false,
            ..CompactionConfig::default()
        });
        assert!(!off.over_threshold(&ContextBudget::new(200_000, 190_000)));
    }

    #[tokio::test]
    async fn runs_are_single_flight() {
        let c = controller();
        let budget = ContextBudget::new(200_000, 180_000);
        assert!(c.try_begin("a", &budget).await);
        assert!(!c.try_begin("a", &budget).await);
        // Other conversations are independent.
        assert!(c.try_begin("b", &budget).await);

        c.finish("a", false).await;
        assert!(!c.is_in_progress("a").await);
        assert!(c.try_begin("a", &budget).await);
    }

    #[tokio::test]
    async fn cooldown_starts_after_summarization_attempt() {
        let c = controller();
        let budget = ContextBudget::new(200_000, 180_000);
        assert!(c.try_begin("a", &budget).await);
        c.finish("a", false).await;
        assert!(!c.in_cooldown("a").await);

        assert!(c.try_begin("a", &budget).await);
        c.finish("a", true).await;
        assert!(c.in_cooldown("a").await);
        assert!(!c.try_begin("a", &budget).await);

        c.forget("a").await;
        assert!(c.try_begin("a", &budget).await);
    }

    #[tokio::test]
    async fn zero_cooldown_allows_back_to_back_runs() {
        let c = CompactionController::new(CompactionConfig::default().with_cooldown_secs(0));
        let budget = ContextBudget::new(200_000, 180_000);
        assert!(c.try_begin("a", &budget).await);
        c.finish("a", true).await;
        assert!(c.try_begin("a", &budget).await);
    }

    #[test]
    fn truncation_takes_largest_outside_recent_window() {
        let sizes = [1_000, 8_000, 4_000, 6_000, 9_000];
        let mut messages = vec![json!({"role": "user", "content": "go"})];
        for (i, size) in sizes.iter().enumerate() {
            messages.push(json!({"role": "assistant", "tool_calls": [
                {"id": format!("c{i}"), "function": {"name": "bash", "arguments": format!("{{\"n\":{i}}}")}}
            ]}));
            messages.push(json!({"role": "tool", "tool_call_id": format!("c{i}"), "content": "x".repeat(*size)}));
        }
        let body = json!({"model": "claude-sonnet-4", "messages": messages});
        let guard = ProtectionGuard::default();
        let mut state = ConversationState::new("conv");
        state.sync(&OPENAI_CHAT, OPENAI_CHAT.data_array(&body).unwrap(), &guard, 1000);

        let c = CompactionController::new(CompactionConfig::default().with_protected_recent(2));
        // c4 (9000 bytes) sits in the last two messages.
        let picked = c.select_truncation(&state, &guard, 3_000);
        assert_eq!(picked, vec!["c1", "c3"]);

        assert!(c.select_truncation(&state, &guard, 0).is_empty());
        let all = c.select_truncation(&state, &guard, 1_000_000);
        assert_eq!(all, vec!["c1", "c3", "c2", "c0"]);
    }
}
