use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::budget::bytes_to_tokens;
use crate::error::PruneError;
use crate::format::{assistant_steps, FormatDescriptor};
use crate::guard::ProtectionGuard;
use crate::rewrite::compact_input;
use crate::types::{PruneMark, PruneStats, ToolInvocationRecord, ToolOutputRef, ToolStatus, Usage};

/// What one sync changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub new_records: usize,
    pub steps_added: u64,
    pub evicted: usize,
    pub pins_expired: usize,
}

/// Per-sync snapshot of the live message list. Rebuilt every transform,
/// never persisted.
#[derive(Debug, Clone, Default)]
struct LiveView {
    calls: HashSet<String>,
    results: HashSet<String>,
    outputs: Vec<ToolOutputRef>,
    canonical: Vec<String>,
    message_count: usize,
}

/// Everything the engine knows about one conversation.
///
/// Invocations are keyed by correlation key and kept in first-seen order.
/// Records are never deleted except by the cache bound, and never while
/// their call is still in the live message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    conversation_id: String,
    invocations: HashMap<String, ToolInvocationRecord>,
    order: VecDeque<String>,
    marks: HashMap<String, PruneMark>,
    /// Keys whose rewrite has been applied at least once.
    pruned: HashSet<String>,
    /// Key → turn at which the pin expires.
    pins: HashMap<String, u64>,
    turn_counter: u64,
    /// Step count derived from the list at the previous sync.
    last_derived_steps: u64,
    stats: PruneStats,
    #[serde(default)]
    last_usage: Option<Usage>,
    #[serde(default)]
    last_model: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    live: LiveView,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            invocations: HashMap::new(),
            order: VecDeque::new(),
            marks: HashMap::new(),
            pruned: HashSet::new(),
            pins: HashMap::new(),
            turn_counter: 0,
            last_derived_steps: 0,
            stats: PruneStats::default(),
            last_usage: None,
            last_model: None,
            created_at: now,
            updated_at: now,
            live: LiveView::default(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn turn_counter(&self) -> u64 {
        self.turn_counter
    }

    pub fn stats(&self) -> PruneStats {
        self.stats
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Re-derive everything from the live message list: turn counter, cached
    /// invocations and their status, expired pins, the cache bound, and the
    /// canonical prunable list.
    pub fn sync(
        &mut self,
        descriptor: &dyn FormatDescriptor,
        data: &[Value],
        guard: &ProtectionGuard,
        max_cached: usize,
    ) -> SyncReport {
        let mut report = SyncReport::default();

        let (steps, total) = assistant_steps(descriptor, data);
        if total >= self.last_derived_steps {
            report.steps_added = total - self.last_derived_steps;
            self.turn_counter += report.steps_added;
        } else {
            // History was truncated under us. Keep the counter, move the baseline.
            debug!(
                conversation = %self.conversation_id,
                from = self.last_derived_steps,
                to = total,
                "step count dropped, rebaselining turn counter"
            );
        }
        self.last_derived_steps = total;

        report.new_records = self.cache_tool_parameters(descriptor, data, &steps, total);

        let outputs = descriptor.extract_tool_outputs(data);
        for output in &outputs {
            if let Some(record) = self.invocations.get_mut(&output.correlation_key) {
                record.status = if output.is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Completed
                };
            }
        }
        self.live.results = outputs.iter().map(|o| o.correlation_key.clone()).collect();
        self.live.outputs = outputs;
        self.live.message_count = data.len();

        let turn = self.turn_counter;
        let before = self.pins.len();
        self.pins.retain(|_, expiry| *expiry > turn);
        report.pins_expired = before - self.pins.len();

        report.evicted = self.enforce_cache_bound(max_cached);
        self.refresh_canonical(guard);
        report
    }

    /// Cache every parseable tool call in the list. Calls with malformed
    /// arguments are skipped.
    fn cache_tool_parameters(
        &mut self,
        descriptor: &dyn FormatDescriptor,
        data: &[Value],
        steps: &[u64],
        total: u64,
    ) -> usize {
        let mut added = 0;
        self.live.calls.clear();
        for call in descriptor.tool_calls(data) {
            let parameters = match call.parameters {
                Ok(p) => p,
                Err(e) => {
                    let err = PruneError::Parse(e);
                    debug!(
                        conversation = %self.conversation_id,
                        key = %call.correlation_key,
                        tool = %call.tool_name,
                        error = %err,
                        "skipping tool call"
                    );
                    continue;
                }
            };
            self.live.calls.insert(call.correlation_key.clone());
            if let Some(existing) = self.invocations.get(&call.correlation_key) {
                if self.is_same_call(existing, &call.tool_name, &parameters) {
                    continue;
                }
                // Positional keys shift when the host drops earlier turns;
                // the key now names a different call.
                debug!(
                    conversation = %self.conversation_id,
                    key = %call.correlation_key,
                    was = %existing.tool_name,
                    now = %call.tool_name,
                    "correlation key reused, replacing record"
                );
                self.forget(&call.correlation_key);
            }
            let step = steps.get(call.message_index).copied().unwrap_or(total);
            let record = ToolInvocationRecord {
                correlation_key: call.correlation_key.clone(),
                tool_name: call.tool_name,
                parameters,
                status: ToolStatus::Pending,
                turn_index: self.turn_counter.saturating_sub(total - step.min(total)),
            };
            self.order.push_back(call.correlation_key.clone());
            self.invocations.insert(call.correlation_key, record);
            added += 1;
        }
        added
    }

    /// A cached record still describes the live call at its key. The live
    /// arguments may already be the compacted form written by a rewrite.
    fn is_same_call(&self, record: &ToolInvocationRecord, tool_name: &str, parameters: &Value) -> bool {
        if record.tool_name != tool_name {
            return false;
        }
        if record.parameters == *parameters {
            return true;
        }
        self.marks
            .get(&record.correlation_key)
            .is_some_and(|m| compact_input(m.reason, &record.parameters) == *parameters)
    }

    fn forget(&mut self, key: &str) {
        self.invocations.remove(key);
        self.marks.remove(key);
        self.pins.remove(key);
        self.pruned.remove(key);
        self.order.retain(|k| k != key);
    }

    /// Evict the oldest records that are no longer in the live list until
    /// the map fits. Live records are never evicted.
    fn enforce_cache_bound(&mut self, max_cached: usize) -> usize {
        let overflow = self.invocations.len().saturating_sub(max_cached);
        if overflow == 0 {
            return 0;
        }
        let victims: HashSet<String> = self
            .order
            .iter()
            .filter(|k| !self.live.calls.contains(*k))
            .take(overflow)
            .cloned()
            .collect();
        for key in &victims {
            self.invocations.remove(key);
            self.marks.remove(key);
            self.pins.remove(key);
            self.pruned.remove(key);
        }
        self.order.retain(|k| !victims.contains(k));
        if victims.len() < overflow {
            debug!(
                conversation = %self.conversation_id,
                size = self.invocations.len(),
                max_cached,
                "cache over bound, remaining entries are live"
            );
        }
        victims.len()
    }

    /// Rebuild the canonical list: live, answered, unmarked, unprotected
    /// invocations in first-seen order. Pinned records stay listed.
    pub fn refresh_canonical(&mut self, guard: &ProtectionGuard) {
        let canonical = self
            .order
            .iter()
            .filter(|k| self.live.calls.contains(*k) && self.live.results.contains(*k))
            .filter(|k| !self.marks.contains_key(*k))
            .filter(|k| self.invocations.get(*k).is_some_and(|r| !guard.protects(r)))
            .cloned()
            .collect();
        self.live.canonical = canonical;
    }

    /// Correlation keys in canonical order; canonical id `n` is index `n - 1`.
    pub fn canonical_keys(&self) -> &[String] {
        &self.live.canonical
    }

    pub fn canonical_id(&self, key: &str) -> Option<usize> {
        self.live.canonical.iter().position(|k| k == key).map(|i| i + 1)
    }

    /// Map canonical ids to correlation keys. Every id is checked before
    /// anything is returned; ids that are unknown, out of range, or marked
    /// since the list was derived are all reported together.
    pub fn resolve_ids(&self, ids: &[String]) -> Result<Vec<String>, PruneError> {
        let mut keys = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            let key = id
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| self.live.canonical.get(i))
                .filter(|k| !self.marks.contains_key(*k));
            match key {
                Some(k) => keys.push(k.clone()),
                None => stale.push(id.clone()),
            }
        }
        if !stale.is_empty() {
            return Err(PruneError::StaleReference { ids: stale });
        }
        Ok(keys)
    }

    pub fn record(&self, key: &str) -> Option<&ToolInvocationRecord> {
        self.invocations.get(key)
    }

    /// All cached records in first-seen order.
    pub fn records(&self) -> impl Iterator<Item = &ToolInvocationRecord> {
        self.order.iter().filter_map(|k| self.invocations.get(k))
    }

    /// Records whose call is in the live list, in first-seen order.
    pub fn live_records(&self) -> impl Iterator<Item = &ToolInvocationRecord> {
        self.records()
            .filter(|r| self.live.calls.contains(&r.correlation_key))
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.len()
    }

    pub fn live_outputs(&self) -> &[ToolOutputRef] {
        &self.live.outputs
    }

    pub fn message_count(&self) -> usize {
        self.live.message_count
    }

    /// Eligible for automatic marking: answered, unmarked, unpinned and not
    /// protected.
    pub fn is_auto_prunable(&self, key: &str, guard: &ProtectionGuard) -> bool {
        let Some(record) = self.invocations.get(key) else {
            return false;
        };
        self.live.calls.contains(key)
            && self.live.results.contains(key)
            && !record.status.is_in_flight()
            && !self.marks.contains_key(key)
            && !self.is_pinned(key)
            && !guard.protects(record)
    }

    /// Record a mark. An existing mark for the key wins; returns whether
    /// this one was added.
    pub fn mark(&mut self, mark: PruneMark) -> bool {
        if self.marks.contains_key(&mark.correlation_key)
            || !self.invocations.contains_key(&mark.correlation_key)
        {
            return false;
        }
        self.marks.insert(mark.correlation_key.clone(), mark);
        true
    }

    pub fn mark_for(&self, key: &str) -> Option<&PruneMark> {
        self.marks.get(key)
    }

    pub fn is_marked(&self, key: &str) -> bool {
        self.marks.contains_key(key)
    }

    /// Marks in first-seen order of their records.
    pub fn marks_in_order(&self) -> Vec<PruneMark> {
        self.order
            .iter()
            .filter_map(|k| self.marks.get(k))
            .cloned()
            .collect()
    }

    pub fn is_applied(&self, key: &str) -> bool {
        self.pruned.contains(key)
    }

    /// Note that a mark's rewrite happened and credit its savings. Savings
    /// are only counted the first time; returns whether this was it.
    pub fn record_applied(&mut self, key: &str, bytes_saved: u64) -> bool {
        if !self.pruned.insert(key.to_string()) {
            return false;
        }
        self.stats.pruned_count += 1;
        self.stats.bytes_saved += bytes_saved;
        self.stats.tokens_saved += bytes_to_tokens(bytes_saved);
        true
    }

    /// Pin `key` for `turns` turns from now; returns the expiry turn.
    pub fn pin(&mut self, key: &str, turns: u64) -> u64 {
        let expiry = self.turn_counter + turns;
        self.pins.insert(key.to_string(), expiry);
        expiry
    }

    pub fn pin_expiry(&self, key: &str) -> Option<u64> {
        self.pins.get(key).copied()
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.pins.get(key).is_some_and(|&expiry| expiry > self.turn_counter)
    }

    pub fn record_usage(&mut self, model: Option<&str>, usage: Usage) {
        self.last_usage = Some(usage);
        if let Some(model) = model {
            self.last_model = Some(model.to_string());
        }
    }

    pub fn last_usage(&self) -> Option<Usage> {
        self.last_usage
    }

    /// Consume the recorded usage so it is evaluated at most once.
    pub fn take_usage(&mut self) -> Option<Usage> {
        self.last_usage.take()
    }

    pub fn last_model(&self) -> Option<&str> {
        self.last_model.as_deref()
    }

    pub fn set_model(&mut self, model: &str) {
        self.last_model = Some(model.to_string());
    }
}
