use serde::{Deserialize, Serialize};

pub const DEFAULT_PLACEHOLDER: &str =
    "[Output pruned to save context. Re-run the tool if this content is needed again.]";

pub const DEFAULT_TRUNCATED_PLACEHOLDER: &str =
    "[Output truncated during compaction. Re-run the tool if this content is needed again.]";

/// Engine configuration. Supplied by the host's configuration provider;
/// every section defaults so partial documents deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    pub enabled: bool,
    /// Tools never offered as prunable and never auto-marked.
    pub protected_tools: Vec<String>,
    /// Glob patterns; invocations targeting a matching path are protected.
    pub protected_paths: Vec<String>,
    pub placeholder: String,
    pub max_cached_invocations: usize,
    /// Inject the `<prunable-tools>` list into each outgoing request.
    pub inject_prunable_list: bool,
    /// Model-id substrings whose routing rejects trailing user text.
    pub assistant_injection_models: Vec<String>,
    pub strategies: StrategyConfig,
    pub tools: ToolsConfig,
    pub compaction: CompactionConfig,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protected_tools: ["discard", "extract", "pin", "todowrite", "todoread"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            protected_paths: Vec::new(),
            placeholder: DEFAULT_PLACEHOLDER.into(),
            max_cached_invocations: 1000,
            inject_prunable_list: true,
            assistant_injection_models: Vec::new(),
            strategies: StrategyConfig::default(),
            tools: ToolsConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl PruneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protect_tool(mut self, name: impl Into<String>) -> Self {
        self.protected_tools.push(name.into());
        self
    }

    pub fn protect_path(mut self, pattern: impl Into<String>) -> Self {
        self.protected_paths.push(pattern.into());
        self
    }

    pub fn with_placeholder(mut self, text: impl Into<String>) -> Self {
        self.placeholder = text.into();
        self
    }

    pub fn with_max_cached(mut self, n: usize) -> Self {
        self.max_cached_invocations = n;
        self
    }

    pub fn with_prunable_list(mut self, inject: bool) -> Self {
        self.inject_prunable_list = inject;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_tools(mut self, tools: ToolsConfig) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub deduplication: DeduplicationConfig,
    pub supersede_writes: SupersedeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    /// Extra tools exempt from deduplication only.
    pub protected_tools: Vec<String>,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protected_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupersedeConfig {
    pub enabled: bool,
    pub write_tools: Vec<String>,
    pub read_tools: Vec<String>,
}

impl Default for SupersedeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            write_tools: ["write", "edit", "multiedit", "write_file", "edit_file"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            read_tools: ["read", "read_file"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// The LLM-facing discard / extract / pin tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub discard: bool,
    pub extract: bool,
    pub pin: bool,
    pub default_pin_turns: u64,
    /// Ask the user before applying a user-directed prune.
    pub require_confirmation: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            discard: true,
            extract: true,
            pin: true,
            default_pin_turns: 5,
            require_confirmation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Usage ratio (of the inferred context limit) that triggers compaction.
    pub threshold: f64,
    /// Conversations below this many total tokens are never compacted.
    pub min_total_tokens: u64,
    pub cooldown_secs: u64,
    /// Truncation stops once usage is estimated at or below this ratio.
    pub target_ratio: f64,
    /// Most-recent messages never truncated.
    pub protected_recent_messages: usize,
    pub truncated_placeholder: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.85,
            min_total_tokens: 20_000,
            cooldown_secs: 120,
            target_ratio: 0.70,
            protected_recent_messages: 4,
            truncated_placeholder: DEFAULT_TRUNCATED_PLACEHOLDER.into(),
        }
    }
}

impl CompactionConfig {
    pub fn with_threshold(mut self, fraction: f64) -> Self {
        self.threshold = fraction;
        self
    }

    pub fn with_target_ratio(mut self, fraction: f64) -> Self {
        self.target_ratio = fraction;
        self
    }

    pub fn with_min_total_tokens(mut self, tokens: u64) -> Self {
        self.min_total_tokens = tokens;
        self
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn with_protected_recent(mut self, n: usize) -> Self {
        self.protected_recent_messages = n;
        self
    }
}
