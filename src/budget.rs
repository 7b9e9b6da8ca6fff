
/// Environment opt-in for 1M-token context on models that support it.
/// Comma-separated model-family substrings, or `1` / `all`.
pub const EXTENDED_CONTEXT_ENV: &str = "NEXUS_PRUNE_EXTENDED_CONTEXT";

/// Used when the model id matches nothing in the table.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 128_000;

const EXTENDED_CONTEXT_LIMIT: u64 = 1_000_000;

/// Known model families, most specific first. Matched as substrings of the
/// lower-cased model id, so provider prefixes (`anthropic/`, `us.`) don't matter.
const CONTEXT_LIMITS: &[(&str, u64)] = &[
    ("claude", 200_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-5", 400_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5", 16_385),
    ("o4-mini", 200_000),
    ("o3", 200_000),
    ("o1", 200_000),
    ("gemini-2.5", 1_048_576),
    ("gemini-2.0", 1_048_576),
    ("gemini-1.5-pro", 2_097_152),
    ("gemini", 1_048_576),
    ("codestral", 256_000),
    ("devstral", 128_000),
    ("mistral-large", 128_000),
    ("mistral", 32_000),
    ("command-a", 256_000),
    ("command-r", 128_000),
    ("llama", 128_000),
    ("deepseek", 128_000),
    ("qwen", 128_000),
];

/// Model families that accept the extended 1M window when opted in.
const EXTENDED_CAPABLE: &[&str] = &["claude-sonnet-4", "claude-4-sonnet"];

/// Chars/4; good enough for trend detection and savings accounting.
pub fn bytes_to_tokens(bytes: u64) -> u64 {
    bytes / 4
}

pub fn tokens_to_bytes(tokens: u64) -> u64 {
    tokens * 4
}

/// Infer the context limit for a model id, honouring the environment opt-in.
pub fn infer_context_limit(model: &str) -> u64 {
    let opt_in = std::env::var(EXTENDED_CONTEXT_ENV).ok();
    infer_context_limit_with(model, opt_in.as_deref())
}

/// Pure form of [`infer_context_limit`] with the opt-in value passed explicitly.
pub fn infer_context_limit_with(model: &str, extended_opt_in: Option<&str>) -> u64 {
    let model = model.to_ascii_lowercase();

    if let Some(opt_in) = extended_opt_in {
        if extended_enabled_for(&model, opt_in) {
            return EXTENDED_CONTEXT_LIMIT;
        }
    }

    CONTEXT_LIMITS
        .iter()
        .find(|(pattern, _)| model.contains(pattern))
        .map(|&(_, limit)| limit)
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
}

fn extended_enabled_for(model: &str, opt_in: &str) -> bool {
    let capable = EXTENDED_CAPABLE.iter().any(|family| model.contains(family));
    if !capable {
        return false;
    }
    opt_in
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .any(|s| s == "1" || s == "all" || s == "true" || model.contains(&s))
}

/// Usage of a context window at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudget {
    pub context_limit: u64,
    pub used_tokens: u64,
}

impl ContextBudget {
    pub fn new(context_limit: u64, used_tokens: u64) -> Self {
        Self {
            context_limit,
            used_tokens,
        }
    }

    /// Fraction of the context limit used (0.0 to 1.0+).
    pub fn usage_ratio(&self) -> f64 {
        if self.context_limit == 0 {
            return 1.0;
        }
        self.used_tokens as f64 / self.context_limit as f64
    }

    /// Same budget after `saved` tokens were removed from the conversation.
    pub fn after_savings(&self, saved: u64) -> Self {
        Self {
            context_limit: self.context_limit,
            used_tokens: self.used_tokens.saturating_sub(saved),
        }
    }

    /// Tokens that must go to bring usage down to `ratio`.
    pub fn excess_over(&self, ratio: f64) -> u64 {
        let target = (self.context_limit as f64 * ratio).round() as u64;
        self.used_tokens.saturating_sub(target)
    }
}
