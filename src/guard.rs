use std::collections::HashSet;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use tracing::warn;

use crate::config::PruneConfig;
use crate::types::ToolInvocationRecord;

/// Argument names that carry a file path, in lookup order.
const PATH_KEYS: &[&str] = &["filePath", "file_path", "path", "notebook_path"];

/// The file path an invocation targets, if its arguments name one.
pub fn target_path(parameters: &Value) -> Option<&str> {
    PATH_KEYS
        .iter()
        .find_map(|k| parameters.get(*k).and_then(Value::as_str))
        .filter(|p| !p.is_empty())
}

/// Pre-filter shared by every strategy and by canonical-id derivation.
/// Protected invocations are never listed as prunable and never auto-marked.
#[derive(Debug, Clone)]
pub struct ProtectionGuard {
    tools: HashSet<String>,
    paths: GlobSet,
}

impl ProtectionGuard {
    pub fn new(tools: &[String], path_patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in path_patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => warn!(pattern, error = %e, "ignoring invalid protected path pattern"),
            }
        }
        let paths = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "protected path set failed to build, no paths protected");
            GlobSet::empty()
        });
        Self {
            tools: tools.iter().map(|t| t.to_ascii_lowercase()).collect(),
            paths,
        }
    }

    pub fn from_config(config: &PruneConfig) -> Self {
        Self::new(&config.protected_tools, &config.protected_paths)
    }

    pub fn protects_tool(&self, tool_name: &str) -> bool {
        self.tools.contains(&tool_name.to_ascii_lowercase())
    }

    pub fn protects_path(&self, path: &str) -> bool {
        self.paths.is_match(path)
    }

    pub fn protects(&self, record: &ToolInvocationRecord) -> bool {
        self.protects_tool(&record.tool_name)
            || target_path(&record.parameters).is_some_and(|p| self.protects_path(p))
    }
}

impl Default for ProtectionGuard {
    fn default() -> Self {
        Self::from_config(&PruneConfig::default())
    }
}
