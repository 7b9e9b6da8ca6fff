pub mod dedup;
pub mod supersede;

use crate::config::StrategyConfig;
use crate::guard::ProtectionGuard;
use crate::state::ConversationState;
use crate::types::PruneMark;

pub use dedup::Deduplication;
pub use supersede::SupersedeWrites;

/// Decides what becomes prunable. Strategies read the synced state and
/// return marks; they never touch message content.
///
/// Implementations must skip anything `state.is_auto_prunable` rejects:
/// in-flight, pinned, protected or already-marked invocations.
pub trait PruneStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, state: &ConversationState, guard: &ProtectionGuard) -> Vec<PruneMark>;
}

/// The enabled built-in strategies, in the order they run.
pub fn from_config(config: &StrategyConfig) -> Vec<Box<dyn PruneStrategy>> {
    let mut strategies: Vec<Box<dyn PruneStrategy>> = Vec::new();
    if config.deduplication.enabled {
        strategies.push(Box::new(Deduplication::new(
            config.deduplication.protected_tools.clone(),
        )));
    }
    if config.supersede_writes.enabled {
        strategies.push(Box::new(SupersedeWrites::new(
            config.supersede_writes.write_tools.clone(),
            config.supersede_writes.read_tools.clone(),
        )));
    }
    strategies
}
