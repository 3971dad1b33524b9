//! Built-in actions.

mod export;
mod loaders;
mod mapping;

pub use export::ExportResults;
pub use loaders::{LoadIdentifiers, LoadMappings, MergeIdentifiers};
pub use mapping::{FilterByConfidence, InvertMappings, ReconcileBidirectional};

use super::{Action, ActionRegistry};

fn builtins() -> Vec<(&'static str, super::ActionFactory)> {
    fn factory<A: Action + Default + 'static>() -> super::ActionFactory {
        Box::new(|| Box::new(A::default()))
    }
    vec![
        ("load_identifiers", factory::<LoadIdentifiers>()),
        ("load_mappings", factory::<LoadMappings>()),
        ("merge_identifiers", factory::<MergeIdentifiers>()),
        ("invert_mappings", factory::<InvertMappings>()),
        ("filter_by_confidence", factory::<FilterByConfidence>()),
        ("reconcile_bidirectional", factory::<ReconcileBidirectional>()),
        ("export_results", factory::<ExportResults>()),
    ]
}

/// Registers every built-in action that is not already registered.
///
/// Types registered beforehand keep their registration, so callers can
/// substitute their own implementation of a built-in.
pub fn register_builtin_actions(registry: &mut ActionRegistry) {
    for (action_type, factory) in builtins() {
        if !registry.contains(action_type) {
            // Cannot fail: the type was just checked.
            let _ = registry.register(action_type, factory);
        }
    }
}
