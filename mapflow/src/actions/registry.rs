//! Action registry mapping type names to factories.

use std::collections::HashMap;
use std::fmt;

use super::{Action, ActionDescriptor};
use crate::errors::MapflowError;

/// Factory function type for creating actions.
pub type ActionFactory = Box<dyn Fn() -> Box<dyn Action> + Send + Sync>;

struct Registration {
    factory: ActionFactory,
    descriptor: ActionDescriptor,
}

/// Registry of action factories.
///
/// Populated through `&mut self` before it is shared; once wrapped in an
/// `Arc` it is read-only, so lookups take no locks.
#[derive(Default)]
pub struct ActionRegistry {
    entries: HashMap<String, Registration>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}

impl ActionRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in actions.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtin_actions(&mut registry);
        registry
    }

    /// Registers a factory under `action_type`.
    ///
    /// The factory is called once to capture the action's descriptor.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAction` if the type is already registered.
    pub fn register(
        &mut self,
        action_type: impl Into<String>,
        factory: ActionFactory,
    ) -> Result<(), MapflowError> {
        let action_type = action_type.into();
        if self.entries.contains_key(&action_type) {
            return Err(MapflowError::duplicate_action(action_type));
        }
        let mut descriptor = factory().descriptor();
        descriptor.action_type.clone_from(&action_type);
        self.entries.insert(action_type, Registration { factory, descriptor });
        Ok(())
    }

    /// Registers an action type constructed through `Default`.
    pub fn register_default<A>(&mut self, action_type: impl Into<String>) -> Result<(), MapflowError>
    where
        A: Action + Default + 'static,
    {
        self.register(action_type, Box::new(|| Box::new(A::default())))
    }

    /// Constructs a fresh action instance.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAction` if the type is not registered.
    pub fn resolve(&self, action_type: &str) -> Result<Box<dyn Action>, MapflowError> {
        self.entries
            .get(action_type)
            .map(|entry| (entry.factory)())
            .ok_or_else(|| MapflowError::unknown_action(action_type))
    }

    /// Gets the descriptor captured at registration.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAction` if the type is not registered.
    pub fn descriptor(&self, action_type: &str) -> Result<&ActionDescriptor, MapflowError> {
        self.entries
            .get(action_type)
            .map(|entry| &entry.descriptor)
            .ok_or_else(|| MapflowError::unknown_action(action_type))
    }

    /// Checks if a type is registered.
    #[must_use]
    pub fn contains(&self, action_type: &str) -> bool {
        self.entries.contains_key(action_type)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAction;
    use std::sync::Arc;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ActionRegistry::new();
        registry.register_default::<MockAction>("mock").unwrap();

        assert!(registry.contains("mock"));
        assert_eq!(registry.descriptor("mock").unwrap().action_type, "mock");
        assert!(registry.resolve("mock").is_ok());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = ActionRegistry::new();
        registry.register_default::<MockAction>("mock").unwrap();
        let err = registry.register_default::<MockAction>("mock").unwrap_err();
        assert_eq!(err.kind(), "duplicate_action");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActionRegistry::new();
        let err = registry.resolve("nope").err().unwrap();
        assert_eq!(err.kind(), "unknown_action");
        assert!(registry.descriptor("nope").is_err());
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(
            registry.action_types(),
            vec![
                "export_results",
                "filter_by_confidence",
                "invert_mappings",
                "load_identifiers",
                "load_mappings",
                "merge_identifiers",
                "reconcile_bidirectional",
            ]
        );
    }

    #[test]
    fn test_shared_registry_resolves_concurrently() {
        let registry = Arc::new(ActionRegistry::with_builtins());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.resolve("load_identifiers").is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
