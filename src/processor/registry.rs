use dashmap::{DashMap, Entry};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Identifier of a registered component, hashed from its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentId {
    name: String,
    hash: u64,
}

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        let name = id.into();
        let mut hasher = fnv::FnvHasher::default();
        name.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for ComponentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.hash)
    }
}

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No component is registered under the identifier.
    #[error("Component with id '{id}' not found.")]
    MissingComponent { id: ComponentId },

    /// A component is already registered under the identifier.
    #[error("Component with id '{id}' already exists.")]
    ConflictingComponentId { id: ComponentId },
}

impl RegistryError {
    #[inline]
    pub(crate) const fn missing_component(id: ComponentId) -> Self {
        Self::MissingComponent { id }
    }

    #[inline]
    pub(crate) const fn conflicting_component_id(id: ComponentId) -> Self {
        Self::ConflictingComponentId { id }
    }
}

/// A thread-safe registry of shared components.
///
/// Registries are owned by a [`MediationContext`](crate::context::MediationContext)
/// so two contexts never share state through them.
pub struct Registry<T>
where
    T: ?Sized + Send + Sync,
{
    entries: DashMap<ComponentId, Arc<T>, fnv::FnvBuildHasher>,
}

impl<T> Registry<T>
where
    T: ?Sized + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    /// Retrieves a component by its identifier.
    pub fn find_with_id(&self, id: &ComponentId) -> Result<Arc<T>, RegistryError> {
        match self.entries.get(id) {
            None => Err(RegistryError::missing_component(id.clone())),
            Some(entry) => Ok(entry.value().clone()),
        }
    }

    /// Registers a component, refusing to overwrite an existing one.
    pub fn register(&self, id: ComponentId, component: Arc<T>) -> Result<(), RegistryError> {
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::conflicting_component_id(id)),
            Entry::Vacant(entry) => {
                log::debug!("Registered component {}", id);
                entry.insert(component);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, id: &ComponentId) -> Option<Arc<T>> {
        self.entries.remove(id).map(|(_, component)| component)
    }

    /// Snapshot of the registered components, in no particular order.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Registry<T>
where
    T: ?Sized + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct TestComponent {
        name: String,
    }

    impl Named for TestComponent {
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn component(name: &str) -> Arc<dyn Named> {
        Arc::new(TestComponent {
            name: name.to_string(),
        })
    }

    #[test]
    fn test_register_multiple_components_success() {
        let registry: Registry<dyn Named> = Registry::new();
        assert!(registry.register(ComponentId::new("a"), component("a")).is_ok());
        assert!(registry.register(ComponentId::new("b"), component("b")).is_ok());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_with_id(&ComponentId::new("b")).unwrap().name(), "b");
    }

    #[test]
    fn test_register_with_conflicting_id() {
        let registry: Registry<dyn Named> = Registry::new();
        registry.register(ComponentId::new("dup"), component("first")).unwrap();
        let result = registry.register(ComponentId::new("dup"), component("second"));
        assert!(matches!(result, Err(RegistryError::ConflictingComponentId { .. })));
        assert_eq!(registry.find_with_id(&ComponentId::new("dup")).unwrap().name(), "first");
    }

    #[test]
    fn test_find_nonexistent_component() {
        let registry: Registry<dyn Named> = Registry::new();
        let result = registry.find_with_id(&ComponentId::new("missing"));
        assert!(matches!(result, Err(RegistryError::MissingComponent { .. })));
    }

    #[test]
    fn test_unregister() {
        let registry: Registry<dyn Named> = Registry::new();
        registry.register(ComponentId::new("a"), component("a")).unwrap();
        assert!(registry.unregister(&ComponentId::new("a")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_thread_safety() {
        use std::thread;

        let registry: Arc<Registry<dyn Named>> = Arc::new(Registry::new());
        for i in 0..5 {
            registry
                .register(ComponentId::new(format!("c_{}", i)), component(&format!("c_{}", i)))
                .unwrap();
        }

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry
                        .find_with_id(&ComponentId::new(format!("c_{}", i)))
                        .unwrap()
                        .name()
                        .to_string()
                })
            })
            .collect();

        let results: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for i in 0..5 {
            assert!(results.contains(&format!("c_{}", i)));
        }
    }
}
