//! Static registry of backend implementations keyed by backend kind

use crate::{EchoBackend, MockBackend, MockBackendConfig};
use mesh_core::{BackendKind, BackendPlugin, Error, ModelDescriptor, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds a backend instance for one model
pub type BackendFactory =
    Arc<dyn Fn(&ModelDescriptor) -> Result<Arc<dyn BackendPlugin>> + Send + Sync>;

/// Maps backend kinds to factories. Populated once at startup.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `echo` and `mock` backends
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(BackendKind::Echo, |_| {
            Ok(Arc::new(EchoBackend::new()) as Arc<dyn BackendPlugin>)
        });
        registry.register(BackendKind::Mock, |_| {
            Ok(Arc::new(MockBackend::new(MockBackendConfig::default())) as Arc<dyn BackendPlugin>)
        });
        registry
    }

    /// Register or replace the factory for a backend kind
    pub fn register<F>(&mut self, kind: BackendKind, factory: F)
    where
        F: Fn(&ModelDescriptor) -> Result<Arc<dyn BackendPlugin>> + Send + Sync + 'static,
    {
        debug!("Registering backend factory for {}", kind);
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn contains(&self, kind: &BackendKind) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.factories.keys().cloned().collect()
    }

    /// Instantiate the backend for a model
    pub fn create(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn BackendPlugin>> {
        let factory = self.factories.get(&descriptor.backend).ok_or_else(|| {
            Error::validation(format!(
                "no backend registered for kind {} (model {})",
                descriptor.backend, descriptor.name
            ))
        })?;
        factory(descriptor)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_backends() {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.contains(&BackendKind::Echo));
        assert!(registry.contains(&BackendKind::Mock));
        assert!(!registry.contains(&BackendKind::Onnx));

        let descriptor = ModelDescriptor::new("m1", BackendKind::Echo, "none");
        let backend = registry.create(&descriptor).unwrap();
        assert_eq!(backend.kind(), BackendKind::Echo);
    }

    #[test]
    fn test_unknown_backend_kind() {
        let registry = BackendRegistry::with_builtin();
        let descriptor = ModelDescriptor::new("m1", BackendKind::Gguf, "model.gguf");
        let err = registry.create(&descriptor).err().unwrap();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = BackendRegistry::new();
        let shared = MockBackend::new(MockBackendConfig::default());
        let handle = shared.clone();
        registry.register(BackendKind::Custom("scripted".into()), move |_| {
            Ok(Arc::new(handle.clone()) as Arc<dyn BackendPlugin>)
        });

        let descriptor =
            ModelDescriptor::new("m1", BackendKind::Custom("scripted".into()), "none");
        assert!(registry.create(&descriptor).is_ok());
        assert_eq!(registry.kinds().len(), 1);
    }
}
