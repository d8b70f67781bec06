//! Pass-through backend

use async_trait::async_trait;
use mesh_core::{
    BackendKind, BackendPlugin, BatchInput, BatchOutput, Error, HealthStatus, ModelDescriptor,
    Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Returns every input item unchanged
#[derive(Debug, Default)]
pub struct EchoBackend {
    loaded: AtomicBool,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendPlugin for EchoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Echo
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<()> {
        debug!("Echo backend loaded for {}", descriptor.name);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        self.loaded.store(false, Ordering::Release);
        Ok(())
    }

    async fn predict(&self, input: BatchInput) -> Result<BatchOutput> {
        if !self.loaded.load(Ordering::Acquire) {
            return Err(Error::plugin_call_failed(format!(
                "echo backend for {} is not loaded",
                input.model
            )));
        }
        Ok(BatchOutput::from_payloads(input.items))
    }

    async fn health_check(&self) -> HealthStatus {
        if self.loaded.load(Ordering::Acquire) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::Payload;

    #[tokio::test]
    async fn test_echo_returns_input() {
        let backend = EchoBackend::new();
        let input = BatchInput {
            model: "m1".to_string(),
            items: vec![Payload::from("a"), Payload::Tokens(vec![1, 2, 3])],
            padded_len: None,
        };

        assert!(backend.predict(input.clone()).await.is_err());
        assert_eq!(backend.health_check().await, HealthStatus::Unknown);

        let descriptor = ModelDescriptor::new("m1", BackendKind::Echo, "none");
        backend.load(&descriptor).await.unwrap();
        assert!(backend.health_check().await.is_healthy());

        let output = backend.predict(input.clone()).await.unwrap();
        assert_eq!(output, BatchOutput::from_payloads(input.items));

        backend.unload().await.unwrap();
        assert_eq!(backend.health_check().await, HealthStatus::Unknown);
    }
}
