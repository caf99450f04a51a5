use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

/// Answers whether the accelerated backend can be used on this host.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn accelerated_backend_available(&self) -> bool;
}

/// Fixed verdict, for hosts where availability is known up front.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl CapabilityProbe for StaticProbe {
    async fn accelerated_backend_available(&self) -> bool {
        self.0
    }
}

/// Runs the wrapped probe once and replays its verdict afterwards.
pub struct MemoizedProbe {
    inner: Box<dyn CapabilityProbe>,
    verdict: OnceCell<bool>,
}

impl MemoizedProbe {
    pub fn new(inner: impl CapabilityProbe + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            verdict: OnceCell::new(),
        }
    }
}

#[async_trait]
impl CapabilityProbe for MemoizedProbe {
    async fn accelerated_backend_available(&self) -> bool {
        *self
            .verdict
            .get_or_init(|| async {
                let available = self.inner.accelerated_backend_available().await;
                info!(available, "probed accelerated backend");
                available
            })
            .await
    }
}
