//! Best-effort account notifications

use crate::error::EngineResult;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Push delivery to an account holder
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, identity: &str, title: &str, body: &str, data: Value) -> EngineResult<()>;
}

/// Notifier that records pushes in the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn push(&self, identity: &str, title: &str, body: &str, data: Value) -> EngineResult<()> {
        info!(identity, title, %data, "{}", body);
        Ok(())
    }
}
