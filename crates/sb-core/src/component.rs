//! Component lifecycle contract
//!
//! Every supervised piece (scanner, broker client, metrics exporter, event
//! pipeline) implements this trait. The application starts components in
//! dependency order, fails fast when an enabled component cannot start, and
//! stops everything in reverse order on shutdown or reload.

use async_trait::async_trait;

#[async_trait]
pub trait Component: Send + Sync {
    /// Stable name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Whether configuration enables this component. Disabled components are
    /// simply never built, so the default is true.
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_running(&self) -> bool;

    /// Bring the component up. Failing here aborts startup (fail-fast) or
    /// triggers a reload rollback.
    async fn start(&self) -> anyhow::Result<()>;

    /// Tear the component down. Must be idempotent.
    async fn stop(&self);
}
