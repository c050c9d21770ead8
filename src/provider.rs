use async_trait::async_trait;

use crate::error::Result;
use crate::params::{BootstrapParams, ProviderInstance, ProviderInstanceStatus};

/// Instance lifecycle capability implemented by each compute backend.
///
/// Adapters are eventually consistent: a freshly created instance may be
/// reported not-found for a while, and callers tolerate that within the
/// configured settle grace.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create_instance(&self, bootstrap: &BootstrapParams) -> Result<ProviderInstance>;

    async fn get_instance(&self, name: &str) -> Result<ProviderInstance>;

    async fn delete_instance(&self, name: &str) -> Result<()>;

    async fn stop_instance(&self, name: &str) -> Result<()>;

    async fn start_instance(&self, name: &str) -> Result<()>;

    async fn list_instances(&self, pool_id: &str) -> Result<Vec<ProviderInstance>>;

    async fn remove_all_instances(&self) -> Result<()>;
}

/// Maps a raw backend status string onto the states a provider may report.
/// Anything unrecognized is `Unknown` and treated as transient upstream.
pub fn normalize_status(raw: &str) -> ProviderInstanceStatus {
    match raw.to_ascii_lowercase().as_str() {
        "running" | "active" => ProviderInstanceStatus::Running,
        "stopped" | "shutoff" => ProviderInstanceStatus::Stopped,
        "error" => ProviderInstanceStatus::Error,
        _ => ProviderInstanceStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_states_are_unknown() {
        assert_eq!(normalize_status("ACTIVE"), ProviderInstanceStatus::Running);
        assert_eq!(normalize_status("SHUTOFF"), ProviderInstanceStatus::Stopped);
        assert_eq!(normalize_status("error"), ProviderInstanceStatus::Error);
        assert_eq!(normalize_status("BUILD"), ProviderInstanceStatus::Unknown);
        assert_eq!(normalize_status("REBOOT"), ProviderInstanceStatus::Unknown);
        assert_eq!(normalize_status(""), ProviderInstanceStatus::Unknown);
    }
}
