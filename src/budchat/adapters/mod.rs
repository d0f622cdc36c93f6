//! Concrete transports behind the capability traits.

use std::sync::Arc;

use crate::budchat::BackendConfig;
use crate::budchat::backend::Capabilities;
use crate::budchat::capabilities::NotificationPlatform;
use crate::budchat::error::Result;

pub mod memory;
pub mod realtime;
pub mod rest;

/// Wires REST persistence and the realtime socket for a hosted backend.
pub fn hosted_capabilities(
    config: &BackendConfig,
    notifier: Arc<dyn NotificationPlatform>,
) -> Result<Capabilities> {
    let store = rest::RestStore::new(config)?;
    let realtime = Arc::new(realtime::RealtimeClient::new(config)?);

    tracing::debug!(
        target: "budchat::adapters::hosted_capabilities",
        "Connecting to backend at {}",
        config.url
    );

    Ok(Capabilities {
        store: Arc::new(store),
        changes: realtime.clone(),
        presence: realtime,
        notifier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budchat::capabilities::NoopNotifier;

    #[test]
    fn test_hosted_capabilities_rejects_bad_config() {
        let missing_key = BackendConfig::new("https://x.supabase.co", "");
        assert!(hosted_capabilities(&missing_key, Arc::new(NoopNotifier)).is_err());

        let bad_scheme = BackendConfig::new("ftp://x.supabase.co", "anon");
        assert!(hosted_capabilities(&bad_scheme, Arc::new(NoopNotifier)).is_err());
    }

    #[test]
    fn test_hosted_capabilities_builds_without_connecting() {
        let config = BackendConfig::new("https://x.supabase.co", "anon");
        assert!(hosted_capabilities(&config, Arc::new(NoopNotifier)).is_ok());
    }
}
