use std::sync::Arc;

use agent_provider::{ModelGateway, ProviderInitError};
use agent_provider_mock::{ScriptedGateway, MOCK_PROVIDER_ID};

pub const DEFAULT_PROVIDER_ID: &str = MOCK_PROVIDER_ID;
pub const PROVIDER_ENV_VAR: &str = "SESSION_AGENT_PROVIDER";

/// Resolves the gateway named by `SESSION_AGENT_PROVIDER`, defaulting to `mock`.
pub fn provider_from_env() -> Result<Arc<dyn ModelGateway>, ProviderInitError> {
    let provider_id = std::env::var(PROVIDER_ENV_VAR)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    provider_for_id(provider_id.as_deref().unwrap_or(DEFAULT_PROVIDER_ID))
}

pub fn provider_for_id(provider_id: &str) -> Result<Arc<dyn ModelGateway>, ProviderInitError> {
    match provider_id {
        MOCK_PROVIDER_ID => Ok(Arc::new(ScriptedGateway::default())),
        unknown => Err(ProviderInitError::new(format!(
            "Unsupported provider '{unknown}'. Available providers: {MOCK_PROVIDER_ID}"
        ))),
    }
}
