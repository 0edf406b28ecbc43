use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use cartwheel_agent::cache::TtlCache;
use cartwheel_agent::gateway::ToolGateway;
use cartwheel_agent::guardrails::Guardrails;
use cartwheel_agent::health::{spawn_ticker, HealthMonitor};
use cartwheel_agent::llm::{CompletionProvider, HttpCompletionProvider, ProviderError};
use cartwheel_agent::orchestrator::{Orchestrator, ReferenceData};
use cartwheel_agent::retry::RetryPolicy;
use cartwheel_agent::session::SessionStore;
use cartwheel_core::config::{AppConfig, ConfigError, LlmConfig, LlmProvider, LoadOptions};
use cartwheel_core::domain::tool::{ToolCall, ToolKind};

use crate::commerce::HttpCommerceBackend;

pub struct Application {
    pub config: AppConfig,
    pub engine: Arc<Orchestrator>,
    pub health: Arc<HealthMonitor>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("commerce client construction failed: {0}")]
    CommerceClient(#[source] reqwest::Error),
    #[error("completion provider construction failed: {0}")]
    Provider(#[source] ProviderError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        commerce_base_url = %config.commerce.base_url,
        llm_provider = config.llm.provider.as_str(),
        "starting application bootstrap"
    );

    let backend =
        Arc::new(HttpCommerceBackend::from_config(&config.commerce).map_err(BootstrapError::CommerceClient)?);
    let health = Arc::new(HealthMonitor::from_config(&config.health));
    let gateway = ToolGateway::new(
        backend,
        TtlCache::from_config(&config.cache),
        health.clone(),
        RetryPolicy::from(&config.retry),
    );

    let default_provider: Arc<dyn CompletionProvider> = Arc::new(
        HttpCompletionProvider::from_config(&config.llm).map_err(BootstrapError::Provider)?,
    );
    let provider_overrides = build_provider_overrides(&config.llm)?;

    let reference = prefetch_reference_data(&gateway).await;
    info!(
        event_name = "system.bootstrap.reference_data",
        categories_loaded = !reference.categories.is_null(),
        site_config_loaded = !reference.site_config.is_null(),
        "startup reference data fetched"
    );

    let engine = Arc::new(Orchestrator::new(
        Arc::new(SessionStore::new(config.session.clone())),
        gateway,
        Guardrails::new(config.guardrails.clone()),
        default_provider,
        provider_overrides,
        reference,
        config.session.context_window,
    ));

    spawn_ticker(health.clone());
    info!(event_name = "system.bootstrap.completed", "application bootstrap completed");

    Ok(Application { config, engine, health })
}

/// One provider per catalog entry so `providerOverride` on a request can
/// reroute a single turn. Non-default providers fall back to their stock base
/// urls; the configured base url only applies to the configured provider.
fn build_provider_overrides(
    llm: &LlmConfig,
) -> Result<HashMap<LlmProvider, Arc<dyn CompletionProvider>>, BootstrapError> {
    let mut overrides: HashMap<LlmProvider, Arc<dyn CompletionProvider>> = HashMap::new();
    for provider_kind in [LlmProvider::OpenAi, LlmProvider::Anthropic, LlmProvider::Ollama] {
        let member = LlmConfig {
            provider: provider_kind,
            base_url: if provider_kind == llm.provider { llm.base_url.clone() } else { None },
            ..llm.clone()
        };
        overrides.insert(
            provider_kind,
            Arc::new(
                HttpCompletionProvider::from_config(&member).map_err(BootstrapError::Provider)?,
            ),
        );
    }
    Ok(overrides)
}

/// Category tree and site configuration are fetched once and embedded into
/// every system prompt. Failures downgrade to empty reference data; the
/// assistant still works, it just knows less.
async fn prefetch_reference_data(gateway: &ToolGateway) -> ReferenceData {
    ReferenceData {
        categories: fetch_reference(gateway, ToolKind::ListCategories).await,
        site_config: fetch_reference(gateway, ToolKind::GetSiteConfig).await,
    }
}

async fn fetch_reference(gateway: &ToolGateway, kind: ToolKind) -> Value {
    let call = ToolCall::new(format!("startup-{}", kind.name()), kind, json!({}));
    let outcome = gateway.execute(&call, None).await;
    if outcome.is_error {
        warn!(
            event_name = "system.bootstrap.reference_fetch_failed",
            tool = %kind,
            "reference data fetch failed; continuing without it"
        );
        Value::Null
    } else {
        outcome.content
    }
}

#[cfg(test)]
mod tests {
    use cartwheel_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use super::{bootstrap, build_provider_overrides, BootstrapError};

    #[tokio::test]
    async fn bootstrap_fails_fast_on_an_invalid_commerce_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                commerce_base_url: Some("not-a-url".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        match result {
            Err(BootstrapError::Config(error)) => {
                assert!(error.to_string().contains("commerce.base_url"));
            }
            other => panic!("expected a config error, got {:?}", other.err()),
        }
    }

    #[test]
    fn provider_override_catalog_covers_every_provider() {
        let overrides =
            build_provider_overrides(&AppConfig::default().llm).expect("providers should build");
        assert_eq!(overrides.len(), 3);
    }
}
