// ./infrastructure/src/bootstrap.rs
use crate::config::{BackendKind, ConfigError, ENDPOINT_VAR, StoreConfig};
use crate::persistence::{DocumentAccountRepository, InMemoryAccountRepository};
use crate::store::ElasticsearchClient;
use application::{AccountRepository, DocumentStore};
use std::sync::Arc;
use tracing::info;

/// Builds the HTTP document store described by `config`. The client is
/// created once here and shared by everything it is injected into.
pub fn build_document_store(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>, ConfigError> {
    let endpoint = config
        .endpoint
        .clone()
        .ok_or(ConfigError::Missing(ENDPOINT_VAR))?;
    info!(host = endpoint.host_str().unwrap_or_default(), "Connecting to document store");
    let mut client = ElasticsearchClient::new(endpoint).with_refresh_policy(config.refresh);
    if let Some(credentials) = &config.credentials {
        client = client.with_credentials(credentials.clone());
    }
    Ok(Arc::new(client))
}

/// Selects and constructs the account repository for `config`.
pub fn build_account_repository(
    config: &StoreConfig,
) -> Result<Arc<dyn AccountRepository>, ConfigError> {
    match config.backend {
        BackendKind::Elasticsearch => {
            let store = build_document_store(config)?;
            info!("Using document-store account repository");
            Ok(Arc::new(DocumentAccountRepository::new(store)))
        }
        BackendKind::InMemory => {
            info!("Using in-memory account repository");
            Ok(Arc::new(InMemoryAccountRepository::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Account;
    use url::Url;

    #[tokio::test]
    async fn in_memory_config_builds_working_repository() {
        let repo = build_account_repository(&StoreConfig::in_memory()).unwrap();
        let account = Account::new("jane@example.com", "hash", 3).unwrap();
        repo.create_user(&account).await.unwrap();
        assert!(repo.user_exists("jane@example.com").await.unwrap());
    }

    #[test]
    fn elasticsearch_config_without_endpoint_is_rejected() {
        let config = StoreConfig {
            backend: BackendKind::Elasticsearch,
            ..StoreConfig::in_memory()
        };
        assert!(matches!(
            build_account_repository(&config),
            Err(ConfigError::Missing(var)) if var == ENDPOINT_VAR
        ));
    }

    #[test]
    fn elasticsearch_config_builds_client() {
        let config = StoreConfig {
            backend: BackendKind::Elasticsearch,
            endpoint: Some(Url::parse("http://localhost:9200").unwrap()),
            ..StoreConfig::in_memory()
        };
        assert!(build_account_repository(&config).is_ok());
    }
}
