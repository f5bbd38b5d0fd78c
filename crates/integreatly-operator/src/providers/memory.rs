//! Process-local cloud provider
//!
//! Keeps provisioned resources in memory. Used for local development
//! clusters without a cloud account, and by tests.

use super::{
    normalize_name, CacheSpec, CloudCoords, CloudProvider, DatabaseSpec, ProviderConfig,
    ProviderError, ProviderResult, ProvisionedResource, ResourceKind, PROVIDER_IN_MEMORY,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// In-memory [`CloudProvider`]
pub struct InMemoryProvider {
    config: ProviderConfig,
    resources: DashMap<(ResourceKind, String), ProvisionedResource>,
    reject_creates: AtomicBool,
}

impl InMemoryProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            resources: DashMap::new(),
            reject_creates: AtomicBool::new(false),
        }
    }

    /// Make every subsequent create call fail as a provider rejection
    pub fn reject_creates(&self, reject: bool) {
        self.reject_creates.store(reject, Ordering::SeqCst);
    }

    /// Whether a resource with the given (normalized) id exists
    pub fn contains(&self, kind: ResourceKind, id: &str) -> bool {
        self.resources.contains_key(&(kind, id.to_string()))
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn insert(
        &self,
        kind: ResourceKind,
        id: String,
        coords: Option<CloudCoords>,
    ) -> ProviderResult<ProvisionedResource> {
        let resource = format!("{} {}", kind, id);
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(ProviderError::Unrecoverable {
                resource,
                message: "create rejected".to_string(),
            });
        }

        // entry() holds the shard lock so two racing creates cannot both win
        match self.resources.entry((kind, id.clone())) {
            dashmap::mapref::entry::Entry::Occupied(live) => Err(ProviderError::AlreadyExists {
                resource,
                existing: Some(Box::new(live.get().clone())),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let provisioned = ProvisionedResource { id, kind, coords };
                slot.insert(provisioned.clone());
                debug!(resource = %resource, "Provisioned in-memory resource");
                Ok(provisioned)
            }
        }
    }

    fn remove(&self, kind: ResourceKind, id: String) -> ProviderResult<()> {
        match self.resources.remove(&(kind, id.clone())) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound {
                resource: format!("{} {} in region {}", kind, id, self.config.region),
            }),
        }
    }

    fn coords_for(&self, id: &str, port: i32, username: &str, password: &str) -> CloudCoords {
        CloudCoords {
            host: format!("{}.{}.{}", id, self.config.region, PROVIDER_IN_MEMORY),
            port,
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl CloudProvider for InMemoryProvider {
    fn name(&self) -> &str {
        PROVIDER_IN_MEMORY
    }

    async fn create_storage(&self, name: &str) -> ProviderResult<ProvisionedResource> {
        self.insert(ResourceKind::Storage, normalize_name(name), None)
    }

    async fn remove_storage(&self, name: &str) -> ProviderResult<()> {
        self.remove(ResourceKind::Storage, normalize_name(name))
    }

    async fn list_storage(&self) -> ProviderResult<Vec<String>> {
        let mut names: Vec<String> = self
            .resources
            .iter()
            .filter(|entry| entry.key().0 == ResourceKind::Storage)
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_database(&self, spec: &DatabaseSpec) -> ProviderResult<ProvisionedResource> {
        let id = normalize_name(&spec.cluster_name);
        let coords = self.coords_for(&id, 5432, &spec.master_username, &spec.master_password);
        self.insert(ResourceKind::Database, id, Some(coords))
    }

    async fn remove_database(&self, spec: &DatabaseSpec) -> ProviderResult<()> {
        self.remove(ResourceKind::Database, normalize_name(&spec.cluster_name))
    }

    async fn create_cache(&self, spec: &CacheSpec) -> ProviderResult<ProvisionedResource> {
        let id = normalize_name(&spec.cluster_name);
        let coords = self.coords_for(&id, 6379, "", "");
        self.insert(ResourceKind::Cache, id, Some(coords))
    }

    async fn remove_cache(&self, spec: &CacheSpec) -> ProviderResult<()> {
        self.remove(ResourceKind::Cache, normalize_name(&spec.cluster_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CacheEngine, DatabaseEngine, Tier};

    fn provider() -> InMemoryProvider {
        InMemoryProvider::new(ProviderConfig {
            name: PROVIDER_IN_MEMORY.to_string(),
            ..Default::default()
        })
    }

    fn database_spec() -> DatabaseSpec {
        DatabaseSpec {
            tier: Tier::Development,
            cluster_name: "threescale backend".to_string(),
            db_name: "system".to_string(),
            engine: DatabaseEngine::Postgres,
            engine_version: "10.6".to_string(),
            storage_gb: 20,
            retention_days: 7,
            master_username: "root".to_string(),
            master_password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_storage_twice_signals_already_exists() {
        let provider = provider();
        let created = provider.create_storage("integreatly-foo").await.unwrap();
        assert_eq!(created.kind, ResourceKind::Storage);
        assert!(created.coords.is_none());

        let again = provider.create_storage("integreatly-foo").await;
        assert!(matches!(again, Err(ProviderError::AlreadyExists { .. })));
        assert_eq!(provider.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_storage_signals_not_found() {
        let provider = provider();
        let result = provider.remove_storage("integreatly-missing").await;
        assert!(matches!(result, Err(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_names_are_normalized() {
        let provider = provider();
        provider.create_storage("integreatly  foo").await.unwrap();
        assert!(provider.contains(ResourceKind::Storage, "integreatly-foo"));
        assert_eq!(provider.list_storage().await.unwrap(), vec!["integreatly-foo"]);
        provider.remove_storage("integreatly foo").await.unwrap();
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_database_returns_coords() {
        let provider = provider();
        let db = provider.create_database(&database_spec()).await.unwrap();
        assert_eq!(db.id, "threescale-backend");
        let coords = db.coords.unwrap();
        assert_eq!(coords.port, 5432);
        assert_eq!(coords.username, "root");
        assert!(coords.host.starts_with("threescale-backend.eu-west-1"));

        provider.remove_database(&database_spec()).await.unwrap();
        let gone = provider.remove_database(&database_spec()).await;
        assert!(matches!(gone, Err(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_existing_database_reports_coords() {
        let provider = provider();
        let first = provider.create_database(&database_spec()).await.unwrap();

        let again = provider.create_database(&database_spec()).await.unwrap_err();
        assert_eq!(again.kind(), crate::error::ErrorKind::AlreadyExists);
        let existing = again.into_existing().unwrap();
        assert_eq!(existing, first);
        assert_eq!(existing.coords.unwrap().username, "root");
    }

    #[tokio::test]
    async fn test_cache_lifecycle() {
        let provider = provider();
        let spec = CacheSpec {
            tier: Tier::Development,
            cluster_name: "threescale redis".to_string(),
            engine: CacheEngine::Redis,
            engine_version: "5.0.6".to_string(),
        };
        let cache = provider.create_cache(&spec).await.unwrap();
        assert_eq!(cache.kind, ResourceKind::Cache);
        assert_eq!(cache.coords.unwrap().port, 6379);
        assert!(matches!(
            provider.create_cache(&spec).await,
            Err(ProviderError::AlreadyExists { .. })
        ));
        provider.remove_cache(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_create_is_unrecoverable() {
        let provider = provider();
        provider.reject_creates(true);
        let result = provider.create_storage("integreatly-foo").await;
        assert!(matches!(result, Err(ProviderError::Unrecoverable { .. })));
        assert!(provider.is_empty());
    }
}
