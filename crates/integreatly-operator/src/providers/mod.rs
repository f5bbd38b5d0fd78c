//! Cloud resource providers
//!
//! Idempotent create/remove primitives for cloud-managed object storage,
//! databases and caches. Every create distinguishes a fresh creation from
//! [`ProviderError::AlreadyExists`], every remove distinguishes a removal
//! from [`ProviderError::NotFound`], so retried provisioning and retried
//! teardown both converge.
//!
//! Providers are resolved by name through [`ProviderFactory`]:
//!
//! | Name        | Implementation        |
//! |-------------|-----------------------|
//! | `aws`       | [`AwsProvider`] (S3, RDS, ElastiCache) |
//! | `in-memory` | [`InMemoryProvider`]  |

mod aws;
mod error;
mod memory;

pub use aws::AwsProvider;
pub use error::{ProviderError, ProviderResult};
pub use memory::InMemoryProvider;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::info;

/// Provider name for Amazon Web Services
pub const PROVIDER_AWS: &str = "aws";

/// Provider name for the process-local provider
pub const PROVIDER_IN_MEMORY: &str = "in-memory";

/// Default region used when none is configured
pub const DEFAULT_REGION: &str = "eu-west-1";

/// Default ceiling for waiting on a database or cache to become available
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default interval between readiness polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Normalize a human-readable name into a provider identifier.
///
/// Runs of whitespace collapse into a single `-`.
pub fn normalize_name(name: &str) -> String {
    WHITESPACE.replace_all(name.trim(), "-").into_owned()
}

/// Kind of a provisioned cloud resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Storage,
    Database,
    Cache,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Storage => write!(f, "storage"),
            ResourceKind::Database => write!(f, "database"),
            ResourceKind::Cache => write!(f, "cache"),
        }
    }
}

/// Connection coordinates of a ready resource
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CloudCoords {
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for CloudCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCoords")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A resource created by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedResource {
    /// Normalized provider identifier
    pub id: String,
    pub kind: ResourceKind,
    /// Set once the resource is ready; object storage has none
    pub coords: Option<CloudCoords>,
}

/// Environment tier of a database or cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tier {
    #[default]
    Development,
    Production,
}

/// Database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseEngine {
    #[default]
    Postgres,
}

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEngine::Postgres => "postgres",
        }
    }
}

/// Cache engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheEngine {
    #[default]
    Redis,
}

impl CacheEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEngine::Redis => "redis",
        }
    }
}

/// Request for a managed database instance
#[derive(Debug, Clone)]
pub struct DatabaseSpec {
    pub tier: Tier,
    /// Instance name; normalized before use
    pub cluster_name: String,
    /// Logical database created inside the instance
    pub db_name: String,
    pub engine: DatabaseEngine,
    pub engine_version: String,
    /// Allocated storage in GiB
    pub storage_gb: i32,
    /// Backup retention in days
    pub retention_days: i32,
    pub master_username: String,
    pub master_password: String,
}

/// Request for a managed cache cluster
#[derive(Debug, Clone)]
pub struct CacheSpec {
    pub tier: Tier,
    /// Cluster name; normalized before use
    pub cluster_name: String,
    pub engine: CacheEngine,
    pub engine_version: String,
}

/// Idempotent cloud resource primitives.
///
/// Database and cache creation perform one bounded wait until the resource
/// is available. That wait happens once per resource lifecycle; callers
/// must not poll these methods on every reconcile tick.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider name as resolved by the factory
    fn name(&self) -> &str;

    /// Create an object storage bucket
    async fn create_storage(&self, name: &str) -> ProviderResult<ProvisionedResource>;

    /// Remove an object storage bucket together with its contents
    async fn remove_storage(&self, name: &str) -> ProviderResult<()>;

    /// List object storage bucket names
    async fn list_storage(&self) -> ProviderResult<Vec<String>>;

    /// Create a database instance and wait until it is available.
    ///
    /// An instance that already exists is waited on as well and returned
    /// inside [`ProviderError::AlreadyExists`].
    async fn create_database(&self, spec: &DatabaseSpec) -> ProviderResult<ProvisionedResource>;

    /// Remove a database instance
    async fn remove_database(&self, spec: &DatabaseSpec) -> ProviderResult<()>;

    /// Create a cache cluster and wait until it is available; an existing
    /// cluster is returned inside [`ProviderError::AlreadyExists`]
    async fn create_cache(&self, spec: &CacheSpec) -> ProviderResult<ProvisionedResource>;

    /// Remove a cache cluster
    async fn remove_cache(&self, spec: &CacheSpec) -> ProviderResult<()>;
}

/// Construction parameters for a provider instance
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider name (`aws`, `in-memory`)
    pub name: String,
    /// Fixed region for every resource this instance provisions
    pub region: String,
    /// Ceiling for the readiness wait of databases and caches
    pub ready_timeout: Duration,
    /// Interval between readiness polls
    pub poll_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: PROVIDER_AWS.to_string(),
            region: DEFAULT_REGION.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Resolves provider implementations by name
pub struct ProviderFactory;

impl ProviderFactory {
    /// Build the provider named in `config`
    pub async fn create(config: &ProviderConfig) -> ProviderResult<Arc<dyn CloudProvider>> {
        info!(provider = %config.name, region = %config.region, "Creating cloud provider");
        match config.name.as_str() {
            PROVIDER_AWS => Ok(Arc::new(AwsProvider::new(config.clone()).await?)),
            PROVIDER_IN_MEMORY => Ok(Arc::new(InMemoryProvider::new(config.clone()))),
            other => Err(ProviderError::Config(format!(
                "no such cloud provider {}",
                other
            ))),
        }
    }
}
