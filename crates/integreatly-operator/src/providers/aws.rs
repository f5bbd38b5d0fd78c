//! AWS cloud provider
//!
//! Object storage on S3, databases on RDS and caches on ElastiCache, all in
//! the single region given by [`ProviderConfig::region`].

use super::{
    normalize_name, CacheSpec, CloudCoords, CloudProvider, DatabaseSpec, ProviderConfig,
    ProviderError, ProviderResult, ProvisionedResource, ResourceKind, Tier, PROVIDER_AWS,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use std::future::Future;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const DB_INSTANCE_CLASS: &str = "db.t3.medium";
const CACHE_NODE_TYPE: &str = "cache.t3.micro";
const CACHE_PORT: i32 = 6379;
const CACHE_SNAPSHOT_RETENTION_DAYS: i32 = 2;

/// S3 refuses an explicit location constraint for its home region
const S3_HOME_REGION: &str = "us-east-1";

const BUCKET_EXISTS_CODES: &[&str] = &["BucketAlreadyExists", "BucketAlreadyOwnedByYou"];
const BUCKET_MISSING_CODES: &[&str] = &["NoSuchBucket"];
const DB_EXISTS_CODES: &[&str] = &["DBInstanceAlreadyExists"];
const DB_MISSING_CODES: &[&str] = &["DBInstanceNotFound"];
const CACHE_EXISTS_CODES: &[&str] = &["CacheClusterAlreadyExists"];
const CACHE_MISSING_CODES: &[&str] = &["CacheClusterNotFound"];

/// Service error codes that mean "slow down", not "no"
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "SlowDown",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

/// What a known error code signals
#[derive(Clone, Copy)]
enum Sentinel {
    AlreadyExists,
    NotFound,
}

/// Map an SDK error onto [`ProviderError`] using the service error code.
fn classify<E, R>(
    err: SdkError<E, R>,
    resource: String,
    codes: &[&str],
    sentinel: Sentinel,
) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_owned);
    let is_service_error = err.as_service_error().is_some();
    let message = DisplayErrorContext(&err).to_string();

    match code.as_deref() {
        Some(c) if codes.contains(&c) => match sentinel {
            Sentinel::AlreadyExists => ProviderError::already_exists(resource),
            Sentinel::NotFound => ProviderError::NotFound { resource },
        },
        Some(c) if THROTTLING_CODES.contains(&c) => ProviderError::Transient { resource, message },
        _ if is_service_error => ProviderError::Unrecoverable { resource, message },
        // timeouts, dispatch and response failures never reached a decision
        _ => ProviderError::Transient { resource, message },
    }
}

/// Delete request for one listed page of object keys, `None` once the
/// bucket is empty
fn delete_batch(bucket: &str, keys: Vec<String>) -> ProviderResult<Option<Delete>> {
    if keys.is_empty() {
        return Ok(None);
    }
    let invalid = |e: aws_sdk_s3::error::BuildError| ProviderError::Unrecoverable {
        resource: format!("s3 bucket {}", bucket),
        message: e.to_string(),
    };
    let objects = keys
        .into_iter()
        .map(|key| ObjectIdentifier::builder().key(key).build().map_err(invalid))
        .collect::<ProviderResult<Vec<_>>>()?;
    Delete::builder()
        .set_objects(Some(objects))
        .quiet(true)
        .build()
        .map(Some)
        .map_err(invalid)
}

/// Whether a create call made a new resource or found an existing one
fn created_or_existing(err: ProviderError) -> ProviderResult<bool> {
    match err {
        ProviderError::AlreadyExists { .. } => Ok(false),
        other => Err(other),
    }
}

/// Return a fresh resource as-is and an existing one inside `AlreadyExists`
fn provisioned(
    created: bool,
    resource: String,
    live: ProvisionedResource,
) -> ProviderResult<ProvisionedResource> {
    if created {
        Ok(live)
    } else {
        Err(ProviderError::AlreadyExists {
            resource,
            existing: Some(Box::new(live)),
        })
    }
}

/// [`CloudProvider`] backed by AWS
pub struct AwsProvider {
    config: ProviderConfig,
    s3: aws_sdk_s3::Client,
    rds: aws_sdk_rds::Client,
    elasticache: aws_sdk_elasticache::Client,
}

impl AwsProvider {
    /// Load credentials from the default chain and pin every client to the
    /// configured region.
    pub async fn new(config: ProviderConfig) -> ProviderResult<Self> {
        if config.region.trim().is_empty() {
            return Err(ProviderError::Config(
                "aws provider requires a region".to_string(),
            ));
        }

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        Ok(Self {
            s3: aws_sdk_s3::Client::new(&shared),
            rds: aws_sdk_rds::Client::new(&shared),
            elasticache: aws_sdk_elasticache::Client::new(&shared),
            config,
        })
    }

    /// Poll `probe` until it yields a value, bounded by the ready timeout.
    async fn wait_until<T, F, Fut>(
        &self,
        resource: &str,
        target: &'static str,
        mut probe: F,
    ) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<Option<T>>>,
    {
        let poll_interval = self.config.poll_interval;
        let waited = timeout(self.config.ready_timeout, async {
            loop {
                if let Some(value) = probe().await? {
                    return Ok::<T, ProviderError>(value);
                }
                debug!(resource = %resource, target = target, "Waiting for resource");
                sleep(poll_interval).await;
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                resource: resource.to_string(),
                target,
                after: self.config.ready_timeout,
            }),
        }
    }

    /// Delete every object in a bucket; S3 refuses to remove a non-empty one
    async fn empty_bucket(&self, id: &str, resource: &str) -> ProviderResult<()> {
        loop {
            let page = self
                .s3
                .list_objects_v2()
                .bucket(id)
                .send()
                .await
                .map_err(|e| {
                    classify(e, resource.to_string(), BUCKET_MISSING_CODES, Sentinel::NotFound)
                })?;
            let keys = page
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_owned))
                .collect::<Vec<_>>();

            let Some(batch) = delete_batch(id, keys)? else {
                return Ok(());
            };
            debug!(bucket = %id, objects = batch.objects().len(), "Deleting bucket objects");
            self.s3
                .delete_objects()
                .bucket(id)
                .delete(batch)
                .send()
                .await
                .map_err(|e| {
                    classify(e, resource.to_string(), BUCKET_MISSING_CODES, Sentinel::NotFound)
                })?;
        }
    }

    /// Coordinates of an available database instance, `None` while it is
    /// still being created.
    async fn describe_database(&self, id: &str, spec: &DatabaseSpec) -> ProviderResult<Option<CloudCoords>> {
        let resource = format!("rds instance {}", id);
        let output = match self
            .rds
            .describe_db_instances()
            .db_instance_identifier(id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                return match classify(err, resource, DB_MISSING_CODES, Sentinel::NotFound) {
                    // describe can lag behind create
                    ProviderError::NotFound { .. } => Ok(None),
                    other => Err(other),
                };
            }
        };

        let Some(instance) = output.db_instances().first() else {
            return Ok(None);
        };
        if instance.db_instance_status() != Some("available") {
            return Ok(None);
        }

        let endpoint = instance.endpoint();
        Ok(Some(CloudCoords {
            host: endpoint
                .and_then(|e| e.address())
                .unwrap_or_default()
                .to_string(),
            port: endpoint.and_then(|e| e.port()).unwrap_or_default(),
            username: spec.master_username.clone(),
            password: spec.master_password.clone(),
        }))
    }

    /// Whether a database instance is gone
    async fn database_absent(&self, id: &str) -> ProviderResult<Option<()>> {
        let resource = format!("rds instance {}", id);
        match self
            .rds
            .describe_db_instances()
            .db_instance_identifier(id)
            .send()
            .await
        {
            Ok(output) if output.db_instances().is_empty() => Ok(Some(())),
            Ok(_) => Ok(None),
            Err(err) => match classify(err, resource, DB_MISSING_CODES, Sentinel::NotFound) {
                ProviderError::NotFound { .. } => Ok(Some(())),
                other => Err(other),
            },
        }
    }

    /// Coordinates of an available cache cluster, `None` while pending
    async fn describe_cache(&self, id: &str) -> ProviderResult<Option<CloudCoords>> {
        let resource = format!("elasticache cluster {}", id);
        let output = match self
            .elasticache
            .describe_cache_clusters()
            .cache_cluster_id(id)
            .show_cache_node_info(true)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                return match classify(err, resource, CACHE_MISSING_CODES, Sentinel::NotFound) {
                    ProviderError::NotFound { .. } => Ok(None),
                    other => Err(other),
                };
            }
        };

        let Some(cluster) = output.cache_clusters().first() else {
            return Ok(None);
        };
        if cluster.cache_cluster_status() != Some("available") {
            return Ok(None);
        }

        let endpoint = cluster.cache_nodes().first().and_then(|n| n.endpoint());
        Ok(Some(CloudCoords {
            host: endpoint
                .and_then(|e| e.address())
                .unwrap_or_default()
                .to_string(),
            port: endpoint.and_then(|e| e.port()).unwrap_or(CACHE_PORT),
            username: String::new(),
            password: String::new(),
        }))
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn name(&self) -> &str {
        PROVIDER_AWS
    }

    async fn create_storage(&self, name: &str) -> ProviderResult<ProvisionedResource> {
        let id = normalize_name(name);
        let resource = format!("s3 bucket {}", id);
        info!(bucket = %id, region = %self.config.region, "Creating S3 bucket");

        let mut request = self.s3.create_bucket().bucket(&id);
        if self.config.region != S3_HOME_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(
                        self.config.region.as_str(),
                    ))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| classify(e, resource, BUCKET_EXISTS_CODES, Sentinel::AlreadyExists))?;

        Ok(ProvisionedResource {
            id,
            kind: ResourceKind::Storage,
            coords: None,
        })
    }

    async fn remove_storage(&self, name: &str) -> ProviderResult<()> {
        let id = normalize_name(name);
        let resource = format!("s3 bucket {} in region {}", id, self.config.region);
        info!(bucket = %id, "Removing S3 bucket");

        self.empty_bucket(&id, &resource).await?;
        self.s3
            .delete_bucket()
            .bucket(&id)
            .send()
            .await
            .map_err(|e| classify(e, resource, BUCKET_MISSING_CODES, Sentinel::NotFound))?;
        Ok(())
    }

    async fn list_storage(&self) -> ProviderResult<Vec<String>> {
        let output = self.s3.list_buckets().send().await.map_err(|e| {
            classify(e, "s3 buckets".to_string(), &[], Sentinel::NotFound)
        })?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_owned))
            .collect())
    }

    async fn create_database(&self, spec: &DatabaseSpec) -> ProviderResult<ProvisionedResource> {
        let id = normalize_name(&spec.cluster_name);
        let resource = format!("rds instance {}", id);
        info!(instance = %id, engine = spec.engine.as_str(), "Creating RDS instance");

        let created = match self
            .rds
            .create_db_instance()
            .db_instance_identifier(&id)
            .db_instance_class(DB_INSTANCE_CLASS)
            .db_name(&spec.db_name)
            .engine(spec.engine.as_str())
            .engine_version(&spec.engine_version)
            .allocated_storage(spec.storage_gb)
            .backup_retention_period(spec.retention_days)
            .auto_minor_version_upgrade(true)
            .publicly_accessible(false)
            .multi_az(spec.tier == Tier::Production)
            .master_username(&spec.master_username)
            .master_user_password(&spec.master_password)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => created_or_existing(classify(
                e,
                resource.clone(),
                DB_EXISTS_CODES,
                Sentinel::AlreadyExists,
            ))?,
        };

        // an existing instance may still be coming up from an earlier attempt
        let coords = self
            .wait_until(&resource, "available", || self.describe_database(&id, spec))
            .await?;

        info!(instance = %id, host = %coords.host, created, "RDS instance available");
        provisioned(
            created,
            resource,
            ProvisionedResource {
                id,
                kind: ResourceKind::Database,
                coords: Some(coords),
            },
        )
    }

    async fn remove_database(&self, spec: &DatabaseSpec) -> ProviderResult<()> {
        let id = normalize_name(&spec.cluster_name);
        let resource = format!("rds instance {}", id);
        info!(instance = %id, "Removing RDS instance");

        self.rds
            .delete_db_instance()
            .db_instance_identifier(&id)
            .skip_final_snapshot(true)
            .delete_automated_backups(true)
            .send()
            .await
            .map_err(|e| classify(e, resource.clone(), DB_MISSING_CODES, Sentinel::NotFound))?;

        self.wait_until(&resource, "deleted", || self.database_absent(&id))
            .await
    }

    async fn create_cache(&self, spec: &CacheSpec) -> ProviderResult<ProvisionedResource> {
        let id = normalize_name(&spec.cluster_name);
        let resource = format!("elasticache cluster {}", id);
        info!(cluster = %id, engine = spec.engine.as_str(), "Creating ElastiCache cluster");

        if spec.tier == Tier::Production {
            warn!(cluster = %id, "Production cache requested; provisioning a single node");
        }

        let created = match self
            .elasticache
            .create_cache_cluster()
            .cache_cluster_id(&id)
            .engine(spec.engine.as_str())
            .engine_version(&spec.engine_version)
            .cache_node_type(CACHE_NODE_TYPE)
            .num_cache_nodes(1)
            .port(CACHE_PORT)
            .auto_minor_version_upgrade(true)
            .snapshot_retention_limit(CACHE_SNAPSHOT_RETENTION_DAYS)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => created_or_existing(classify(
                e,
                resource.clone(),
                CACHE_EXISTS_CODES,
                Sentinel::AlreadyExists,
            ))?,
        };

        let coords = self
            .wait_until(&resource, "available", || self.describe_cache(&id))
            .await?;

        provisioned(
            created,
            resource,
            ProvisionedResource {
                id,
                kind: ResourceKind::Cache,
                coords: Some(coords),
            },
        )
    }

    async fn remove_cache(&self, spec: &CacheSpec) -> ProviderResult<()> {
        let id = normalize_name(&spec.cluster_name);
        let resource = format!("elasticache cluster {}", id);
        info!(cluster = %id, "Removing ElastiCache cluster");

        self.elasticache
            .delete_cache_cluster()
            .cache_cluster_id(&id)
            .send()
            .await
            .map_err(|e| classify(e, resource, CACHE_MISSING_CODES, Sentinel::NotFound))?;
        Ok(())
    }
}
