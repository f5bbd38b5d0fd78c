//! Cloud provider error taxonomy

use super::ProvisionedResource;
use crate::error::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`CloudProvider`](super::CloudProvider) implementations.
///
/// `AlreadyExists` and `NotFound` are signalled conditions rather than
/// failures; callers that only care about convergence match on them and
/// carry on. A database or cache that already exists is still waited on,
/// and the error then carries the live resource with its coordinates.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The resource being created already exists in the provider
    #[error("the requested resource {resource} already exists in the cloud provider")]
    AlreadyExists {
        resource: String,
        existing: Option<Box<ProvisionedResource>>,
    },

    /// The resource being removed does not exist
    #[error("the requested resource {resource} does not exist")]
    NotFound { resource: String },

    /// Network, throttling or service-side failure
    #[error("transient failure on {resource}: {message}")]
    Transient { resource: String, message: String },

    /// The provider rejected the request
    #[error("provider rejected request for {resource}: {message}")]
    Unrecoverable { resource: String, message: String },

    /// A bounded wait ran past its ceiling
    #[error("timed out after {after:?} waiting for {resource} to become {target}")]
    Timeout {
        resource: String,
        target: &'static str,
        after: Duration,
    },

    /// Provider could not be constructed
    #[error("cloud provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ProviderError::NotFound { .. } => ErrorKind::NotFound,
            ProviderError::Transient { .. } | ProviderError::Timeout { .. } => {
                ErrorKind::Transient
            }
            ProviderError::Unrecoverable { .. } | ProviderError::Config(_) => {
                ErrorKind::Unrecoverable
            }
        }
    }

    /// `AlreadyExists` without the live resource attached
    pub fn already_exists(resource: impl Into<String>) -> Self {
        ProviderError::AlreadyExists {
            resource: resource.into(),
            existing: None,
        }
    }

    /// Resolve an `AlreadyExists` that carries the live resource into that
    /// resource; every other error is returned unchanged
    pub fn into_existing(self) -> ProviderResult<ProvisionedResource> {
        match self {
            ProviderError::AlreadyExists {
                existing: Some(resource),
                ..
            } => Ok(*resource),
            other => Err(other),
        }
    }

    /// Identifier of the resource the error refers to, if any
    pub fn resource(&self) -> Option<&str> {
        match self {
            ProviderError::AlreadyExists { resource, .. }
            | ProviderError::NotFound { resource }
            | ProviderError::Transient { resource, .. }
            | ProviderError::Unrecoverable { resource, .. }
            | ProviderError::Timeout { resource, .. } => Some(resource),
            ProviderError::Config(_) => None,
        }
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
