use std::time::Duration;

use keel_store::StoreError;
use keel_types::ClusterPhase;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("{resource} `{name}` not found")]
    NotFound { resource: &'static str, name: String },

    #[error("{resource} `{name}` already exists")]
    AlreadyExists { resource: &'static str, name: String },

    #[error("invalid credential `{name}`: {reason}")]
    InvalidCredential { name: String, reason: String },

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("cluster `{cluster}` is in {conflict} phase: {reason}")]
    PhaseConflict {
        cluster: String,
        conflict: ClusterPhase,
        reason: String,
    },

    /// A provider API rejected a call for a reason other than 404/409.
    #[error("cloud api error: {status} {message}")]
    Api { status: u16, message: String },

    #[error("http error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: StoreError,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Failures against the provisioned control plane.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    #[error("kubernetes error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("pki error: {0}")]
    Pki(String),
}

impl CloudError {
    pub fn not_found(resource: &'static str, name: impl Into<String>) -> Self {
        CloudError::NotFound {
            resource,
            name: name.into(),
        }
    }

    pub fn already_exists(resource: &'static str, name: impl Into<String>) -> Self {
        CloudError::AlreadyExists {
            resource,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            CloudError::NotFound { .. } => true,
            CloudError::Storage { source } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            CloudError::AlreadyExists { .. } => true,
            CloudError::Storage { source } => source.is_already_exists(),
            _ => false,
        }
    }
}

impl From<keel_common::wait::PollError<CloudError>> for CloudError {
    fn from(e: keel_common::wait::PollError<CloudError>) -> Self {
        match e {
            keel_common::wait::PollError::Timeout(d) => CloudError::Timeout(d),
            keel_common::wait::PollError::Probe(inner) => inner,
        }
    }
}

/// Collapses idempotent outcomes: a delete hitting `NotFound` and a
/// create hitting `AlreadyExists` both count as success.
pub fn ignore_not_found<T>(res: Result<T, CloudError>) -> Result<Option<T>, CloudError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn ignore_already_exists<T>(res: Result<T, CloudError>) -> Result<Option<T>, CloudError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_already_exists() => Ok(None),
        Err(e) => Err(e),
    }
}
