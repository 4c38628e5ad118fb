//! Object transport for URL and S3 loads and exports.
//!
//! The engine does not speak HTTP or S3 itself. Deployments plug in an
//! [`ObjectTransport`]; [`MemoryTransport`] serves tests and local setups.

use std::{collections::HashMap, fmt, sync::Mutex};

use serde::Deserialize;
use thiserror::Error;

/// S3 object coordinates and credentials as given in `import_from_s3` and
/// `export_to_s3`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct S3Location {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub bucket: String,
    pub key: String,
    pub region: String,
}

impl fmt::Debug for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Location")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("region", &self.region)
            .finish()
    }
}

/// Where an object lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLocation {
    Url(String),
    S3(S3Location),
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectLocation::Url(url) => f.write_str(url),
            ObjectLocation::S3(s3) => write!(f, "s3://{}/{}", s3.bucket, s3.key),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Object {0} not found")]
    NotFound(String),

    #[error("No object transport is configured for {0}")]
    NotConfigured(String),

    #[error("Transfer of {location} failed: {reason}")]
    Failed { location: String, reason: String },
}

/// Fetches and stores whole objects. Called from the blocking pool.
pub trait ObjectTransport: Send + Sync {
    fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, TransportError>;

    fn put(&self, location: &ObjectLocation, body: Vec<u8>) -> Result<(), TransportError>;
}

/// Transport over an in-process map keyed by the location's display form.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `body` under `location`, e.g. `https://example.com/dogs.csv`
    /// or `s3://bucket/key`.
    pub fn insert(&self, location: impl Into<String>, body: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(location.into(), body.into());
        }
    }

    pub fn object(&self, location: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(location).cloned()
    }
}

impl ObjectTransport for MemoryTransport {
    fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, TransportError> {
        let name = location.to_string();
        self.object(&name).ok_or(TransportError::NotFound(name))
    }

    fn put(&self, location: &ObjectLocation, body: Vec<u8>) -> Result<(), TransportError> {
        let name = location.to_string();
        let mut objects = self.objects.lock().map_err(|_| TransportError::Failed {
            location: name.clone(),
            reason: "transport lock poisoned".into(),
        })?;
        objects.insert(name, body);
        Ok(())
    }
}
