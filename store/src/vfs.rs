//! Object-store backend: every resource is one JSON blob in an
//! S3-compatible bucket.

use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use async_trait::async_trait;
use serde_json::Value;

use keel_common::args::VfsArgs;
use keel_types::{CertBundle, SshKey};

use crate::{Backend, Kind, Scope, StoreError, paths};

pub struct VfsBackend {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl VfsBackend {
    pub async fn connect(args: &VfsArgs) -> anyhow::Result<VfsBackend> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(args.vfs_region.clone()));
        if let Some(ref endpoint) = args.vfs_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Ok(VfsBackend {
            client: S3Client::new(&config),
            bucket: args.vfs_bucket.clone(),
            prefix: args.vfs_prefix.clone(),
        })
    }

    /// Reads a key, mapping NoSuchKey to `None`.
    async fn read_key(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match res {
            Ok(out) => {
                let data = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(data.into_bytes().to_vec()))
            }
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    Ok(None)
                } else {
                    Err(StoreError::Backend(e.to_string()))
                }
            }
        }
    }

    async fn write_key(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn read_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.read_key(key).await? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|e| StoreError::Backend(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Backend for VfsBackend {
    async fn get(&self, kind: Kind, scope: &Scope, name: &str) -> Result<Value, StoreError> {
        let key = paths::resource_key(&self.prefix, kind, scope, name);
        match self.read_key(&key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::not_found(kind.as_str(), name)),
        }
    }

    async fn list(&self, kind: Kind, scope: &Scope) -> Result<Vec<Value>, StoreError> {
        let home = format!("{}/", paths::resource_home(&self.prefix, kind, scope));
        let mut out = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&home)
                .delimiter("/");
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if let Some(contents) = response.contents {
                for object in contents {
                    let Some(key) = object.key else { continue };
                    if !key.ends_with(".json") {
                        continue;
                    }
                    if let Some(bytes) = self.read_key(&key).await? {
                        out.push(serde_json::from_slice(&bytes)?);
                    }
                }
            }
            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }
        Ok(out)
    }

    async fn create(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        value: Value,
    ) -> Result<Value, StoreError> {
        let key = paths::resource_key(&self.prefix, kind, scope, name);
        if self.read_key(&key).await?.is_some() {
            return Err(StoreError::already_exists(kind.as_str(), name));
        }
        self.write_key(&key, serde_json::to_vec(&value)?).await?;
        Ok(value)
    }

    async fn update(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        value: Value,
    ) -> Result<Value, StoreError> {
        let key = paths::resource_key(&self.prefix, kind, scope, name);
        if self.read_key(&key).await?.is_none() {
            return Err(StoreError::not_found(kind.as_str(), name));
        }
        self.write_key(&key, serde_json::to_vec(&value)?).await?;
        Ok(value)
    }

    async fn delete(&self, kind: Kind, scope: &Scope, name: &str) -> Result<(), StoreError> {
        let key = paths::resource_key(&self.prefix, kind, scope, name);
        if self.read_key(&key).await?.is_none() {
            return Err(StoreError::not_found(kind.as_str(), name));
        }
        self.delete_key(&key).await
    }

    async fn get_cert(&self, scope: &Scope, name: &str) -> Result<CertBundle, StoreError> {
        let (cert_key, key_key) = paths::cert_keys(&self.prefix, scope, name);
        let cert_pem = self
            .read_string(&cert_key)
            .await?
            .ok_or_else(|| StoreError::not_found("certificate", name))?;
        let key_pem = self
            .read_string(&key_key)
            .await?
            .ok_or_else(|| StoreError::not_found("certificate", name))?;
        Ok(CertBundle { cert_pem, key_pem })
    }

    async fn create_cert(
        &self,
        scope: &Scope,
        name: &str,
        bundle: &CertBundle,
    ) -> Result<(), StoreError> {
        let (cert_key, key_key) = paths::cert_keys(&self.prefix, scope, name);
        if self.read_key(&cert_key).await?.is_some() {
            return Err(StoreError::already_exists("certificate", name));
        }
        self.write_key(&cert_key, bundle.cert_pem.clone().into_bytes())
            .await?;
        self.write_key(&key_key, bundle.key_pem.clone().into_bytes())
            .await
    }

    async fn get_ssh_key(&self, scope: &Scope) -> Result<SshKey, StoreError> {
        let (private_key, public_key) = paths::ssh_keys(&self.prefix, scope);
        let private_key_pem = self
            .read_string(&private_key)
            .await?
            .ok_or_else(|| StoreError::not_found("ssh key", scope.cluster()))?;
        let public_key_openssh = self
            .read_string(&public_key)
            .await?
            .ok_or_else(|| StoreError::not_found("ssh key", scope.cluster()))?;
        // The fingerprint is derived from the public key by the caller.
        Ok(SshKey {
            private_key_pem,
            public_key_openssh,
            fingerprint: String::new(),
        })
    }

    async fn create_ssh_key(&self, scope: &Scope, key: &SshKey) -> Result<(), StoreError> {
        let (private_key, public_key) = paths::ssh_keys(&self.prefix, scope);
        if self.read_key(&private_key).await?.is_some() {
            return Err(StoreError::already_exists("ssh key", scope.cluster()));
        }
        self.write_key(&private_key, key.private_key_pem.clone().into_bytes())
            .await?;
        self.write_key(&public_key, key.public_key_openssh.clone().into_bytes())
            .await
    }
}
