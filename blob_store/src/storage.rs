//! `object_store` backed blob storage.

use std::{env, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey, S3ConditionalPut},
    parse_url,
    path::Path,
    ObjectMeta,
    ObjectStore,
    ObjectStoreScheme,
    PutMode,
    PutOptions,
    PutPayload,
};
use opentelemetry::KeyValue;
use tracing::{debug, info};
use url::Url;

use crate::{BlobError, BlobResult, BlobStorageConfig, BlobStore};

/// Blob storage over any `object_store` backend, rooted at a base path.
#[derive(Clone)]
pub struct ObjectBlobStore {
    object_store: Arc<dyn ObjectStore>,
    base: Path,
    metrics: Arc<metrics::blob_store::Metrics>,
}

impl ObjectBlobStore {
    pub fn new(config: BlobStorageConfig) -> BlobResult<Self> {
        let (object_store, base) = Self::build_object_store(&config)?;
        info!("using blob store path: {}", config.path);
        Ok(Self {
            object_store: Arc::from(object_store),
            base,
            metrics: Arc::new(metrics::blob_store::Metrics::new()),
        })
    }

    pub fn build_object_store(
        config: &BlobStorageConfig,
    ) -> BlobResult<(Box<dyn ObjectStore>, Path)> {
        let url = config
            .path
            .parse::<Url>()
            .map_err(|e| BlobError::InvalidUrl {
                url: config.path.clone(),
                reason: e.to_string(),
            })?;
        let (scheme, path) = ObjectStoreScheme::parse(&url).map_err(|e| BlobError::InvalidUrl {
            url: config.path.clone(),
            reason: e.to_string(),
        })?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                            if key.starts_with("AWS_") {
                                if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                                    return Some((config_key, String::from(value)));
                                }
                            }
                        }
                        None
                    })
                    .collect();

                let mut s3_builder = AmazonS3Builder::new().with_url(config.path.as_str());
                for (key, value) in opts.iter() {
                    s3_builder = s3_builder.with_config(*key, value.clone());
                }
                if let Some(region) = &config.region {
                    s3_builder = s3_builder.with_region(region);
                }
                // For supporting localstack/minio for testing
                if let Ok(endpoint) = env::var("AWS_ENDPOINT_URL") {
                    if endpoint.starts_with("http://") {
                        s3_builder = s3_builder.with_allow_http(true);
                    }
                    s3_builder = s3_builder.with_endpoint(endpoint);
                }
                let store = s3_builder
                    .with_conditional_put(S3ConditionalPut::ETagMatch)
                    .build()
                    .map_err(|e| BlobError::InvalidUrl {
                        url: config.path.clone(),
                        reason: e.to_string(),
                    })?;
                Ok((Box::new(store), path))
            }
            _ => parse_url(&url).map_err(|e| BlobError::InvalidUrl {
                url: config.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn full_path(&self, key: &str) -> Path {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.base.clone(), |path, part| path.child(part))
    }

    fn relative_key(&self, meta: &ObjectMeta) -> Option<String> {
        let parts = meta.location.prefix_match(&self.base)?;
        let key = parts
            .map(|part| part.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Some(key)
    }

    fn track<T>(&self, op: &'static str, result: BlobResult<T>) -> BlobResult<T> {
        if result.is_err() {
            self.metrics.errors.add(1, &[KeyValue::new("op", op)]);
        }
        result
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        let _timer = metrics::Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "get")],
        );
        let path = self.full_path(key);
        let result = async {
            let get_result = self
                .object_store
                .get(&path)
                .await
                .map_err(|e| BlobError::from_store(key, e))?;
            get_result
                .bytes()
                .await
                .map_err(|e| BlobError::from_store(key, e))
        }
        .await;
        // a missing blob is an expected outcome, not an error
        if matches!(result, Err(BlobError::NotFound { .. })) {
            return result;
        }
        self.track("get", result)
    }

    async fn put(&self, key: &str, data: Bytes) -> BlobResult<()> {
        let _timer = metrics::Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "put")],
        );
        debug!(key, size_bytes = data.len(), "put blob");
        let result = self
            .object_store
            .put(&self.full_path(key), PutPayload::from(data))
            .await
            .map(|_| ())
            .map_err(|e| BlobError::from_store(key, e));
        self.track("put", result)
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> BlobResult<()> {
        let _timer = metrics::Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "put_if_absent")],
        );
        let result = self
            .object_store
            .put_opts(
                &self.full_path(key),
                PutPayload::from(data),
                PutOptions::from(PutMode::Create),
            )
            .await
            .map(|_| ())
            .map_err(|e| BlobError::from_store(key, e));
        if matches!(result, Err(BlobError::AlreadyExists { .. })) {
            return result;
        }
        self.track("put_if_absent", result)
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let _timer = metrics::Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "delete")],
        );
        match self.object_store.delete(&self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => self.track("delete", Err(BlobError::from_store(key, e))),
        }
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        let _timer = metrics::Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "head")],
        );
        match self.object_store.head(&self.full_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => self.track("head", Err(BlobError::from_store(key, e))),
        }
    }

    async fn list(&self, prefix: &str) -> BlobResult<Vec<String>> {
        let _timer = metrics::Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "list")],
        );
        let prefix_path = self.full_path(prefix);
        let result = self
            .object_store
            .list(Some(&prefix_path))
            .try_collect::<Vec<ObjectMeta>>()
            .await
            .map_err(|e| BlobError::from_store(prefix, e));
        let metas = self.track("list", result)?;
        let mut keys: Vec<String> = metas
            .iter()
            .filter_map(|meta| self.relative_key(meta))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn memory_store() -> ObjectBlobStore {
        ObjectBlobStore::new(BlobStorageConfig::in_memory()).unwrap()
    }

    #[tokio::test]
    async fn test_put_get() {
        let store = memory_store();
        store
            .put("state/app/dev.json", Bytes::from("hello world"))
            .await
            .unwrap();
        let data = store.get("state/app/dev.json").await.unwrap();
        assert_eq!(data, Bytes::from("hello world"));
        assert!(store.exists("state/app/dev.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = memory_store();
        let err = store.get("state/app/missing.json").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists("state/app/missing.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_if_absent_conflict() {
        let store = memory_store();
        store
            .put_if_absent("lock/app/dev.json", Bytes::from("first"))
            .await
            .unwrap();
        let err = store
            .put_if_absent("lock/app/dev.json", Bytes::from("second"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists { .. }));
        let data = store.get("lock/app/dev.json").await.unwrap();
        assert_eq!(data, Bytes::from("first"));
    }

    #[tokio::test]
    async fn test_delete_missing_succeeds() {
        let store = memory_store();
        store.delete("lock/app/dev.json").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = memory_store();
        for key in [
            "snapshot/app/dev/a.json",
            "snapshot/app/dev/b.json",
            "snapshot/app/prod/c.json",
            "state/app/dev.json",
        ] {
            store.put(key, Bytes::from("{}")).await.unwrap();
        }
        let keys = store.list("snapshot/app/dev").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "snapshot/app/dev/a.json".to_string(),
                "snapshot/app/dev/b.json".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_local_filesystem_store() {
        let temp_dir = TempDir::new().unwrap();
        let config = BlobStorageConfig::new(temp_dir.path().to_str().unwrap());
        let store = ObjectBlobStore::new(config).unwrap();

        store
            .put("update/app/dev/u1.json", Bytes::from("{}"))
            .await
            .unwrap();
        assert!(temp_dir.path().join("update/app/dev/u1.json").exists());
        let err = store
            .put_if_absent("update/app/dev/u1.json", Bytes::from("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists { .. }));

        store.delete("update/app/dev/u1.json").await.unwrap();
        store.delete("update/app/dev/u1.json").await.unwrap();
        assert!(!store.exists("update/app/dev/u1.json").await.unwrap());
    }

    #[test]
    fn test_invalid_url() {
        let config = BlobStorageConfig {
            path: "not a url".to_string(),
            region: None,
        };
        assert!(matches!(
            ObjectBlobStore::new(config),
            Err(BlobError::InvalidUrl { .. })
        ));
    }
}
