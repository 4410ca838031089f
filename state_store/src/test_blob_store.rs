//! In-memory blob store that counts writes and can be told to fail them.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use async_trait::async_trait;
use blob_store::{BlobError, BlobResult, BlobStorageConfig, BlobStore, ObjectBlobStore};
use bytes::Bytes;

pub struct TestBlobStore {
    inner: ObjectBlobStore,
    puts: Mutex<HashMap<String, usize>>,
    failing_puts: AtomicUsize,
    hidden_gets: AtomicUsize,
}

impl TestBlobStore {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        let inner = ObjectBlobStore::new(BlobStorageConfig::in_memory())
            .expect("in-memory blob store is always available");
        Arc::new(Self {
            inner,
            puts: Mutex::new(HashMap::new()),
            failing_puts: AtomicUsize::new(0),
            hidden_gets: AtomicUsize::new(0),
        })
    }

    /// Number of successful unconditional puts to `key`.
    pub fn put_count(&self, key: &str) -> usize {
        self.puts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_puts(&self) -> usize {
        self.puts.lock().unwrap().values().sum()
    }

    /// Makes the next `count` unconditional puts fail.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` gets report the key as missing, as if another
    /// writer deleted it in between.
    pub fn hide_next_gets(&self, count: usize) {
        self.hidden_gets.store(count, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BlobStore for TestBlobStore {
    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        if take_one(&self.hidden_gets) {
            return Err(BlobError::NotFound {
                key: key.to_string(),
            });
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> BlobResult<()> {
        if take_one(&self.failing_puts) {
            return Err(BlobError::Other(anyhow_error(key)));
        }
        self.inner.put(key, data).await?;
        *self.puts.lock().unwrap().entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> BlobResult<()> {
        self.inner.put_if_absent(key, data).await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> BlobResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

fn anyhow_error(key: &str) -> anyhow::Error {
    anyhow::anyhow!("injected put failure for {}", key)
}
