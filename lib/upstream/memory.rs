//! In-memory blob store, for local runs without a remote cache

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::upstream::{BlobStore, Error};

#[derive(Clone, Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.blobs.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.blobs.write().insert(key.to_owned(), value);
        Ok(())
    }
}
