use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bucketcache_protocol::ObjectPath;
use tokio::io::AsyncReadExt;

use crate::{ObjectReader, ObjectStore, StoreFuture};

/// In-process object store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<ObjectPath, Arc<Vec<u8>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<ObjectPath, Arc<Vec<u8>>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an object directly.
    pub fn insert(&self, path: ObjectPath, data: impl Into<Vec<u8>>) {
        self.objects().insert(path, Arc::new(data.into()));
    }

    /// Returns a copy of the object's bytes.
    pub fn bytes(&self, path: &ObjectPath) -> Option<Vec<u8>> {
        self.objects().get(path).map(|d| d.as_ref().clone())
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn put<'a>(&'a self, path: &'a ObjectPath, mut body: ObjectReader) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut data = Vec::new();
            body.read_to_end(&mut data).await?;
            self.objects().insert(path.clone(), Arc::new(data));
            Ok(())
        })
    }

    fn get<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectReader>> {
        Box::pin(async move {
            let data = self.objects().get(path).cloned();
            Ok(data.map(|d| Box::pin(Cursor::new(d.as_ref().clone())) as ObjectReader))
        })
    }

    fn head<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<u64>> {
        Box::pin(async move { Ok(self.objects().get(path).map(|d| d.len() as u64)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_objects() {
        let store = MemoryStore::new();
        let other = store.clone();
        let path = ObjectPath::new("b", "k");

        store.put(&path, Box::pin(&b"hello"[..])).await.unwrap();
        assert_eq!(other.head(&path).await.unwrap(), Some(5));
        assert_eq!(other.bytes(&path).as_deref(), Some(&b"hello"[..]));
        assert!(other.get(&ObjectPath::new("b", "nope")).await.unwrap().is_none());
    }
}
