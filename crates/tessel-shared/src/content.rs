use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::Cid;

/// Immutable, content-addressed byte storage.
///
/// `put` is idempotent: storing the same bytes twice yields the same cid
/// and leaves a single copy.
pub trait ContentStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn put(&self, data: &[u8]) -> Result<Cid, Self::Error>;

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error>;

    fn has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        Ok(self.get(cid)?.is_some())
    }
}

/// In-process content store, used by tests and by nodes running without disk.
#[derive(Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    type Error = std::convert::Infallible;

    fn put(&self, data: &[u8]) -> Result<Cid, Self::Error> {
        let cid = Cid::of(data);
        if let Ok(mut objects) = self.objects.write() {
            objects.entry(cid.clone()).or_insert_with(|| data.to_vec());
        }
        Ok(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self
            .objects
            .read()
            .ok()
            .and_then(|objects| objects.get(cid).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_idempotent() {
        let store = MemoryContentStore::new();
        let a = store.put(b"object").unwrap();
        let b = store.put(b"object").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap().unwrap(), b"object");
    }

    #[test]
    fn test_missing_object() {
        let store = MemoryContentStore::new();
        assert!(!store.has(&Cid::of(b"nothing")).unwrap());
    }
}
