use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

/// Primitive operations the shared store is built on: a string keyspace plus
/// scored sets for the queue indexes.
///
/// `transition` is the one compound operation. A status change must replace
/// the item and fix up its index memberships as a single logical write, so
/// backends apply all parts in one shot (one lock, or one pipelined request).
pub trait StateBackend: Send + Sync {
    fn name(&self) -> &str;

    fn ping<'a>(&'a self)
    -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, StoreError>> + Send + 'a>>;

    fn get_many<'a>(
        &'a self,
        keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Option<String>>, StoreError>> + Send + 'a>>;

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn zadd<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: f64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn zscore<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<f64>, StoreError>> + Send + 'a>>;

    /// Members of a scored set, highest score first.
    fn zrange_desc<'a>(
        &'a self,
        key: &'a str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>>;

    /// Every key starting with `prefix`, sorted.
    fn scan<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>>;

    /// Write `value` under `key`, drop the given set members and add the new
    /// ones, as one logical operation.
    fn transition<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        removals: &'a [(String, String)],
        additions: &'a [(String, String, f64)],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

/// In-process backend. Cloning shares the underlying maps, which is exactly
/// what multi-client tests need.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    kv: HashMap<String, String>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StateBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn ping<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, StoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.lock().kv.get(key).cloned()) })
    }

    fn get_many<'a>(
        &'a self,
        keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Option<String>>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.lock();
            Ok(keys.iter().map(|key| inner.kv.get(key).cloned()).collect())
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.lock().kv.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn zadd<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: f64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.lock()
                .zsets
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string(), score);
            Ok(())
        })
    }

    fn zscore<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<f64>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .zsets
                .get(key)
                .and_then(|set| set.get(member).copied()))
        })
    }

    fn zrange_desc<'a>(
        &'a self,
        key: &'a str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut members: Vec<(String, f64)> = inner
                .zsets
                .get(key)
                .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
                .unwrap_or_default();
            members.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.0.cmp(&a.0))
            });
            members.truncate(limit);
            Ok(members.into_iter().map(|(member, _)| member).collect())
        })
    }

    fn scan<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut keys: Vec<String> = inner
                .kv
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn transition<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        removals: &'a [(String, String)],
        additions: &'a [(String, String, f64)],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.kv.insert(key.to_string(), value.to_string());
            for (set_key, member) in removals {
                if let Some(set) = inner.zsets.get_mut(set_key) {
                    set.remove(member);
                }
            }
            for (set_key, member, score) in additions {
                inner
                    .zsets
                    .entry(set_key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            Ok(())
        })
    }
}
