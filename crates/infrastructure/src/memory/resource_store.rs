use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use subtitle_core::{DispatchError, DispatchResult};
use subtitle_domain::{PooledResource, ResourceState, ResourceStore, StateMutation};
use tokio::sync::{Mutex, RwLock};

/// 内存资源存储，API密钥与代理共用
///
/// 每个资源一把锁，一个资源上的计数更新不会阻塞其他资源。
#[derive(Debug)]
pub struct InMemoryResourceStore<R> {
    resources: RwLock<HashMap<String, Arc<Mutex<R>>>>,
}

impl<R: PooledResource> Default for InMemoryResourceStore<R> {
    fn default() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: PooledResource> InMemoryResourceStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_resources(resources: Vec<R>) -> Self {
        let store = Self::new();
        {
            let mut map = store.resources.write().await;
            for resource in resources {
                map.insert(
                    resource.resource_id().to_string(),
                    Arc::new(Mutex::new(resource)),
                );
            }
        }
        store
    }
}

#[async_trait]
impl<R: PooledResource> ResourceStore<R> for InMemoryResourceStore<R> {
    async fn list(&self) -> DispatchResult<Vec<R>> {
        let entries: Vec<Arc<Mutex<R>>> = self.resources.read().await.values().cloned().collect();
        let mut resources = Vec::with_capacity(entries.len());
        for entry in entries {
            resources.push(entry.lock().await.clone());
        }
        resources.sort_by(|a, b| a.resource_id().cmp(b.resource_id()));
        Ok(resources)
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<R>> {
        let entry = self.resources.read().await.get(id).cloned();
        match entry {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn upsert(&self, resource: R) -> DispatchResult<()> {
        let existing = self.resources.read().await.get(resource.resource_id()).cloned();
        match existing {
            Some(entry) => *entry.lock().await = resource,
            None => {
                self.resources.write().await.insert(
                    resource.resource_id().to_string(),
                    Arc::new(Mutex::new(resource)),
                );
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> DispatchResult<bool> {
        Ok(self.resources.write().await.remove(id).is_some())
    }

    async fn update_state(&self, id: &str, mutation: StateMutation) -> DispatchResult<ResourceState> {
        let entry = self
            .resources
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::ResourceNotFound { id: id.to_string() })?;
        let mut resource = entry.lock().await;
        mutation(resource.state_mut());
        Ok(resource.state().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subtitle_domain::ApiKey;

    #[tokio::test]
    async fn test_update_state_is_per_resource() {
        let store = InMemoryResourceStore::with_resources(vec![
            ApiKey::new("k1", "AIzaSyKeyNumberOne0001"),
            ApiKey::new("k2", "AIzaSyKeyNumberTwo0002"),
        ])
        .await;

        let state = store
            .update_state("k1", Box::new(|s| s.requests_today += 2))
            .await
            .unwrap();
        assert_eq!(state.requests_today, 2);

        let other = store.get("k2").await.unwrap().unwrap();
        assert_eq!(other.state.requests_today, 0);

        assert!(store
            .update_state("missing", Box::new(|_| {}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_upsert_and_remove() {
        let store: InMemoryResourceStore<ApiKey> = InMemoryResourceStore::new();
        store.upsert(ApiKey::new("k1", "AIzaSyKeyNumberOne0001")).await.unwrap();
        let mut replaced = ApiKey::new("k1", "AIzaSyKeyNumberOne0001");
        replaced.rpm_limit = Some(5);
        store.upsert(replaced).await.unwrap();
        assert_eq!(store.list().await.unwrap()[0].rpm_limit, Some(5));
        assert!(store.remove("k1").await.unwrap());
        assert!(!store.remove("k1").await.unwrap());
    }
}
