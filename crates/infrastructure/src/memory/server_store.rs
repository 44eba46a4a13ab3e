use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use subtitle_core::{DispatchError, DispatchResult};
use subtitle_domain::{ServerMutation, WorkerServer, WorkerServerRepository};
use tokio::sync::{Mutex, RwLock};

/// 内存Worker服务器仓储
#[derive(Debug, Default)]
pub struct InMemoryWorkerServerRepository {
    servers: RwLock<HashMap<String, Arc<Mutex<WorkerServer>>>>,
}

impl InMemoryWorkerServerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_servers(servers: Vec<WorkerServer>) -> Self {
        let repo = Self::new();
        for server in servers {
            repo.servers
                .write()
                .await
                .insert(server.id.clone(), Arc::new(Mutex::new(server)));
        }
        repo
    }
}

#[async_trait]
impl WorkerServerRepository for InMemoryWorkerServerRepository {
    async fn list(&self) -> DispatchResult<Vec<WorkerServer>> {
        let entries: Vec<Arc<Mutex<WorkerServer>>> =
            self.servers.read().await.values().cloned().collect();
        let mut servers = Vec::with_capacity(entries.len());
        for entry in entries {
            servers.push(entry.lock().await.clone());
        }
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<WorkerServer>> {
        let entry = self.servers.read().await.get(id).cloned();
        match entry {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn upsert(&self, server: WorkerServer) -> DispatchResult<()> {
        let existing = self.servers.read().await.get(&server.id).cloned();
        match existing {
            Some(entry) => *entry.lock().await = server,
            None => {
                self.servers
                    .write()
                    .await
                    .insert(server.id.clone(), Arc::new(Mutex::new(server)));
            }
        }
        Ok(())
    }

    async fn modify(&self, id: &str, mutation: ServerMutation) -> DispatchResult<WorkerServer> {
        let entry = self
            .servers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::ResourceNotFound { id: id.to_string() })?;
        let mut server = entry.lock().await;
        mutation(&mut server);
        Ok(server.clone())
    }
}
