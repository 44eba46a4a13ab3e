use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use subtitle_core::{DispatchError, DispatchResult};
use subtitle_domain::{Job, JobMutation, JobRepository};
use tokio::sync::{Mutex, RwLock};

/// 内存任务仓储
///
/// 外层读写锁只保护索引，单个任务的修改在各自的互斥锁内完成。
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, session_id: &str) -> Option<Arc<Mutex<Job>>> {
        self.jobs.read().await.get(session_id).cloned()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: Job) -> DispatchResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.session_id) {
            return Err(DispatchError::DuplicateSession {
                session_id: job.session_id,
            });
        }
        jobs.insert(job.session_id.clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> DispatchResult<Option<Job>> {
        match self.entry(session_id).await {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn modify(&self, session_id: &str, mutation: JobMutation) -> DispatchResult<(Job, bool)> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or_else(|| DispatchError::JobNotFound {
                session_id: session_id.to_string(),
            })?;
        let mut job = entry.lock().await;
        let changed = mutation(&mut job);
        Ok((job.clone(), changed))
    }

    async fn list_by_owner(&self, owner_id: &str) -> DispatchResult<Vec<Job>> {
        let entries: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::new();
        for entry in entries {
            let job = entry.lock().await;
            if job.owner_id == owner_id {
                jobs.push(job.clone());
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
