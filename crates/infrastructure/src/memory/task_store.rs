use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use subtitle_core::{DispatchError, DispatchResult};
use subtitle_domain::{ServerTask, TaskMutation, TaskRepository};
use tokio::sync::{Mutex, RwLock};

type TaskKey = (String, u32);

/// 内存批次任务仓储
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<TaskKey, Arc<Mutex<ServerTask>>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: ServerTask) -> DispatchResult<()> {
        let key = (task.session_id.clone(), task.batch_index);
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&key) {
            return Err(DispatchError::Internal(format!(
                "批次任务已存在: {}",
                task.composite_key()
            )));
        }
        tasks.insert(key, Arc::new(Mutex::new(task)));
        Ok(())
    }

    async fn get(&self, session_id: &str, batch_index: u32) -> DispatchResult<Option<ServerTask>> {
        let entry = self
            .tasks
            .read()
            .await
            .get(&(session_id.to_string(), batch_index))
            .cloned();
        match entry {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn list_for_job(&self, session_id: &str) -> DispatchResult<Vec<ServerTask>> {
        let entries: Vec<Arc<Mutex<ServerTask>>> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|((sid, _), _)| sid == session_id)
            .map(|(_, entry)| entry.clone())
            .collect();

        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            tasks.push(entry.lock().await.clone());
        }
        tasks.sort_by_key(|t| t.batch_index);
        Ok(tasks)
    }

    async fn modify(
        &self,
        session_id: &str,
        batch_index: u32,
        mutation: TaskMutation,
    ) -> DispatchResult<(ServerTask, bool)> {
        let entry = self
            .tasks
            .read()
            .await
            .get(&(session_id.to_string(), batch_index))
            .cloned()
            .ok_or_else(|| DispatchError::TaskNotFound {
                session_id: session_id.to_string(),
                batch_index,
            })?;
        let mut task = entry.lock().await;
        let changed = mutation(&mut task);
        Ok((task.clone(), changed))
    }
}
