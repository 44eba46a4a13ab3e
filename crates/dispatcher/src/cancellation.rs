//! 任务取消登记
//!
//! 每个进行中的任务持有一个取消令牌，下游工作在自然检查点观察它
//! （开始新批次前、重试前）。已经发出的HTTP请求不会被强制中断。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use subtitle_core::DispatchResult;
use subtitle_domain::{
    CancelCode, CancelOutcome, Job, JobRepository, JobStatus, CANCELLED_BY_USER, JOB_TIMED_OUT,
};
use subtitle_infrastructure::DispatchMetrics;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::refund::RefundBook;

#[derive(Debug, Clone)]
struct ActiveJob {
    owner_id: String,
    token: CancellationToken,
    /// 取消后停止超时看门狗；是 `token` 的子令牌
    watchdog: CancellationToken,
}

pub struct CancellationRegistry {
    jobs: Arc<dyn JobRepository>,
    refunds: Arc<RefundBook>,
    active: RwLock<HashMap<String, ActiveJob>>,
    metrics: DispatchMetrics,
}

impl CancellationRegistry {
    pub fn new(jobs: Arc<dyn JobRepository>, refunds: Arc<RefundBook>) -> Self {
        Self {
            jobs,
            refunds,
            active: RwLock::new(HashMap::new()),
            metrics: DispatchMetrics::new(),
        }
    }

    /// 登记任务并启动超时看门狗；重复登记返回已有的令牌
    pub async fn register(
        self: &Arc<Self>,
        session_id: &str,
        owner_id: &str,
        timeout: Duration,
    ) -> CancellationToken {
        let mut active = self.active.write().await;
        if let Some(existing) = active.get(session_id) {
            debug!("任务 {} 已登记，返回已有的取消令牌", session_id);
            return existing.token.clone();
        }

        let token = CancellationToken::new();
        let watchdog = token.child_token();
        active.insert(
            session_id.to_string(),
            ActiveJob {
                owner_id: owner_id.to_string(),
                token: token.clone(),
                watchdog: watchdog.clone(),
            },
        );
        drop(active);

        let registry = Arc::clone(self);
        let sid = session_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Err(e) = registry.expire(&sid, timeout).await {
                        warn!("任务 {} 超时处理失败: {}", sid, e);
                    }
                }
                _ = watchdog.cancelled() => {}
            }
        });

        debug!("任务 {} 已登记，超时 {:?}", session_id, timeout);
        token
    }

    /// 看门狗到期：任务仍未结束时强制失败并退款
    async fn expire(&self, session_id: &str, timeout: Duration) -> DispatchResult<()> {
        let (job, changed) = self
            .jobs
            .modify(
                session_id,
                Box::new(move |job| {
                    let successful = job.completed_lines;
                    let total = job.total_lines;
                    if !job.finish(JobStatus::Failed, Some(JOB_TIMED_OUT.to_string())) {
                        return false;
                    }
                    job.error_details = Some(json!({
                        "reason": "TIMEOUT",
                        "timeoutSeconds": timeout.as_secs(),
                        "totalLines": total,
                        "successfulLines": successful,
                    }));
                    true
                }),
            )
            .await?;

        self.signal_and_remove(session_id).await;

        if changed {
            warn!(
                "任务 {} 执行超过 {:?}，已强制失败（已完成 {}/{} 行）",
                session_id, timeout, job.completed_lines, job.total_lines
            );
            self.metrics.job_finalized("timeout");
            self.refunds.refund_unfinished(session_id).await?;
        }
        Ok(())
    }

    async fn signal_and_remove(&self, session_id: &str) {
        if let Some(entry) = self.active.write().await.remove(session_id) {
            entry.token.cancel();
        }
    }

    fn rejection_for(job: &Job) -> Option<CancelOutcome> {
        match job.status {
            JobStatus::Completed | JobStatus::PartialCompleted => Some(CancelOutcome::rejected(
                CancelCode::AlreadyCompleted,
                "任务已完成，无法取消",
            )),
            JobStatus::Failed => Some(CancelOutcome::rejected(
                CancelCode::AlreadyFailed,
                "任务已失败或已被取消",
            )),
            _ => None,
        }
    }

    /// 用户取消任务
    pub async fn cancel(&self, session_id: &str, caller_id: &str) -> DispatchResult<CancelOutcome> {
        let Some(job) = self.jobs.get(session_id).await? else {
            return Ok(CancelOutcome::rejected(CancelCode::NotFound, "任务不存在"));
        };
        if job.owner_id != caller_id {
            warn!("用户 {} 尝试取消不属于自己的任务 {}", caller_id, session_id);
            return Ok(CancelOutcome::rejected(CancelCode::Forbidden, "无权取消该任务"));
        }
        if let Some(rejection) = Self::rejection_for(&job) {
            return Ok(rejection);
        }

        let (job, changed) = self
            .jobs
            .modify(
                session_id,
                Box::new(|job| {
                    let successful = job.completed_lines;
                    let total = job.total_lines;
                    if !job.finish(JobStatus::Failed, Some(CANCELLED_BY_USER.to_string())) {
                        return false;
                    }
                    job.error_details = Some(json!({
                        "reason": "USER_CANCELLED",
                        "totalLines": total,
                        "successfulLines": successful,
                    }));
                    true
                }),
            )
            .await?;

        // 另一条路径先完成了终态转换
        if !changed {
            return Ok(Self::rejection_for(&job).unwrap_or_else(|| {
                CancelOutcome::rejected(CancelCode::AlreadyFailed, "任务状态已变更")
            }));
        }

        self.signal_and_remove(session_id).await;
        self.metrics.job_finalized("cancelled");
        let refunded = self.refunds.refund_unfinished(session_id).await?;
        info!(
            "用户 {} 取消了任务 {}（已完成 {}/{} 行，退还 {} 行）",
            caller_id, session_id, job.completed_lines, job.total_lines, refunded
        );
        Ok(CancelOutcome::ok(format!("任务已取消，已退还 {refunded} 行配额")))
    }

    /// 取消用户所有进行中的任务，返回成功取消的数量
    pub async fn cancel_all(&self, owner_id: &str) -> DispatchResult<u32> {
        let mut cancelled = 0;
        for job in self.active_jobs(owner_id).await? {
            if self.cancel(&job.session_id, owner_id).await?.success {
                cancelled += 1;
            }
        }
        info!("用户 {} 批量取消了 {} 个任务", owner_id, cancelled);
        Ok(cancelled)
    }

    /// 任务结束后注销，停止看门狗但不触发取消
    pub async fn unregister(&self, session_id: &str, owner_id: &str) {
        let mut active = self.active.write().await;
        match active.get(session_id) {
            Some(entry) if entry.owner_id == owner_id => {
                entry.watchdog.cancel();
                active.remove(session_id);
                debug!("任务 {} 已注销", session_id);
            }
            Some(_) => warn!("注销任务 {} 时所有者不匹配", session_id),
            None => {}
        }
    }

    /// 未登记的任务视为已取消
    pub async fn is_cancelled(&self, session_id: &str) -> bool {
        self.active
            .read()
            .await
            .get(session_id)
            .map_or(true, |entry| entry.token.is_cancelled())
    }

    pub async fn token(&self, session_id: &str) -> Option<CancellationToken> {
        self.active
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.token.clone())
    }

    pub async fn active_jobs(&self, owner_id: &str) -> DispatchResult<Vec<Job>> {
        Ok(self
            .jobs
            .list_by_owner(owner_id)
            .await?
            .into_iter()
            .filter(|job| job.status.is_active())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subtitle_core::DailyClock;
    use subtitle_domain::{QuotaLedger, SubtitleLine};
    use subtitle_infrastructure::{InMemoryJobRepository, InMemoryQuotaLedger};

    struct Fixture {
        registry: Arc<CancellationRegistry>,
        jobs: Arc<InMemoryJobRepository>,
        quota: Arc<InMemoryQuotaLedger>,
    }

    async fn fixture() -> Fixture {
        let jobs = Arc::new(InMemoryJobRepository::new());
        let quota = Arc::new(InMemoryQuotaLedger::new(1000, DailyClock::utc()));
        let refunds = Arc::new(RefundBook::new(jobs.clone(), quota.clone()));
        let registry = Arc::new(CancellationRegistry::new(jobs.clone(), refunds));
        Fixture { registry, jobs, quota }
    }

    async fn submit(f: &Fixture, sid: &str, owner: &str, lines: u32) {
        let items = (1..=lines).map(|i| SubtitleLine::new(i, "x")).collect();
        let mut job = Job::new(sid, owner, items, "translate", "m");
        job.status = JobStatus::Processing;
        f.jobs.insert(job).await.unwrap();
        f.quota.charge(owner, lines).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_marks_failed_and_refunds() {
        let f = fixture().await;
        submit(&f, "s1", "alice", 100).await;
        f.jobs
            .modify("s1", Box::new(|j| { j.update_progress(30); true }))
            .await
            .unwrap();
        let token = f.registry.register("s1", "alice", Duration::from_secs(900)).await;

        let outcome = f.registry.cancel("s1", "alice").await.unwrap();
        assert!(outcome.success);
        assert!(token.is_cancelled());
        assert!(f.registry.is_cancelled("s1").await);

        let job = f.jobs.get("s1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(CANCELLED_BY_USER));
        assert!(job.is_cancelled());
        assert_eq!(job.error_details.as_ref().unwrap()["successfulLines"], 30);
        assert_eq!(f.quota.remaining("alice").await.unwrap(), 970);
    }

    #[tokio::test]
    async fn test_cancel_rejections() {
        let f = fixture().await;
        submit(&f, "s1", "alice", 10).await;
        submit(&f, "s2", "alice", 10).await;
        f.jobs
            .modify("s2", Box::new(|j| j.finish(JobStatus::PartialCompleted, None)))
            .await
            .unwrap();

        let missing = f.registry.cancel("nope", "alice").await.unwrap();
        assert_eq!(missing.code, Some(CancelCode::NotFound));
        let forbidden = f.registry.cancel("s1", "mallory").await.unwrap();
        assert_eq!(forbidden.code, Some(CancelCode::Forbidden));
        let completed = f.registry.cancel("s2", "alice").await.unwrap();
        assert_eq!(completed.code, Some(CancelCode::AlreadyCompleted));

        assert!(f.registry.cancel("s1", "alice").await.unwrap().success);
        let again = f.registry.cancel("s1", "alice").await.unwrap();
        assert_eq!(again.code, Some(CancelCode::AlreadyFailed));
    }

    #[tokio::test]
    async fn test_concurrent_cancel_refunds_once() {
        let f = fixture().await;
        submit(&f, "s1", "alice", 50).await;
        f.registry.register("s1", "alice", Duration::from_secs(900)).await;

        let a = {
            let registry = f.registry.clone();
            tokio::spawn(async move { registry.cancel("s1", "alice").await })
        };
        let b = {
            let registry = f.registry.clone();
            tokio::spawn(async move { registry.cancel("s1", "alice").await })
        };
        let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        assert_eq!(results.iter().filter(|r| r.success).count(), 1);
        assert_eq!(f.quota.remaining("alice").await.unwrap(), 1000);
        assert_eq!(f.jobs.get("s1").await.unwrap().unwrap().refunded_lines, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_times_out_job() {
        let f = fixture().await;
        submit(&f, "s1", "alice", 20).await;
        let token = f.registry.register("s1", "alice", Duration::from_secs(60)).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(token.is_cancelled());
        let job = f.jobs.get("s1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(JOB_TIMED_OUT));
        assert!(!job.is_cancelled());
        assert_eq!(f.quota.remaining("alice").await.unwrap(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stops_watchdog_without_cancelling() {
        let f = fixture().await;
        submit(&f, "s1", "alice", 20).await;
        let token = f.registry.register("s1", "alice", Duration::from_secs(60)).await;
        let same = f.registry.register("s1", "alice", Duration::from_secs(5)).await;
        assert!(f.registry.token("s1").await.is_some());

        f.registry.unregister("s1", "alice").await;
        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;

        assert!(!token.is_cancelled());
        assert!(!same.is_cancelled());
        assert_eq!(f.jobs.get("s1").await.unwrap().unwrap().status, JobStatus::Processing);
        assert!(f.registry.is_cancelled("s1").await);
    }

    #[tokio::test]
    async fn test_cancel_all_only_touches_active_jobs() {
        let f = fixture().await;
        submit(&f, "a1", "alice", 5).await;
        submit(&f, "a2", "alice", 5).await;
        submit(&f, "b1", "bob", 5).await;
        f.jobs
            .modify("a2", Box::new(|j| j.finish(JobStatus::Completed, None)))
            .await
            .unwrap();

        assert_eq!(f.registry.cancel_all("alice").await.unwrap(), 1);
        assert!(f.registry.active_jobs("alice").await.unwrap().is_empty());
        assert_eq!(f.registry.active_jobs("bob").await.unwrap().len(), 1);
    }
}
