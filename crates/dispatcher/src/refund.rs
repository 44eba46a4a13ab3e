use std::sync::Arc;

use subtitle_core::DispatchResult;
use subtitle_domain::{JobRepository, QuotaLedger};
use subtitle_infrastructure::DispatchMetrics;
use tracing::{debug, info};

/// 配额退还
///
/// 每个任务最多退还一次：退款标记在任务记录的原子修改内设置，
/// 取消、超时和自然完成三条路径竞争时只有一条能成功。
pub struct RefundBook {
    jobs: Arc<dyn JobRepository>,
    quota: Arc<dyn QuotaLedger>,
    metrics: DispatchMetrics,
}

impl RefundBook {
    pub fn new(jobs: Arc<dyn JobRepository>, quota: Arc<dyn QuotaLedger>) -> Self {
        Self {
            jobs,
            quota,
            metrics: DispatchMetrics::new(),
        }
    }

    /// 退还任务未完成的行数，返回本次退还的行数；已退还过则返回0
    pub async fn refund_unfinished(&self, session_id: &str) -> DispatchResult<u32> {
        let (job, applied) = self
            .jobs
            .modify(
                session_id,
                Box::new(|job| {
                    let lines = job.unfinished_lines();
                    job.mark_refunded(lines)
                }),
            )
            .await?;

        if !applied {
            debug!("任务 {} 已退还过配额，跳过", session_id);
            return Ok(0);
        }

        let lines = job.refunded_lines;
        if lines > 0 {
            self.quota.refund(&job.owner_id, lines).await?;
            self.metrics.lines_refunded(lines);
            info!("任务 {} 退还 {} 行配额给用户 {}", session_id, lines, job.owner_id);
        }
        Ok(lines)
    }

    /// 提交失败时退还已扣除的配额，此时任务记录尚未创建
    pub async fn refund_charge(&self, owner_id: &str, lines: u32) -> DispatchResult<()> {
        if lines == 0 {
            return Ok(());
        }
        self.quota.refund(owner_id, lines).await?;
        self.metrics.lines_refunded(lines);
        info!("提交未成功，退还用户 {} 的 {} 行配额", owner_id, lines);
        Ok(())
    }
}
