use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use subtitle_core::{DailyClock, DispatchResult};
use subtitle_domain::QuotaLedger;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct UserQuota {
    used_today: u32,
    last_reset: DateTime<Utc>,
}

/// 内存用户配额账本，按固定时区的自然日重置
#[derive(Debug)]
pub struct InMemoryQuotaLedger {
    daily_limit: u32,
    clock: DailyClock,
    usage: Mutex<HashMap<String, UserQuota>>,
}

impl InMemoryQuotaLedger {
    pub fn new(daily_limit: u32, clock: DailyClock) -> Self {
        Self {
            daily_limit,
            clock,
            usage: Mutex::new(HashMap::new()),
        }
    }

    fn current<'a>(
        &self,
        usage: &'a mut HashMap<String, UserQuota>,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> &'a mut UserQuota {
        let entry = usage.entry(owner_id.to_string()).or_insert(UserQuota {
            used_today: 0,
            last_reset: now,
        });
        if self.clock.needs_reset(Some(entry.last_reset), now) {
            debug!("用户 {} 的每日配额已重置", owner_id);
            entry.used_today = 0;
            entry.last_reset = now;
        }
        entry
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn charge(&self, owner_id: &str, lines: u32) -> DispatchResult<u32> {
        let mut usage = self.usage.lock().await;
        let quota = self.current(&mut usage, owner_id, Utc::now());
        let remaining = self.daily_limit.saturating_sub(quota.used_today);
        let granted = lines.min(remaining);
        quota.used_today += granted;
        if granted < lines {
            info!(
                "用户 {} 配额不足，请求 {} 行，仅授予 {} 行",
                owner_id, lines, granted
            );
        }
        Ok(granted)
    }

    async fn refund(&self, owner_id: &str, lines: u32) -> DispatchResult<()> {
        if lines == 0 {
            return Ok(());
        }
        let mut usage = self.usage.lock().await;
        let quota = self.current(&mut usage, owner_id, Utc::now());
        quota.used_today = quota.used_today.saturating_sub(lines);
        info!("已为用户 {} 退还 {} 行配额", owner_id, lines);
        Ok(())
    }

    async fn remaining(&self, owner_id: &str) -> DispatchResult<u32> {
        let mut usage = self.usage.lock().await;
        let quota = self.current(&mut usage, owner_id, Utc::now());
        Ok(self.daily_limit.saturating_sub(quota.used_today))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_charge_truncates_to_remaining() {
        let ledger = InMemoryQuotaLedger::new(100, DailyClock::utc());
        assert_eq!(ledger.charge("u1", 80).await.unwrap(), 80);
        assert_eq!(ledger.charge("u1", 50).await.unwrap(), 20);
        assert_eq!(ledger.charge("u1", 1).await.unwrap(), 0);
        assert_eq!(ledger.remaining("u2").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_refund_restores_quota() {
        let ledger = InMemoryQuotaLedger::new(100, DailyClock::utc());
        ledger.charge("u1", 100).await.unwrap();
        ledger.refund("u1", 30).await.unwrap();
        assert_eq!(ledger.remaining("u1").await.unwrap(), 30);
        ledger.refund("u1", 500).await.unwrap();
        assert_eq!(ledger.remaining("u1").await.unwrap(), 100);
    }
}
