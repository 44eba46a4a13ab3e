//! 固定时区的自然日边界
//!
//! 凭据、代理和用户配额的每日计数都按同一个固定UTC偏移量的自然日重置，
//! 不使用系统本地时区。

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};

use crate::{DispatchError, DispatchResult};

/// 每日重置时钟
#[derive(Debug, Clone, Copy)]
pub struct DailyClock {
    offset: FixedOffset,
}

impl DailyClock {
    /// 按小时偏移量创建，例如 `7` 表示 UTC+07:00
    pub fn from_offset_hours(hours: i32) -> DispatchResult<Self> {
        let offset = FixedOffset::east_opt(hours * 3600).ok_or_else(|| {
            DispatchError::Configuration(format!("无效的时区偏移: {hours} 小时"))
        })?;
        Ok(Self { offset })
    }

    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// `now` 所在自然日的起点（以UTC表示）
    pub fn start_of_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset);
        let midnight = local.date_naive().and_time(NaiveTime::MIN);
        match self.offset.from_local_datetime(&midnight).single() {
            Some(start) => start.with_timezone(&Utc),
            None => now,
        }
    }

    /// 下一个自然日的起点
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.start_of_day(now) + Duration::days(1)
    }

    /// 上次重置发生在当前自然日之前时需要重置
    pub fn needs_reset(&self, last_reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_reset {
            Some(last) => last < self.start_of_day(now),
            None => true,
        }
    }
}

impl Default for DailyClock {
    fn default() -> Self {
        Self::utc()
    }
}
