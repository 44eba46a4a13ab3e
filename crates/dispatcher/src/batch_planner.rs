use serde::{Deserialize, Serialize};

/// 一个连续批次在任务行列表中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpan {
    pub batch_index: u32,
    pub start: u32,
    pub len: u32,
}

impl BatchSpan {
    pub fn end(&self) -> u32 {
        self.start + self.len
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start as usize..self.end() as usize
    }
}

/// 把 `item_count` 行切分为连续批次
///
/// 从左到右每批取 `min(batch_size, remaining)` 行；剩余行数不超过
/// `batch_size + merge_threshold` 且已有批次时，剩余部分并入上一批。
pub fn plan(item_count: u32, batch_size: u32, merge_threshold: u32) -> Vec<BatchSpan> {
    let batch_size = batch_size.max(1);
    let mut batches: Vec<BatchSpan> = Vec::new();
    let mut index = 0u32;

    while index < item_count {
        let remaining = item_count - index;

        if remaining <= batch_size.saturating_add(merge_threshold) {
            if let Some(last) = batches.last_mut() {
                last.len += remaining;
                break;
            }
        }

        let size = batch_size.min(remaining);
        batches.push(BatchSpan {
            batch_index: batches.len() as u32,
            start: index,
            len: size,
        });
        index += size;
    }

    batches
}
