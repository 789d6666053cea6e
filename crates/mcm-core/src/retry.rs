//! 有界固定退避的重试计划。
//!
//! 计划本身是纯数据；睡眠与执行由持有异步运行时的调用方完成。快路径
//! 约容忍 30 秒中断（点查、会话操作），慢路径约容忍 3 分钟（前缀扫描、
//! 主节点查询）。重试耗尽后操作以 `Transient` 分类浮出，由控制循环
//! 把连续的瞬时失败折算成会话丢失。

use std::time::Duration;

/// 固定退避重试计划。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）。
    pub attempts: u32,
    /// 相邻尝试之间的间隔。
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// 快路径计划：6 次 × 5 秒 ≈ 30 秒中断容忍。
    pub const fn fast() -> Self {
        Self::new(6, Duration::from_secs(5))
    }

    /// 慢路径计划：36 次 × 5 秒 ≈ 3 分钟中断容忍。
    pub const fn slow() -> Self {
        Self::new(36, Duration::from_secs(5))
    }

    /// 整个计划的最大等待总量（不含操作本身耗时）。
    pub fn budget(&self) -> Duration {
        self.backoff * self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_match_outage_tolerances() {
        assert_eq!(RetryPolicy::fast().budget(), Duration::from_secs(25));
        assert_eq!(RetryPolicy::slow().budget(), Duration::from_secs(175));
    }
}
