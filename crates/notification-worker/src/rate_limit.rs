//! 发送限流
//!
//! 进程内固定窗口计数器。单队列单消费模型下同一通道的发送
//! 只发生在一个进程里，不需要分布式计数；横向扩容时此处需换为
//! 共享存储。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use notify_shared::error::{NotifyError, Result};

struct Window {
    started_at: Instant,
    count: u64,
}

/// 固定窗口限流器
///
/// 同一 key 在一个窗口内最多放行 limit 次，第 limit+1 次同步拒绝。
/// 窗口过期后计数清零重新开始。
pub struct FixedWindowLimiter {
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 尝试占用一次配额
    pub fn acquire(&self, key: &str, limit: u64) -> Result<()> {
        let mut windows = self.windows.lock();
        let now = Instant::now();

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= self.window {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= limit {
            return Err(NotifyError::RateLimitExceeded {
                operation: key.to_string(),
            });
        }

        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
        for _ in 0..5 {
            limiter.acquire("EMAIL", 5).unwrap();
        }
        // 第 6 次同步拒绝
        let err = limiter.acquire("EMAIL", 5).unwrap_err();
        assert!(matches!(err, NotifyError::RateLimitExceeded { .. }));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
        limiter.acquire("EMAIL", 1).unwrap();
        assert!(limiter.acquire("EMAIL", 1).is_err());
        assert!(limiter.acquire("SMS", 1).is_ok());
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let limiter = FixedWindowLimiter::new(Duration::from_millis(10));
        limiter.acquire("PUSH", 1).unwrap();
        assert!(limiter.acquire("PUSH", 1).is_err());
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.acquire("PUSH", 1).is_ok());
    }
}
