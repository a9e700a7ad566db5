// AI 调用限流：全局串行，两次调用之间至少间隔 min_interval

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct CallThrottle {
    min_interval: Duration,
    /// 上次放行时间
    last_call: Mutex<Option<Instant>>,
}

impl CallThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// 等待直到允许下一次调用
    ///
    /// 等待期间持有锁，并发调用者按顺序放行
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;

        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!("AI 调用限流，等待 {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        *last = Some(Instant::now());
    }
}
