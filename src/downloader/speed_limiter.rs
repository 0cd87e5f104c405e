//! 全局限速，所有下载中的流共用一个令牌桶

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone)]
pub struct SpeedLimiter {
    /// 字节/秒，0 表示不限速
    limit_bps: Arc<AtomicU64>,
    bucket: Arc<Mutex<Bucket>>,
}

struct Bucket {
    /// 可以为负，大块数据先透支再等待补齐
    tokens: f64,
    last_refill: Instant,
}

impl SpeedLimiter {
    pub fn new(limit_bps: Option<u64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        Self {
            limit_bps: Arc::new(AtomicU64::new(limit)),
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: limit as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn set_limit(&self, limit_bps: Option<u64>) {
        self.limit_bps.store(limit_bps.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn get_limit(&self) -> Option<u64> {
        match self.limit_bps.load(Ordering::Relaxed) {
            0 => None,
            limit => Some(limit),
        }
    }

    /// 写入 `bytes` 字节之前调用，令牌不足时等待
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }

        loop {
            let limit = self.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }

            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * limit as f64).min(limit as f64);
                bucket.last_refill = now;

                // 桶容量是一秒的量，超过容量的块在桶满时放行
                let needed = (bytes as f64).min(limit as f64);
                if bucket.tokens >= needed {
                    bucket.tokens -= bytes as f64;
                    return;
                }
                Duration::from_secs_f64((needed - bucket.tokens) / limit as f64)
            };

            tokio::time::sleep(wait).await;
        }
    }
}
