//! 时间工具
//!
//! - 存储层：所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - 待同步日志：使用 `MonotonicClock`，保证同一进程内时间戳严格递增
//! - 远端：RFC 3339 字符串（`updated_at`）

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳转 RFC 3339（远端 `updated_at` 字段格式）
pub fn millis_to_rfc3339(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// RFC 3339 转毫秒时间戳，解析失败返回 None
pub fn rfc3339_to_millis(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// 实体 `updated_at` 的远端格式：写出 RFC 3339 字符串，读入时兼容字符串与毫秒整数
///
/// 用法：`#[serde(default, with = "crate::utils::time::rfc3339_millis")]`
pub mod rfc3339_millis {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{millis_to_rfc3339, rfc3339_to_millis};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S>(millis: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&millis_to_rfc3339(*millis))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(0),
            Some(Raw::Millis(millis)) => Ok(millis),
            Some(Raw::Text(text)) => rfc3339_to_millis(&text)
                .ok_or_else(|| de::Error::custom(format!("无效的 RFC 3339 时间: {}", text))),
        }
    }
}

/// 严格递增的毫秒时钟
///
/// 同一毫秒内的多次调用返回 last + 1，系统时钟回拨时也不会倒退。
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub const fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    /// 以给定时间戳为下限初始化（重启后接续已落库日志的最大时间戳）
    pub fn observe(&self, timestamp: i64) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn next(&self) -> i64 {
        let now = now_millis();
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = if now > prev { now } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}
