//! 时间戳规范化
//!
//! 对外一律使用「无时区的 UTC」（NaiveDateTime）。写入时格式化为 ISO 字符串；
//! 读取时兼容 naive 字符串、带偏移的 RFC3339 字符串与 epoch 秒，统一换算为 naive UTC。

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(NAIVE_FORMAT).to_string()
}

/// 从存储值解析时间戳；无法识别时返回 None
pub fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => parse_str(s),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
            DateTime::from_timestamp(whole, nanos).map(|dt| dt.naive_utc())
        }
        _ => None,
    }
}

fn parse_str(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}
