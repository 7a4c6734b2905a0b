//! Best-effort event enrichment applied before fan-out.
//!
//! Two additions, neither of which can fail:
//!
//! - `data.statusText` when `data.status` is a known task status code
//! - a top-level `_log_prefix` derived from `data.timestamp`

use chrono::{DateTime, Local, TimeZone, Utc};
use relay_protocol::Event;
use serde_json::Value;

/// Prefix used when `data.timestamp` is present but unusable.
pub const TIMESTAMP_ERROR_MARKER: &str = "[時間錯誤]";

/// Layout of a valid log prefix, e.g. `[2024/3/7 PM2:05:09]`.
const LOG_PREFIX_FORMAT: &str = "[%Y/%-m/%-d %p%-I:%M:%S]";

/// Display text for a robot task status code.
#[must_use]
pub fn status_text(code: &str) -> Option<&'static str> {
    let text = match code {
        "ST-M1001" => "收到任務申請",
        "ST-M1002" => "新建調度任務",
        "ST-M1003" => "到達取貨點",
        "ST-M1004" => "送物點到達",
        "ST-M1005" => "達成額外結束條件",
        "ST-M1006" => "任務結束",
        "ST-M1007" => "任務結束(使用者退件)",
        "ST-M1008" => "任務結束返回",
        "ST-M1009" => "到點通知",
        "ST-M1010" => "任務結束返回-已返回待命點",
        "ST-N1001" => "通知住戶",
        "ST-N1002" => "等待住戶",
        "ST-N1003" => "住戶取物中",
        "ST-EL1001" => "[EL電梯] 已從某樓進入電梯",
        "ST-EL1002" => "[EL電梯] 已出電梯至某樓層",
        "ST-VM1001" => "[VM智販機] 已到達智販機取物",
        "ST-VM1002" => "[VM智販機] 已完成智販機取物",
        _ => return None,
    };
    Some(text)
}

/// Interpret a timestamp field as whole epoch seconds.
///
/// Integers are taken as is, floats are truncated and numeric strings are
/// parsed after trimming.
fn epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Format a log prefix for `value` in the given time zone.
///
/// Returns [`TIMESTAMP_ERROR_MARKER`] for anything that is not a
/// representable epoch-seconds value.
#[must_use]
pub fn format_log_prefix<Tz>(value: &Value, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    epoch_seconds(value)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|utc| utc.with_timezone(tz).format(LOG_PREFIX_FORMAT).to_string())
        .unwrap_or_else(|| TIMESTAMP_ERROR_MARKER.to_string())
}

/// Enrich an event in the given time zone.
#[must_use]
pub fn enrich_in<Tz>(mut event: Event, tz: &Tz) -> Event
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut prefix = None;

    if let Some(data) = event.data.as_object_mut() {
        if let Some(text) = data.get("status").and_then(Value::as_str).and_then(status_text) {
            data.insert("statusText".to_string(), Value::String(text.to_string()));
        }
        prefix = data.get("timestamp").map(|ts| format_log_prefix(ts, tz));
    }

    if prefix.is_some() {
        event.log_prefix = prefix;
    }
    event
}

/// Enrich an event using server-local time.
#[must_use]
pub fn enrich(event: Event) -> Event {
    enrich_in(event, &Local)
}
