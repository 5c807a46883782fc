//! Crontab 表达式
//!
//! 五字段 cron 表达式（分 时 日 月 周）的最小实现，支持 `*`、数值、列表、
//! 区间与 `*/n` 步进。周字段 0 与 7 都表示周日。
//!
//! 下一次触发时间总是相对"现在"向后搜索，从不相对上一次计划时间——
//! 错过的时隙不会补发（at-most-once 语义）。

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// cron 表达式解析错误。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum CronError {
    /// 字段数不是 5。
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    /// 字段内容无法解析或越界。
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// 字段原文。
        field: String,
        /// 失败原因。
        reason: String,
    },
}

/// 单个 cron 字段：允许值的集合。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct CronField {
    allowed: Vec<u8>,
}

impl CronField {
    fn parse(field: &str, min: u8, max: u8) -> Result<Self, CronError> {
        let mut allowed = Vec::new();

        for part in field.split(',') {
            let (range_part, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u8 = step.parse().map_err(|_| CronError::InvalidField {
                        field: field.to_string(),
                        reason: format!("bad step '{step}'"),
                    })?;
                    if step == 0 {
                        return Err(CronError::InvalidField {
                            field: field.to_string(),
                            reason: "step must be positive".to_string(),
                        });
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (lo, hi) = if range_part == "*" {
                (min, max)
            } else if let Some((lo, hi)) = range_part.split_once('-') {
                let lo: u8 = lo.parse().map_err(|_| CronError::InvalidField {
                    field: field.to_string(),
                    reason: format!("bad range start '{lo}'"),
                })?;
                let hi: u8 = hi.parse().map_err(|_| CronError::InvalidField {
                    field: field.to_string(),
                    reason: format!("bad range end '{hi}'"),
                })?;
                (lo, hi)
            } else {
                let value: u8 = range_part.parse().map_err(|_| CronError::InvalidField {
                    field: field.to_string(),
                    reason: format!("bad value '{range_part}'"),
                })?;
                (value, value)
            };

            // 周日可写作 7
            let (lo, hi) = if max == 6 && (lo == 7 || hi == 7) {
                (if lo == 7 { 0 } else { lo }, if hi == 7 { 0 } else { hi })
            } else {
                (lo, hi)
            };

            if lo < min || hi > max || lo > hi {
                return Err(CronError::InvalidField {
                    field: field.to_string(),
                    reason: format!("values out of range {min}-{max}"),
                });
            }

            let mut value = lo;
            while value <= hi {
                if !allowed.contains(&value) {
                    allowed.push(value);
                }
                match value.checked_add(step) {
                    Some(next) => value = next,
                    None => break,
                }
            }
        }

        allowed.sort_unstable();
        Ok(Self { allowed })
    }

    fn contains(&self, value: u8) -> bool {
        self.allowed.binary_search(&value).is_ok()
    }
}

/// 已解析的五字段 cron 表达式。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct CronExpression {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpression {
    /// 解析表达式，如 `30 14 * * 1-5`。
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            source: expression.to_string(),
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week: CronField::parse(fields[4], 0, 6)?,
        })
    }

    /// 表达式原文。
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 某个整分时刻是否命中表达式。
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        self.minute.contains(time.minute() as u8)
            && self.hour.contains(time.hour() as u8)
            && self.day_of_month.contains(time.day() as u8)
            && self.month.contains(time.month() as u8)
            && self
                .day_of_week
                .contains(time.weekday().num_days_from_sunday() as u8)
    }

    /// 严格在 `after` 之后的下一次触发时间。
    ///
    /// 一年内无命中（不可满足的日期组合）返回 `None`。
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // 截断到整分后推进一分钟开始搜索
        let mut candidate = truncate_to_minute(after)? + Duration::minutes(1);
        let horizon = after + Duration::days(366);

        while candidate <= horizon {
            if !self.month.contains(candidate.month() as u8)
                || !self.day_of_month.contains(candidate.day() as u8)
                || !self
                    .day_of_week
                    .contains(candidate.weekday().num_days_from_sunday() as u8)
            {
                // 当天无法命中：跳到次日零点
                candidate = truncate_to_day(candidate)? + Duration::days(1);
                continue;
            }
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }

        None
    }
}

fn truncate_to_minute(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        0,
    )
    .single()
}

fn truncate_to_day(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(time.year(), time.month(), time.day(), 0, 0, 0)
        .single()
}
