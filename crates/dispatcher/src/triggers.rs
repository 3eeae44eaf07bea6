use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use cron::Schedule;
use tracing::{debug, warn};

use taskflow_core::models::{CronFields, CronValue, IntervalConfig, TriggerConfig};
use taskflow_core::{Result, SchedulerError};

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// 按ISO周过滤时最多跳过的周数
const MAX_WEEK_SKIPS: usize = 53 * 10;

/// 作业触发器
///
/// 由 `TriggerConfig` 构建，负责计算作业的下一次触发时间。所有计算均使用UTC。
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(CronTrigger),
    Interval(IntervalTrigger),
    Date(DateTrigger),
}

impl Trigger {
    /// `created_at` 为间隔触发器的网格起点
    pub fn from_config(config: &TriggerConfig, created_at: DateTime<Utc>) -> Result<Self> {
        match config {
            TriggerConfig::Cron(fields) => Ok(Trigger::Cron(CronTrigger::new(fields)?)),
            TriggerConfig::Interval(interval) => Ok(Trigger::Interval(IntervalTrigger::new(
                interval, created_at,
            )?)),
            TriggerConfig::Date { run_date } => Ok(Trigger::Date(DateTrigger {
                run_date: *run_date,
            })),
        }
    }

    /// 作业添加或恢复时的首次触发时间（不早于 `now`）
    pub fn first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(cron) => cron.next_after(ceil_to_second(now) - Duration::seconds(1)),
            Trigger::Interval(interval) => interval.next_after(now),
            Trigger::Date(date) => Some(date.run_date),
        }
    }

    /// 严格晚于 `after` 的下一次触发时间；DATE 触发器触发后返回 None
    pub fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(cron) => cron.next_after(after),
            Trigger::Interval(interval) => interval.next_after(after),
            Trigger::Date(date) => (date.run_date > after).then_some(date.run_date),
        }
    }

    /// 从 `from` 开始的若干次触发时间
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = self.first_fire_time(from);
        while let Some(time) = cursor {
            if times.len() >= count {
                break;
            }
            times.push(time);
            cursor = self.next_fire_time(time);
        }
        times
    }
}

/// CRON 触发器
///
/// 字段按重要性从高到低为 year, month, day, week, day_of_week, hour, minute, second。
/// 未设置的字段：比最低一个已设置字段更重要的取 `*`，更不重要的取最小值；
/// week 与 day_of_week 未设置时总是 `*`。所以 `{"hour": 2}` 表示每天 02:00:00。
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
    weeks: Option<Vec<u32>>,
}

impl CronTrigger {
    pub fn new(fields: &CronFields) -> Result<Self> {
        if fields.is_empty() {
            return Err(SchedulerError::InvalidTrigger(
                "CRON触发器至少需要设置一个字段".to_string(),
            ));
        }

        let expression = build_expression(fields)?;
        let schedule = Schedule::from_str(&expression).map_err(|e| SchedulerError::InvalidCron {
            expr: expression.clone(),
            message: e.to_string(),
        })?;

        let weeks = match &fields.week {
            Some(value) => {
                let text = value.to_string();
                let weeks = parse_value_set(&text, 1, 53, |_| None).map_err(|message| {
                    SchedulerError::InvalidCron {
                        expr: format!("week={text}"),
                        message,
                    }
                })?;
                Some(weeks)
            }
            None => None,
        };

        debug!("CRON触发器表达式: {}", expression);
        Ok(Self {
            expression,
            schedule,
            weeks,
        })
    }

    /// 传给 cron 库的7字段表达式（秒 分 时 日 月 周 年）
    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Some(weeks) = &self.weeks else {
            return self.schedule.after(&after).next();
        };

        let mut cursor = after;
        for _ in 0..MAX_WEEK_SKIPS {
            let candidate = self.schedule.after(&cursor).next()?;
            if weeks.contains(&candidate.iso_week().week()) {
                return Some(candidate);
            }
            // 跳到下一个ISO周的周一零点之前
            let date = candidate.date_naive();
            let days_to_monday = 7 - i64::from(date.weekday().num_days_from_monday());
            let next_monday = (date + Duration::days(days_to_monday))
                .and_time(NaiveTime::MIN)
                .and_utc();
            cursor = next_monday - Duration::seconds(1);
        }

        warn!("CRON触发器在搜索范围内没有匹配的周: {}", self.expression);
        None
    }
}

/// 固定间隔触发器，触发时间落在 `start + k * period` 的网格上
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    start: DateTime<Utc>,
    period: Duration,
}

impl IntervalTrigger {
    pub fn new(config: &IntervalConfig, start: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            start,
            period: config.period()?,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if after < self.start {
            return self.start.checked_add_signed(self.period);
        }
        let period_ms = self.period.num_milliseconds();
        let elapsed_ms = (after - self.start).num_milliseconds();
        let slots = elapsed_ms / period_ms + 1;
        let offset = Duration::try_milliseconds(slots.checked_mul(period_ms)?)?;
        self.start.checked_add_signed(offset)
    }
}

#[derive(Debug, Clone)]
pub struct DateTrigger {
    pub run_date: DateTime<Utc>,
}

/// CRON 只有秒级精度，带毫秒的时间向上取整到下一秒
fn ceil_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    match time.with_nanosecond(0) {
        Some(floor) if floor < time => floor + Duration::seconds(1),
        _ => time,
    }
}

fn build_expression(fields: &CronFields) -> Result<String> {
    // 从最重要到最不重要
    let ordered: [(&str, Option<&CronValue>, &str); 8] = [
        ("year", fields.year.as_ref(), "*"),
        ("month", fields.month.as_ref(), "1"),
        ("day", fields.day.as_ref(), "1"),
        ("week", fields.week.as_ref(), "*"),
        ("day_of_week", fields.day_of_week.as_ref(), "*"),
        ("hour", fields.hour.as_ref(), "0"),
        ("minute", fields.minute.as_ref(), "0"),
        ("second", fields.second.as_ref(), "0"),
    ];
    let least_significant_set = ordered
        .iter()
        .rposition(|(_, value, _)| value.is_some())
        .unwrap_or(0);

    let mut parts = Vec::with_capacity(ordered.len());
    for (index, (name, value, minimum)) in ordered.iter().enumerate() {
        let part = match value {
            Some(value) => translate_field(name, value)?,
            None if *name == "week" || *name == "day_of_week" => "*".to_string(),
            None if index < least_significant_set => "*".to_string(),
            None => minimum.to_string(),
        };
        parts.push(part);
    }

    // cron 库的字段顺序：秒 分 时 日 月 周 年
    Ok(format!(
        "{} {} {} {} {} {} {}",
        parts[7], parts[6], parts[5], parts[2], parts[1], parts[4], parts[0]
    ))
}

fn translate_field(name: &str, value: &CronValue) -> Result<String> {
    let text = value.to_string();
    if text.is_empty() {
        return Err(SchedulerError::InvalidCron {
            expr: format!("{name}="),
            message: "字段不能为空".to_string(),
        });
    }

    match name {
        // week 在匹配阶段过滤，这里不参与表达式
        "week" => Ok("*".to_string()),
        "day_of_week" => {
            let days = parse_value_set(&text, 0, 6, day_index).map_err(|message| {
                SchedulerError::InvalidCron {
                    expr: format!("day_of_week={text}"),
                    message,
                }
            })?;
            Ok(days
                .iter()
                .map(|day| DAY_NAMES[*day as usize])
                .collect::<Vec<_>>()
                .join(","))
        }
        "month" => Ok(capitalize_names(&text)),
        _ => Ok(text),
    }
}

fn day_index(token: &str) -> Option<u32> {
    DAY_NAMES
        .iter()
        .position(|day| day.eq_ignore_ascii_case(token))
        .map(|index| index as u32)
}

/// 月份名称统一成 cron 库接受的首字母大写形式
fn capitalize_names(expr: &str) -> String {
    let mut result = String::with_capacity(expr.len());
    let mut word_start = true;
    for c in expr.chars() {
        if c.is_ascii_alphabetic() {
            if word_start {
                result.push(c.to_ascii_uppercase());
            } else {
                result.push(c.to_ascii_lowercase());
            }
            word_start = false;
        } else {
            result.push(c);
            word_start = true;
        }
    }
    result
}

/// 解析 `*`、`a`、`a-b`、`*/n`、`a-b/n` 及逗号列表，返回升序去重后的取值
fn parse_value_set(
    expr: &str,
    min: u32,
    max: u32,
    lookup_name: fn(&str) -> Option<u32>,
) -> std::result::Result<Vec<u32>, String> {
    let parse_value = |token: &str| -> std::result::Result<u32, String> {
        let token = token.trim();
        let value = match token.parse::<u32>() {
            Ok(value) => value,
            Err(_) => lookup_name(token).ok_or_else(|| format!("无法识别的取值: {token}"))?,
        };
        if value < min || value > max {
            return Err(format!("取值 {value} 超出范围 {min}-{max}"));
        }
        Ok(value)
    };

    let mut selected = vec![false; (max + 1) as usize];
    for item in expr.split(',') {
        let item = item.trim();
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("无效的步长: {item}"))?;
                if step == 0 {
                    return Err(format!("步长必须大于0: {item}"));
                }
                (range.trim(), Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a)?, parse_value(b)?)
        } else {
            let value = parse_value(range)?;
            (value, if step.is_some() { max } else { value })
        };
        if start > end {
            return Err(format!("范围起点大于终点: {item}"));
        }

        for value in (start..=end).step_by(step.unwrap_or(1)) {
            selected[value as usize] = true;
        }
    }

    Ok((min..=max).filter(|v| selected[*v as usize]).collect())
}
