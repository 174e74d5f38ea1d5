//! Periodic task scheduling for extensions
//!
//! A small five-field cron core (minute, hour, day-of-month, month,
//! day-of-week) drives extension-registered tasks. All task bodies
//! registered through one scheduler are serialized by a shared mutex; a
//! panicking task is recovered and logged, never unscheduled. Resolution is
//! cron-grade: the driver ticks and fires each matching minute once.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use tracing::{error, info};

use crate::application::errors::ScheduleError;

static TASK_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").expect("valid regex"));

/// Convert a 24-hour `H:MM`/`HH:MM` time into a five-field cron expression
/// firing once a day.
pub fn parse_daily_time(s: &str) -> Result<String, ScheduleError> {
    let caps = TASK_TIME_RE
        .captures(s.trim())
        .ok_or_else(|| ScheduleError::InvalidDailyTime(s.to_string()))?;
    let hour: u32 = caps[1].parse().map_err(|_| ScheduleError::InvalidDailyTime(s.to_string()))?;
    let minute: u32 = caps[2].parse().map_err(|_| ScheduleError::InvalidDailyTime(s.to_string()))?;
    Ok(format!("{minute} {hour} * * *"))
}

/// One field of a cron expression; `None` is the `*` wildcard
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField(Option<Vec<u32>>);

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match &self.0 {
            None => true,
            Some(values) => values.contains(&value),
        }
    }
}

fn parse_field(s: &str, min: u32, max: u32) -> Result<CronField, ScheduleError> {
    let bad = || ScheduleError::InvalidCron(format!("bad field '{s}'"));
    if s == "*" {
        return Ok(CronField(None));
    }
    if let Some(step) = s.strip_prefix("*/") {
        let step: u32 = step.parse().map_err(|_| bad())?;
        if step == 0 {
            return Err(bad());
        }
        return Ok(CronField(Some((min..=max).filter(|v| (v - min) % step == 0).collect())));
    }
    let mut values = Vec::new();
    for part in s.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| bad())?;
            let hi: u32 = hi.parse().map_err(|_| bad())?;
            if lo > hi || lo < min || hi > max {
                return Err(bad());
            }
            values.extend(lo..=hi);
        } else {
            let v: u32 = part.parse().map_err(|_| bad())?;
            if v < min || v > max {
                return Err(bad());
            }
            values.push(v);
        }
    }
    if values.is_empty() {
        return Err(bad());
    }
    Ok(CronField(Some(values)))
}

/// A parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 fields, got {} in '{s}'",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            // 7 is accepted as an alias for Sunday
            day_of_week: match parse_field(fields[4], 0, 7)? {
                CronField(Some(v)) => {
                    CronField(Some(v.into_iter().map(|d| if d == 7 { 0 } else { d }).collect()))
                }
                any => any,
            },
        })
    }

    pub fn matches(&self, t: &DateTime<Local>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }
}

/// How a task's schedule was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Cron,
    Daily,
}

impl TaskKind {
    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        match s {
            "cron" => Ok(TaskKind::Cron),
            "daily" => Ok(TaskKind::Daily),
            other => Err(ScheduleError::UnknownKind(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Cron => "cron",
            TaskKind::Daily => "daily",
        }
    }
}

/// Materialized context handed to a task body on each trigger
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub now: i64,
    pub key: String,
}

pub type TaskFn = Arc<dyn Fn(&TaskContext) + Send + Sync>;

/// A registered periodic task. `on`/`off` are idempotent; `run` serializes
/// through the owning scheduler's mutex and recovers panics.
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub key: String,
    pub owner: String,
    raw: Mutex<String>,
    cron: Mutex<CronExpr>,
    callback: TaskFn,
    entry: Mutex<Option<u64>>,
    scheduler: Weak<TaskScheduler>,
}

impl ScheduledTask {
    pub fn raw_expr(&self) -> String {
        self.raw.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn is_on(&self) -> bool {
        self.entry.lock().map(|e| e.is_some()).unwrap_or(false)
    }

    fn cron_matches(&self, t: &DateTime<Local>) -> bool {
        self.cron.lock().map(|c| c.matches(t)).unwrap_or(false)
    }

    /// Execute the task body once, serialized against every other task on
    /// the same scheduler. A panicking body is logged and the task stays
    /// registered for its next trigger.
    pub fn run(&self) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        let ctx = TaskContext {
            now: Utc::now().timestamp(),
            key: self.key.clone(),
        };
        let _serialized = match scheduler.run_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let callback = self.callback.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&ctx))) {
            let text = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("scheduled task of '{}' (key '{}') panicked: {}", self.owner, self.key, text);
        }
    }

    /// Add the underlying cron entry; a no-op success when already on
    pub fn on(self: &Arc<Self>) -> Result<(), ScheduleError> {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return Err(ScheduleError::SchedulerGone);
        };
        let mut entry = match self.entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entry.is_none() {
            *entry = Some(scheduler.add_entry(self.clone()));
        }
        Ok(())
    }

    /// Remove the underlying cron entry; a no-op success when already off
    pub fn off(&self) -> Result<(), ScheduleError> {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return Err(ScheduleError::SchedulerGone);
        };
        let mut entry = match self.entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(id) = entry.take() {
            scheduler.remove_entry(id);
        }
        Ok(())
    }

    /// Swap the schedule expression. An active task is turned off around the
    /// swap and back on after; the run mutex keeps the swap clear of any
    /// executing body.
    pub fn reset(self: &Arc<Self>, expr: &str) -> Result<(), ScheduleError> {
        let cron_text = match self.kind {
            TaskKind::Cron => expr.to_string(),
            TaskKind::Daily => parse_daily_time(expr)?,
        };
        let parsed = CronExpr::parse(&cron_text)?;

        let was_on = self.is_on();
        if was_on {
            self.off()?;
        }
        if let (Ok(mut raw), Ok(mut cron)) = (self.raw.lock(), self.cron.lock()) {
            *raw = expr.to_string();
            *cron = parsed;
        }
        if was_on {
            self.on()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("on", &self.is_on())
            .finish()
    }
}

/// Cron-style periodic execution service, one per host instance. All task
/// invocations are serialized through `run_lock`.
pub struct TaskScheduler {
    run_lock: Mutex<()>,
    entries: Mutex<Vec<(u64, Arc<ScheduledTask>)>>,
    next_id: AtomicU64,
    last_minute: Mutex<Option<i64>>,
}

impl TaskScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            run_lock: Mutex::new(()),
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            last_minute: Mutex::new(None),
        })
    }

    /// Register and activate a task. `expr` is used verbatim for
    /// `TaskKind::Cron` and converted from a daily time for
    /// `TaskKind::Daily`; either way it must parse or registration fails.
    pub fn register_task(
        self: &Arc<Self>,
        owner: impl Into<String>,
        kind: TaskKind,
        expr: &str,
        callback: TaskFn,
        key: impl Into<String>,
    ) -> Result<Arc<ScheduledTask>, ScheduleError> {
        let cron_text = match kind {
            TaskKind::Cron => expr.to_string(),
            TaskKind::Daily => parse_daily_time(expr)?,
        };
        let cron = CronExpr::parse(&cron_text)?;
        let owner = owner.into();
        let key = key.into();

        let task = Arc::new(ScheduledTask {
            kind,
            key,
            owner: owner.clone(),
            raw: Mutex::new(expr.to_string()),
            cron: Mutex::new(cron),
            callback,
            entry: Mutex::new(None),
            scheduler: Arc::downgrade(self),
        });
        task.on()?;
        info!("extension '{}' registered task: {}={}", owner, kind.as_str(), expr);
        Ok(task)
    }

    fn add_entry(&self, task: Arc<ScheduledTask>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((id, task));
        }
        id
    }

    fn remove_entry(&self, id: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(eid, _)| *eid != id);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Fire every entry matching the given minute. Each minute fires at most
    /// once regardless of tick frequency; a missed minute is not replayed.
    pub fn tick(&self, now: DateTime<Local>) {
        let minute_index = now.timestamp() / 60;
        {
            let Ok(mut last) = self.last_minute.lock() else {
                return;
            };
            if *last == Some(minute_index) {
                return;
            }
            *last = Some(minute_index);
        }
        let due: Vec<Arc<ScheduledTask>> = self
            .entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, t)| t.cron_matches(&now))
                    .map(|(_, t)| t.clone())
                    .collect()
            })
            .unwrap_or_default();
        for task in due {
            task.run();
        }
    }

    /// Drive the scheduler on wall-clock time until the host shuts down
    pub async fn run_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(20));
        loop {
            interval.tick().await;
            self.tick(Local::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 4, hour, minute, 0).unwrap()
    }

    #[test]
    fn daily_time_conversion() {
        assert_eq!(parse_daily_time("9:05").unwrap(), "5 9 * * *");
        assert_eq!(parse_daily_time("13:30").unwrap(), "30 13 * * *");
        assert_eq!(parse_daily_time("0:05").unwrap(), "5 0 * * *");
    }

    #[test]
    fn daily_time_rejects_out_of_range() {
        assert!(matches!(
            parse_daily_time("24:00"),
            Err(ScheduleError::InvalidDailyTime(_))
        ));
        assert!(parse_daily_time("9:60").is_err());
        assert!(parse_daily_time("not a time").is_err());
        assert!(parse_daily_time("9").is_err());
    }

    #[test]
    fn cron_expression_matching() {
        let expr = CronExpr::parse("5 9 * * *").unwrap();
        assert!(expr.matches(&at(9, 5)));
        assert!(!expr.matches(&at(9, 6)));
        assert!(!expr.matches(&at(10, 5)));

        let every_fifteen = CronExpr::parse("*/15 * * * *").unwrap();
        assert!(every_fifteen.matches(&at(3, 0)));
        assert!(every_fifteen.matches(&at(3, 45)));
        assert!(!every_fifteen.matches(&at(3, 20)));

        let range = CronExpr::parse("0 9-17 * * *").unwrap();
        assert!(range.matches(&at(12, 0)));
        assert!(!range.matches(&at(18, 0)));
    }

    #[test]
    fn cron_rejects_malformed_expressions() {
        assert!(CronExpr::parse("5 9 * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("a b c d e").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
    }

    #[test]
    fn register_rejects_bad_daily_expression() {
        let scheduler = TaskScheduler::new();
        let result = scheduler.register_task(
            "story",
            TaskKind::Daily,
            "25:00",
            Arc::new(|_| {}),
            "",
        );
        assert!(result.is_err());
        assert_eq!(scheduler.entry_count(), 0);
    }

    #[test]
    fn on_off_are_idempotent() {
        let scheduler = TaskScheduler::new();
        let task = scheduler
            .register_task("story", TaskKind::Cron, "0 0 * * *", Arc::new(|_| {}), "")
            .unwrap();
        assert_eq!(scheduler.entry_count(), 1);
        assert!(task.on().is_ok());
        assert_eq!(scheduler.entry_count(), 1, "double on adds nothing");
        assert!(task.off().is_ok());
        assert!(task.off().is_ok());
        assert_eq!(scheduler.entry_count(), 0);
    }

    #[test]
    fn task_outliving_its_scheduler_reports_gone() {
        let scheduler = TaskScheduler::new();
        let task = scheduler
            .register_task("story", TaskKind::Cron, "0 0 * * *", Arc::new(|_| {}), "")
            .unwrap();
        assert!(task.off().is_ok());
        drop(scheduler);

        assert!(matches!(task.on(), Err(ScheduleError::SchedulerGone)));
        assert!(matches!(task.off(), Err(ScheduleError::SchedulerGone)));
    }

    #[test]
    fn tick_fires_due_tasks_once_per_minute() {
        let scheduler = TaskScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        scheduler
            .register_task(
                "story",
                TaskKind::Daily,
                "9:05",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                "",
            )
            .unwrap();

        scheduler.tick(at(9, 5));
        scheduler.tick(at(9, 5)); // same minute, deduped
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        scheduler.tick(at(9, 6));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_stays_registered() {
        let scheduler = TaskScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = scheduler
            .register_task(
                "story",
                TaskKind::Cron,
                "* * * * *",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("task exploded");
                }),
                "",
            )
            .unwrap();

        scheduler.tick(at(1, 0));
        scheduler.tick(at(1, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 2, "fired again after panic");
        assert!(task.is_on());
    }

    #[test]
    fn task_context_carries_key() {
        let scheduler = TaskScheduler::new();
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        scheduler
            .register_task(
                "story",
                TaskKind::Cron,
                "* * * * *",
                Arc::new(move |ctx: &TaskContext| {
                    if let Ok(mut s) = sink.lock() {
                        *s = ctx.key.clone();
                    }
                }),
                "story.daily-summary",
            )
            .unwrap();
        scheduler.tick(at(2, 0));
        assert_eq!(*seen.lock().unwrap(), "story.daily-summary");
    }

    #[test]
    fn reset_swaps_expression_and_restores_state() {
        let scheduler = TaskScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = scheduler
            .register_task(
                "story",
                TaskKind::Daily,
                "9:05",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                "k",
            )
            .unwrap();

        task.reset("10:15").unwrap();
        assert!(task.is_on());
        scheduler.tick(at(9, 5));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "old time no longer fires");
        scheduler.tick(at(10, 15));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(task.reset("nonsense").is_err());
        assert_eq!(task.raw_expr(), "10:15", "failed reset leaves expression");
    }
}
