//! Cron-style background jobs: the weekly pool import and the daily
//! days-remaining recompute with auto-renewal.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc, Weekday};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ScheduleSettings;
use crate::error::{CertError, Result};
use crate::events::trigger;
use crate::orchestrator::CertificateManager;
use crate::types::CertStore;

/// Daily renewal sweep fires at 01:00 UTC.
const DAILY_HOUR: u32 = 1;
const DAILY_MINUTE: u32 = 0;

/// Spawned cron jobs; hold the handles until shutdown.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the weekly import task and the daily renewal task. Both
    /// wake on the shutdown flag and exit promptly.
    pub fn start(
        manager: CertificateManager,
        settings: &ScheduleSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let weekday = parse_weekday(&settings.weekly_day)?;
        let (hour, minute) = (settings.weekly_hour, settings.weekly_minute);

        let weekly_manager = manager.clone();
        let weekly_shutdown = shutdown.clone();
        let weekly = tokio::spawn(async move {
            run_cron(weekly_shutdown, move |now| next_weekly(now, weekday, hour, minute), move || {
                let manager = weekly_manager.clone();
                async move {
                    for store in [CertStore::Websites, CertStore::Apis] {
                        match manager.import_store(store, trigger::SCHEDULED).await {
                            Ok(report) => tracing::info!(
                                "Weekly import: store={store}, processed={}, failed={}",
                                report.processed,
                                report.failed
                            ),
                            Err(e) => tracing::error!("Weekly import failed: store={store}, error={e}"),
                        }
                    }
                }
            })
            .await;
        });

        let daily = tokio::spawn(async move {
            run_cron(shutdown, |now| next_daily(now, DAILY_HOUR, DAILY_MINUTE), move || {
                let manager = manager.clone();
                async move {
                    match manager.renew_expiring().await {
                        Ok(report) => tracing::info!(
                            "Daily renewal sweep: updated={}/{}, renewed={}, failed={}, skipped={}",
                            report.updated,
                            report.total,
                            report.renewed,
                            report.failed,
                            report.skipped
                        ),
                        Err(e) => tracing::error!("Daily renewal sweep failed: {e}"),
                    }
                }
            })
            .await;
        });

        tracing::info!(
            "Scheduler started: weekly import {} {:02}:{:02} UTC, daily renewal {DAILY_HOUR:02}:{DAILY_MINUTE:02} UTC",
            settings.weekly_day,
            hour,
            minute
        );
        Ok(Self {
            handles: vec![weekly, daily],
        })
    }

    /// Wait for both loops to observe shutdown.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Sleep-run loop shared by both jobs.
async fn run_cron<NextFn, JobFn, Fut>(
    mut shutdown: watch::Receiver<bool>,
    next_fire: NextFn,
    job: JobFn,
) where
    NextFn: Fn(DateTime<Utc>) -> DateTime<Utc>,
    JobFn: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let now = Utc::now();
        let fire_at = next_fire(now);
        let wait = (fire_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tracing::debug!("Next cron fire at {fire_at}");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                job().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

pub fn parse_weekday(day: &str) -> Result<Weekday> {
    match day.to_lowercase().as_str() {
        "mon" => Ok(Weekday::Mon),
        "tue" => Ok(Weekday::Tue),
        "wed" => Ok(Weekday::Wed),
        "thu" => Ok(Weekday::Thu),
        "fri" => Ok(Weekday::Fri),
        "sat" => Ok(Weekday::Sat),
        "sun" => Ok(Weekday::Sun),
        other => Err(CertError::configuration(format!(
            "weekly_day must be mon..sun, got '{other}'"
        ))),
    }
}

/// Next instant strictly after `now` matching the weekday, hour and
/// minute.
pub fn next_weekly(now: DateTime<Utc>, weekday: Weekday, hour: u32, minute: u32) -> DateTime<Utc> {
    let today_fire = at_time(now, hour, minute);
    let days_ahead =
        (7 + weekday.num_days_from_monday() - now.weekday().num_days_from_monday()) % 7;

    if days_ahead == 0 && today_fire > now {
        today_fire
    } else {
        let days = if days_ahead == 0 { 7 } else { days_ahead };
        at_time(now + ChronoDuration::days(days as i64), hour, minute)
    }
}

/// Next instant strictly after `now` matching the hour and minute.
pub fn next_daily(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let today_fire = at_time(now, hour, minute);
    if today_fire > now {
        today_fire
    } else {
        at_time(now + ChronoDuration::days(1), hour, minute)
    }
}

fn at_time(day: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(day.year(), day.month(), day.day(), hour, minute, 0)
        .single()
        .expect("hour/minute validated by config")
}
