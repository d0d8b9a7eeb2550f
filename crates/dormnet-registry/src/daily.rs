//! Daily maintenance at a fixed local time

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Runs due within this margin are pushed to the following day
fn min_lead() -> chrono::Duration {
    chrono::Duration::seconds(10)
}

/// Next occurrence of the wall-clock time `at` after `now`
pub fn next_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    // Skipped local times (DST gaps) move on to the next day.
    for _ in 0..3 {
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest() {
            if now.clone() + min_lead() < candidate {
                return candidate;
            }
        }
        day = match day.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    now.clone() + chrono::Duration::days(1)
}

/// Run `task` every day at local time `at` on the blocking pool
pub fn spawn_daily(name: &'static str, at: NaiveTime, task: Arc<dyn Fn() + Send + Sync>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let due = next_run(&now, at);
            info!(task = name, due = %due, "daily task scheduled");
            let delay = (due - now).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;

            let task = task.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                error!(task = name, "daily task failed: {}", e);
            }
        }
    })
}
