use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Utc};
use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::RunQueryDsl;
use log::{debug, error, info};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::db::models::{
    Maintenance, MaintenanceKind, MaintenanceSchedule, MaintenanceStatus, NewMaintenance,
};

/// Maintenance mode is derived state: enabled exactly while a maintenance
/// job is in progress.
pub async fn maintenance_mode_enabled(
    conn: &mut diesel_async::AsyncPgConnection,
) -> Result<bool, diesel::result::Error> {
    use crate::db::schema::maintenance::dsl::*;

    let in_progress = maintenance.filter(status.eq(MaintenanceStatus::InProgress));
    diesel::select(diesel::dsl::exists(in_progress))
        .get_result(conn)
        .await
}

/// Next run strictly after `after` for cron-like schedule fields, each `-1`
/// meaning "any". `day_of_week` is ISO: 1 = Monday .. 7 = Sunday. Returns
/// `None` when the fields can never match (e.g. day_of_month = 31 in a
/// schedule pinned to February would still match eventually, but nonsense
/// values like 32 never do).
pub fn next_run_after(
    day_of_month: i32,
    day_of_week: i32,
    hour: i32,
    minute: i32,
    after: NaiveDateTime,
) -> Option<NaiveDateTime> {
    // 366 days covers every dayOfMonth/dayOfWeek combination that can match.
    for day_offset in 0..=366i64 {
        let date = after.date() + chrono::Duration::days(day_offset);

        if day_of_month != -1 && date.day() as i32 != day_of_month {
            continue;
        }
        if day_of_week != -1 && date.weekday().number_from_monday() as i32 != day_of_week {
            continue;
        }

        let hours: Vec<u32> = if hour == -1 {
            (0..24).collect()
        } else if (0..24).contains(&hour) {
            vec![hour as u32]
        } else {
            return None;
        };
        let minutes: Vec<u32> = if minute == -1 {
            (0..60).collect()
        } else if (0..60).contains(&minute) {
            vec![minute as u32]
        } else {
            return None;
        };

        for candidate_hour in &hours {
            for candidate_minute in &minutes {
                let time = NaiveTime::from_hms_opt(*candidate_hour, *candidate_minute, 0)?;
                let candidate = NaiveDateTime::new(date, time);
                if candidate > after {
                    return Some(candidate);
                }
            }
        }
    }

    None
}

pub fn schedule_next_run(schedule: &MaintenanceSchedule, after: NaiveDateTime) -> Option<NaiveDateTime> {
    next_run_after(
        schedule.day_of_month,
        schedule.day_of_week,
        schedule.hour,
        schedule.minute,
        after,
    )
}

/// Background ticker promoting due schedules into pending scheduled-backup
/// maintenance jobs.
pub struct MaintenanceScheduler {
    shared_pool: Arc<crate::DbPool>,
    joiner: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl MaintenanceScheduler {
    pub fn new(shared_pool: Arc<crate::DbPool>) -> Self {
        MaintenanceScheduler {
            shared_pool,
            joiner: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn start(&mut self) {
        let pool = self.shared_pool.clone();
        let cancel = self.cancel.clone();
        self.joiner = Some(tokio::spawn(async move {
            scheduler_loop(pool, cancel).await;
        }));
        info!("Maintenance scheduler started");
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.joiner.take() {
            let _ = handle.await;
        }
    }
}

async fn scheduler_loop(pool: Arc<crate::DbPool>, cancellation_token: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        select! {
            _ = ticker.tick() => {
                if let Err(e) = promote_due_schedules(&pool).await {
                    error!("Maintenance scheduler tick failed: {e}");
                }
            }
            _ = cancellation_token.cancelled() => {
                debug!("Maintenance scheduler received shutdown; exiting");
                break;
            }
        }
    }
}

async fn promote_due_schedules(
    pool: &crate::DbPool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use crate::db::schema::maintenance::dsl as maintenance_dsl;
    use crate::db::schema::maintenance_schedule::dsl as schedule_dsl;

    let mut conn = pool.get().await?;
    let now = Utc::now().naive_utc();

    let schedules: Vec<MaintenanceSchedule> = schedule_dsl::maintenance_schedule
        .filter(schedule_dsl::enabled.eq(true))
        .select(MaintenanceSchedule::as_select())
        .load(&mut conn)
        .await?;

    for schedule in schedules {
        match schedule.next_job_at {
            None => {
                // Newly enabled schedule without a computed slot yet.
                let next = schedule_next_run(&schedule, now);
                diesel::update(schedule_dsl::maintenance_schedule.find(schedule.id))
                    .set(schedule_dsl::next_job_at.eq(next))
                    .execute(&mut conn)
                    .await?;
            }
            Some(next_job_at) if next_job_at <= now => {
                let new_maintenance = NewMaintenance {
                    kind: MaintenanceKind::Backup,
                    status: MaintenanceStatus::Pending,
                    filepath: None,
                    backup_database: schedule.backup_database,
                    backup_filestorage: schedule.backup_filestorage,
                    scheduled_backup: true,
                    maintenance_schedule: Some(schedule.id),
                    created_at: now,
                };
                let created: Option<Maintenance> = diesel::insert_into(maintenance_dsl::maintenance)
                    .values(&new_maintenance)
                    .returning(Maintenance::as_returning())
                    .get_result(&mut conn)
                    .await
                    .optional()?;

                if let Some(created) = created {
                    info!(
                        "Scheduled backup {} created from schedule '{}'",
                        created.id, schedule.name
                    );
                }

                let next = schedule_next_run(&schedule, now);
                diesel::update(schedule_dsl::maintenance_schedule.find(schedule.id))
                    .set(schedule_dsl::next_job_at.eq(next))
                    .execute(&mut conn)
                    .await?;
            }
            Some(_) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .expect("valid date")
            .and_hms_opt(h, min, 0)
            .expect("valid time")
    }

    #[test]
    fn all_wildcards_run_next_minute() {
        let after = at(2025, 3, 10, 12, 30);
        assert_eq!(
            next_run_after(-1, -1, -1, -1, after),
            Some(at(2025, 3, 10, 12, 31))
        );
    }

    #[test]
    fn fixed_time_rolls_to_next_day_when_passed() {
        let after = at(2025, 3, 10, 12, 30);
        assert_eq!(
            next_run_after(-1, -1, 3, 0, after),
            Some(at(2025, 3, 11, 3, 0))
        );
        assert_eq!(
            next_run_after(-1, -1, 13, 15, after),
            Some(at(2025, 3, 10, 13, 15))
        );
    }

    #[test]
    fn day_of_week_is_iso_monday_based() {
        // 2025-03-10 is a Monday.
        let after = at(2025, 3, 10, 12, 0);
        assert_eq!(
            next_run_after(-1, 7, 2, 0, after),
            Some(at(2025, 3, 16, 2, 0))
        );
        assert_eq!(
            next_run_after(-1, 1, 2, 0, after),
            Some(at(2025, 3, 17, 2, 0))
        );
    }

    #[test]
    fn day_of_month_waits_for_matching_date() {
        let after = at(2025, 3, 10, 12, 0);
        assert_eq!(
            next_run_after(31, -1, 4, 30, after),
            Some(at(2025, 3, 31, 4, 30))
        );
        // February is skipped for day 31; next match is in March.
        let after = at(2025, 1, 31, 5, 0);
        assert_eq!(
            next_run_after(31, -1, 4, 30, after),
            Some(at(2025, 3, 31, 4, 30))
        );
    }

    #[test]
    fn nonsense_fields_never_match() {
        let after = at(2025, 3, 10, 12, 0);
        assert_eq!(next_run_after(-1, -1, 25, 0, after), None);
        assert_eq!(next_run_after(-1, -1, -1, 61, after), None);
        assert_eq!(next_run_after(32, -1, 4, 0, after), None);
    }
}
