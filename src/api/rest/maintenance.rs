use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use diesel::ExpressionMethods;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::RunQueryDsl;
use log::info;
use serde::Deserialize;

use crate::api::rest;
use crate::db::models::{
    Maintenance, MaintenanceKind, MaintenanceSchedule, MaintenanceStatus, NewMaintenance,
    NewMaintenanceSchedule, UpdateMaintenanceSchedule,
};
use crate::service::maintenance::schedule_next_run;

#[axum::debug_handler]
pub async fn list_maintenances(
    State(api_config): State<rest::RestApiConfig>,
) -> Result<Json<Vec<Maintenance>>, rest::error::ApiError> {
    use crate::db::schema::maintenance::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = maintenance
        .order(id.desc())
        .select(Maintenance::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMaintenancePayload {
    pub kind: MaintenanceKind,
    #[serde(default)]
    pub backup_database: bool,
    #[serde(default)]
    pub backup_filestorage: bool,
    pub filepath: Option<String>,
}

#[axum::debug_handler]
pub async fn create_maintenance(
    State(api_config): State<rest::RestApiConfig>,
    Json(payload): Json<NewMaintenancePayload>,
) -> Result<(StatusCode, Json<Maintenance>), rest::error::ApiError> {
    use crate::db::schema::maintenance::dsl as maintenance_dsl;

    if MaintenanceKind::Restore == payload.kind && payload.filepath.is_none() {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "restore requires a filepath".to_string(),
        ));
    }
    if MaintenanceKind::Backup == payload.kind
        && !payload.backup_database
        && !payload.backup_filestorage
    {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "backup requires at least one of backup_database, backup_filestorage".to_string(),
        ));
    }

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let new_row = NewMaintenance {
        kind: payload.kind,
        status: MaintenanceStatus::Pending,
        filepath: payload.filepath,
        backup_database: payload.backup_database,
        backup_filestorage: payload.backup_filestorage,
        scheduled_backup: false,
        maintenance_schedule: None,
        created_at: Utc::now().naive_utc(),
    };

    let created: Maintenance = diesel::insert_into(maintenance_dsl::maintenance)
        .values(&new_row)
        .returning(Maintenance::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn transition_maintenance(
    api_config: &rest::RestApiConfig,
    path_id: i32,
    next_status: MaintenanceStatus,
    filepath: Option<String>,
) -> Result<Maintenance, rest::error::ApiError> {
    use crate::db::schema::maintenance::dsl as maintenance_dsl;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let current: Maintenance = match maintenance_dsl::maintenance
        .filter(maintenance_dsl::id.eq(path_id))
        .select(Maintenance::as_select())
        .first(&mut conn)
        .await
    {
        Ok(row) => row,
        Err(diesel::result::Error::NotFound) => {
            return Err(rest::error::client_error(
                StatusCode::NOT_FOUND,
                format!("maintenance {} not found", path_id),
            ));
        }
        Err(e) => return Err(rest::error::internal_error(e)),
    };

    if !current.status.can_transition_to(next_status) {
        return Err(rest::error::client_error(
            StatusCode::CONFLICT,
            format!(
                "maintenance {} cannot transition from {:?} to {:?}",
                path_id, current.status, next_status
            ),
        ));
    }

    let finished_at = match next_status {
        MaintenanceStatus::Success | MaintenanceStatus::Failed => Some(Utc::now().naive_utc()),
        _ => None,
    };

    let updated: Maintenance = diesel::update(maintenance_dsl::maintenance.find(path_id))
        .set((
            maintenance_dsl::status.eq(next_status),
            maintenance_dsl::filepath.eq(filepath.or(current.filepath)),
            maintenance_dsl::finished_at.eq(finished_at),
        ))
        .returning(Maintenance::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    info!("Maintenance {} is now {:?}", updated.id, updated.status);

    Ok(updated)
}

/// pending -> inProgress; maintenance mode is enabled while any job is in
/// progress.
#[axum::debug_handler]
pub async fn start_maintenance(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<Maintenance>, rest::error::ApiError> {
    let updated =
        transition_maintenance(&api_config, path_id, MaintenanceStatus::InProgress, None).await?;
    Ok(Json(updated))
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinishMaintenancePayload {
    pub status: MaintenanceStatus,
    pub filepath: Option<String>,
}

/// inProgress -> success|failed.
#[axum::debug_handler]
pub async fn finish_maintenance(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
    Json(payload): Json<FinishMaintenancePayload>,
) -> Result<Json<Maintenance>, rest::error::ApiError> {
    if !matches!(
        payload.status,
        MaintenanceStatus::Success | MaintenanceStatus::Failed
    ) {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "finish status must be success or failed".to_string(),
        ));
    }

    let updated =
        transition_maintenance(&api_config, path_id, payload.status, payload.filepath).await?;
    Ok(Json(updated))
}

#[axum::debug_handler]
pub async fn list_maintenance_schedules(
    State(api_config): State<rest::RestApiConfig>,
) -> Result<Json<Vec<MaintenanceSchedule>>, rest::error::ApiError> {
    use crate::db::schema::maintenance_schedule::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = maintenance_schedule
        .select(MaintenanceSchedule::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

fn validate_schedule_fields(
    day_of_month: i32,
    day_of_week: i32,
    hour: i32,
    minute: i32,
) -> Result<(), rest::error::ApiError> {
    let valid = (day_of_month == -1 || (1..=31).contains(&day_of_month))
        && (day_of_week == -1 || (1..=7).contains(&day_of_week))
        && (hour == -1 || (0..24).contains(&hour))
        && (minute == -1 || (0..60).contains(&minute));

    if !valid {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "invalid schedule fields (use -1 for any)".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMaintenanceSchedulePayload {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub backup_database: bool,
    #[serde(default)]
    pub backup_filestorage: bool,
    #[serde(default = "default_any")]
    pub day_of_month: i32,
    #[serde(default = "default_any")]
    pub day_of_week: i32,
    #[serde(default = "default_any")]
    pub hour: i32,
    #[serde(default = "default_any")]
    pub minute: i32,
}

fn default_enabled() -> bool {
    true
}

fn default_any() -> i32 {
    -1
}

#[axum::debug_handler]
pub async fn create_maintenance_schedule(
    State(api_config): State<rest::RestApiConfig>,
    Json(payload): Json<NewMaintenanceSchedulePayload>,
) -> Result<(StatusCode, Json<MaintenanceSchedule>), rest::error::ApiError> {
    use crate::db::schema::maintenance_schedule::dsl as schedule_dsl;

    if payload.name.trim().is_empty() {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "name cannot be empty".to_string(),
        ));
    }
    validate_schedule_fields(
        payload.day_of_month,
        payload.day_of_week,
        payload.hour,
        payload.minute,
    )?;

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let mut new_row = NewMaintenanceSchedule {
        name: payload.name.trim().to_string(),
        enabled: payload.enabled,
        backup_database: payload.backup_database,
        backup_filestorage: payload.backup_filestorage,
        day_of_month: payload.day_of_month,
        day_of_week: payload.day_of_week,
        hour: payload.hour,
        minute: payload.minute,
        next_job_at: None,
    };
    if new_row.enabled {
        new_row.next_job_at = next_run_for_fields(
            new_row.day_of_month,
            new_row.day_of_week,
            new_row.hour,
            new_row.minute,
        );
    }

    let created: MaintenanceSchedule = diesel::insert_into(schedule_dsl::maintenance_schedule)
        .values(&new_row)
        .returning(MaintenanceSchedule::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok((StatusCode::CREATED, Json(created)))
}

fn next_run_for_fields(
    day_of_month: i32,
    day_of_week: i32,
    hour: i32,
    minute: i32,
) -> Option<chrono::NaiveDateTime> {
    crate::service::maintenance::next_run_after(
        day_of_month,
        day_of_week,
        hour,
        minute,
        Utc::now().naive_utc(),
    )
}

#[axum::debug_handler]
pub async fn get_maintenance_schedule(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<MaintenanceSchedule>, rest::error::ApiError> {
    use crate::db::schema::maintenance_schedule::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    match maintenance_schedule
        .select(MaintenanceSchedule::as_select())
        .filter(id.eq(path_id))
        .first(&mut conn)
        .await
    {
        Ok(row) => Ok(Json(row)),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("maintenance schedule {} not found", path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn update_maintenance_schedule(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
    Json(payload): Json<UpdateMaintenanceSchedule>,
) -> Result<Json<MaintenanceSchedule>, rest::error::ApiError> {
    use crate::db::schema::maintenance_schedule::dsl as schedule_dsl;

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let updated: MaintenanceSchedule =
        match diesel::update(schedule_dsl::maintenance_schedule.find(path_id))
            .set(&payload)
            .returning(MaintenanceSchedule::as_returning())
            .get_result(&mut conn)
            .await
        {
            Ok(row) => row,
            Err(diesel::result::Error::NotFound) => {
                return Err(rest::error::client_error(
                    StatusCode::NOT_FOUND,
                    format!("maintenance schedule {} not found", path_id),
                ));
            }
            Err(e) => return Err(rest::error::internal_error(e)),
        };

    validate_schedule_fields(
        updated.day_of_month,
        updated.day_of_week,
        updated.hour,
        updated.minute,
    )?;

    // Timing fields changed; the next slot has to be recomputed.
    let next_job_at = if updated.enabled {
        schedule_next_run(&updated, Utc::now().naive_utc())
    } else {
        None
    };
    let updated: MaintenanceSchedule =
        diesel::update(schedule_dsl::maintenance_schedule.find(path_id))
            .set(schedule_dsl::next_job_at.eq(next_job_at))
            .returning(MaintenanceSchedule::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(rest::error::internal_error)?;

    Ok(Json(updated))
}

#[axum::debug_handler]
pub async fn delete_maintenance_schedule(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<MaintenanceSchedule>, rest::error::ApiError> {
    use crate::db::schema::maintenance_schedule::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let deleted: Result<MaintenanceSchedule, diesel::result::Error> =
        diesel::delete(maintenance_schedule.filter(id.eq(path_id)))
            .returning(MaintenanceSchedule::as_returning())
            .get_result(&mut conn)
            .await;

    match deleted {
        Ok(row) => Ok(Json(row)),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("maintenance schedule {} not found", path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}
