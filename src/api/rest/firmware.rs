use crate::api::rest;
use crate::db::models::{Firmware, NewFirmware};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use diesel::ExpressionMethods;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel::result::DatabaseErrorKind;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewFirmwarePayload {
    pub device_type: i32,
    pub filename: String,
    pub version: String,
}

#[axum::debug_handler]
pub async fn create_firmware(
    State(api_config): State<rest::RestApiConfig>,
    Json(payload): Json<NewFirmwarePayload>,
) -> Result<(StatusCode, Json<Firmware>), rest::error::ApiError> {
    use crate::db::schema::firmware::dsl as firmware_dsl;

    if payload.filename.trim().is_empty() || payload.filename.contains('/') {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "filename cannot be empty or contain '/'".to_string(),
        ));
    }
    if payload.version.trim().is_empty() {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "version cannot be empty".to_string(),
        ));
    }

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let new_row = NewFirmware {
        device_type: payload.device_type,
        uuid: Uuid::new_v4().to_string(),
        filename: payload.filename.trim().to_string(),
        version: payload.version.trim().to_string(),
    };

    match diesel::insert_into(firmware_dsl::firmware)
        .values(&new_row)
        .returning(Firmware::as_returning())
        .get_result(&mut conn)
        .await
    {
        Ok(created) => Ok((StatusCode::CREATED, Json(created))),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::BAD_REQUEST,
                "unknown device type".to_string(),
            ))
        }
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn list_firmwares(
    State(api_config): State<rest::RestApiConfig>,
) -> Result<Json<Vec<Firmware>>, rest::error::ApiError> {
    use crate::db::schema::firmware::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = firmware
        .select(Firmware::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

#[axum::debug_handler]
pub async fn get_firmware(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<Firmware>, rest::error::ApiError> {
    use crate::db::schema::firmware::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    match firmware
        .select(Firmware::as_select())
        .filter(id.eq(path_id))
        .first(&mut conn)
        .await
    {
        Ok(row) => Ok(Json(row)),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("firmware {} not found", path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn delete_firmware(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<Firmware>, rest::error::ApiError> {
    use crate::db::schema::firmware::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let deleted: Result<Firmware, diesel::result::Error> =
        diesel::delete(firmware.filter(id.eq(path_id)))
            .returning(Firmware::as_returning())
            .get_result(&mut conn)
            .await;

    match deleted {
        Ok(row) => Ok(Json(row)),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("firmware {} not found", path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}
