use crate::api::device::auth::sha256_hex;
use crate::api::rest;
use crate::db::models::{Device, DeviceFailedLoginAttempt, NewDevice, UpdateDevice};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use diesel::ExpressionMethods;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel::result::DatabaseErrorKind;
use diesel_async::RunQueryDsl;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewDevicePayload {
    pub name: String,
    pub device_type: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub password: Option<String>,
    pub certificate_subject: Option<String>,
    pub serial_number: Option<String>,
    pub config: Option<String>,
    pub vpn_ip: Option<String>,
    pub virtual_ip: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdateDevicePayload {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub password: Option<String>,
    pub certificate_subject: Option<String>,
    pub serial_number: Option<String>,
    pub config: Option<String>,
    pub vpn_ip: Option<String>,
    pub virtual_ip: Option<String>,
}

fn validate_name(name: &str) -> Result<(), rest::error::ApiError> {
    if name.is_empty() {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "name cannot be empty".to_string(),
        ));
    }
    if name.len() > 100 {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "name too long (max 100)".to_string(),
        ));
    }
    Ok(())
}

#[axum::debug_handler]
pub async fn list_devices(
    State(api_config): State<rest::RestApiConfig>,
) -> Result<Json<Vec<Device>>, rest::error::ApiError> {
    use crate::db::schema::device::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = device
        .select(Device::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

#[axum::debug_handler]
pub async fn create_device(
    State(api_config): State<rest::RestApiConfig>,
    Json(payload): Json<NewDevicePayload>,
) -> Result<(StatusCode, Json<Device>), rest::error::ApiError> {
    use crate::db::schema::device::dsl as device_dsl;

    let name_trimmed = payload.name.trim().to_string();
    validate_name(&name_trimmed)?;

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let new_row = NewDevice {
        name: name_trimmed,
        uuid: None,
        device_type: payload.device_type,
        enabled: payload.enabled,
        password_hash: payload.password.as_deref().map(sha256_hex),
        certificate_subject: payload.certificate_subject,
        serial_number: payload.serial_number,
        config: payload.config,
        vpn_ip: payload.vpn_ip,
        virtual_ip: payload.virtual_ip,
    };

    match diesel::insert_into(device_dsl::device)
        .values(&new_row)
        .returning(Device::as_returning())
        .get_result(&mut conn)
        .await
    {
        Ok(created) => {
            // Keep the distributed-config checksum alongside the config.
            if created.config.is_some() {
                let checksum = created.config.as_deref().map(sha256_hex);
                let updated = diesel::update(device_dsl::device.find(created.id))
                    .set(device_dsl::config_checksum.eq(checksum))
                    .returning(Device::as_returning())
                    .get_result(&mut conn)
                    .await
                    .map_err(rest::error::internal_error)?;
                return Ok((StatusCode::CREATED, Json(updated)));
            }
            Ok((StatusCode::CREATED, Json(created)))
        }
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info)) => {
            match info.constraint_name() {
                Some("device_device_type_fkey") => Err(rest::error::client_error(
                    StatusCode::BAD_REQUEST,
                    "unknown device type".to_string(),
                )),
                _ => {
                    let error = diesel::result::Error::DatabaseError(
                        DatabaseErrorKind::ForeignKeyViolation,
                        info,
                    );
                    Err(rest::error::internal_error(error))
                }
            }
        }
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::CONFLICT,
                "Device already exists".to_string(),
            ))
        }
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn get_device(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<Device>, rest::error::ApiError> {
    use crate::db::schema::device::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = match device
        .select(Device::as_select())
        .filter(id.eq(path_id))
        .first(&mut conn)
        .await
    {
        Ok(row) => row,
        Err(diesel::result::Error::NotFound) => {
            return Err(rest::error::client_error(
                StatusCode::NOT_FOUND,
                format!("device {} not found", path_id),
            ));
        }
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    Ok(Json(result))
}

#[axum::debug_handler]
pub async fn update_device(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
    Json(payload): Json<UpdateDevicePayload>,
) -> Result<Json<Device>, rest::error::ApiError> {
    use crate::db::schema::device::dsl as device_dsl;

    if let Some(name) = &payload.name {
        validate_name(name.trim())?;
    }

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let config_checksum = payload.config.as_deref().map(sha256_hex);
    let changes = UpdateDevice {
        name: payload.name.map(|name| name.trim().to_string()),
        enabled: payload.enabled,
        password_hash: payload.password.as_deref().map(|p| Some(sha256_hex(p))),
        certificate_subject: payload.certificate_subject.map(Some),
        serial_number: payload.serial_number.map(Some),
        config: payload.config.map(Some),
        config_checksum: config_checksum.map(Some),
        vpn_ip: payload.vpn_ip.map(Some),
        virtual_ip: payload.virtual_ip.map(Some),
        ..UpdateDevice::default()
    };

    match diesel::update(device_dsl::device.find(path_id))
        .set(&changes)
        .returning(Device::as_returning())
        .get_result(&mut conn)
        .await
    {
        Ok(updated) => Ok(Json(updated)),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::CONFLICT,
                "Device already exists".to_string(),
            ))
        }
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("device {} not found", path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn list_failed_login_attempts(
    State(api_config): State<rest::RestApiConfig>,
) -> Result<Json<Vec<DeviceFailedLoginAttempt>>, rest::error::ApiError> {
    use crate::db::schema::device_failed_login_attempt::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = device_failed_login_attempt
        .order(created_at.desc())
        .select(DeviceFailedLoginAttempt::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

#[axum::debug_handler]
pub async fn delete_device(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<Device>, rest::error::ApiError> {
    use crate::db::schema::device::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let deleted: Result<Device, diesel::result::Error> =
        diesel::delete(device.filter(id.eq(path_id)))
            .returning(Device::as_returning())
            .get_result(&mut conn)
            .await;

    match deleted {
        Ok(row) => Ok(Json(row)),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("device {} not found", path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}
