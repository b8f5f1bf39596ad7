use crate::api::rest;
use crate::db::models::{
    DeviceType, DeviceTypeSecret, NewDeviceType, NewDeviceTypeSecret, UpdateDeviceType,
};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use diesel::ExpressionMethods;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel::result::DatabaseErrorKind;
use diesel_async::RunQueryDsl;

fn validate_slug(slug: &str) -> Result<(), rest::error::ApiError> {
    if slug.is_empty() || slug.len() > 100 {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "slug must be between 1 and 100 characters".to_string(),
        ));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "slug may only contain alphanumerics, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

#[axum::debug_handler]
pub async fn create_device_type(
    State(api_config): State<rest::RestApiConfig>,
    Json(payload): Json<NewDeviceType>,
) -> Result<(StatusCode, Json<DeviceType>), rest::error::ApiError> {
    use crate::db::schema::device_type::dsl::*;
    // Basic validation
    let name_trimmed = payload.name.trim();
    if name_trimmed.is_empty() {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "name cannot be empty".to_string(),
        ));
    }
    if name_trimmed.len() > 100 {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "name too long (max 100)".to_string(),
        ));
    }
    validate_slug(&payload.slug)?;

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let new_row = NewDeviceType {
        name: name_trimmed.to_string(),
        ..payload
    };

    let result: Result<DeviceType, diesel::result::Error> = diesel::insert_into(device_type)
        .values(&new_row)
        .returning(DeviceType::as_returning())
        .get_result(&mut conn)
        .await;

    match result {
        Ok(created) => Ok((StatusCode::CREATED, Json(created))),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::CONFLICT,
                format!("device type '{}' already exists", new_row.name),
            ))
        }
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn list_device_types(
    State(api_config): State<rest::RestApiConfig>,
) -> Result<Json<Vec<DeviceType>>, rest::error::ApiError> {
    use crate::db::schema::device_type::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = device_type
        .select(DeviceType::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

#[axum::debug_handler]
pub async fn get_device_type(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<DeviceType>, rest::error::ApiError> {
    use crate::db::schema::device_type::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;
    let result = match device_type
        .select(DeviceType::as_select())
        .filter(id.eq(path_id))
        .first(&mut conn)
        .await
    {
        Ok(row) => row,
        Err(diesel::result::Error::NotFound) => {
            return Err(rest::error::client_error(
                StatusCode::NOT_FOUND,
                format!("device type {} not found", path_id),
            ));
        }
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    Ok(Json(result))
}

#[axum::debug_handler]
pub async fn update_device_type(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
    Json(payload): Json<UpdateDeviceType>,
) -> Result<Json<DeviceType>, rest::error::ApiError> {
    use crate::db::schema::device_type::dsl as device_type_dsl;

    if let Some(slug) = &payload.slug {
        validate_slug(slug)?;
    }

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    match diesel::update(device_type_dsl::device_type.find(path_id))
        .set(&payload)
        .returning(DeviceType::as_returning())
        .get_result(&mut conn)
        .await
    {
        Ok(updated) => Ok(Json(updated)),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::CONFLICT,
                "device type name or slug already exists".to_string(),
            ))
        }
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("device type {} not found", path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn delete_device_type(
    State(api_config): State<rest::RestApiConfig>,
    Path(path_id): Path<i32>,
) -> Result<Json<DeviceType>, rest::error::ApiError> {
    use crate::db::schema::device_type::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let deleted: Result<DeviceType, diesel::result::Error> =
        diesel::delete(device_type.filter(id.eq(path_id)))
            .returning(DeviceType::as_returning())
            .get_result(&mut conn)
            .await;

    match deleted {
        Ok(row) => Ok(Json(row)),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("device type {} not found", path_id),
        )),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::CONFLICT,
                "device type still has devices or secret definitions".to_string(),
            ))
        }
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn list_device_type_secrets(
    State(api_config): State<rest::RestApiConfig>,
    Path(device_type_id): Path<i32>,
) -> Result<Json<Vec<DeviceTypeSecret>>, rest::error::ApiError> {
    use crate::db::schema::device_type_secret::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let result = device_type_secret
        .filter(device_type.eq(device_type_id))
        .select(DeviceTypeSecret::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewDeviceTypeSecretPayload {
    pub name: String,
    pub renewal_policy: crate::db::models::SecretRenewalPolicy,
    #[serde(default)]
    pub manual_edit: bool,
    #[serde(default)]
    pub is_credential: bool,
}

#[axum::debug_handler]
pub async fn create_device_type_secret(
    State(api_config): State<rest::RestApiConfig>,
    Path(device_type_id): Path<i32>,
    Json(payload): Json<NewDeviceTypeSecretPayload>,
) -> Result<(StatusCode, Json<DeviceTypeSecret>), rest::error::ApiError> {
    use crate::db::schema::device_type_secret::dsl as dts_dsl;

    if payload.name.trim().is_empty() {
        return Err(rest::error::client_error(
            StatusCode::BAD_REQUEST,
            "name cannot be empty".to_string(),
        ));
    }

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let new_row = NewDeviceTypeSecret {
        device_type: device_type_id,
        name: payload.name.trim().to_string(),
        renewal_policy: payload.renewal_policy,
        manual_edit: payload.manual_edit,
        is_credential: payload.is_credential,
    };

    match diesel::insert_into(dts_dsl::device_type_secret)
        .values(&new_row)
        .returning(DeviceTypeSecret::as_returning())
        .get_result(&mut conn)
        .await
    {
        Ok(created) => Ok((StatusCode::CREATED, Json(created))),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::NOT_FOUND,
                format!("device type {} not found", device_type_id),
            ))
        }
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _info)) => {
            Err(rest::error::client_error(
                StatusCode::CONFLICT,
                format!("secret definition '{}' already exists", new_row.name),
            ))
        }
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn delete_device_type_secret(
    State(api_config): State<rest::RestApiConfig>,
    Path((device_type_id, path_id)): Path<(i32, i32)>,
) -> Result<Json<DeviceTypeSecret>, rest::error::ApiError> {
    use crate::db::schema::device_type_secret::dsl::*;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let deleted: Result<DeviceTypeSecret, diesel::result::Error> = diesel::delete(
        device_type_secret
            .filter(id.eq(path_id))
            .filter(device_type.eq(device_type_id)),
    )
    .returning(DeviceTypeSecret::as_returning())
    .get_result(&mut conn)
    .await;

    match deleted {
        Ok(row) => Ok(Json(row)),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!(
                "device type {} or secret definition {} not found",
                device_type_id, path_id
            ),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}
