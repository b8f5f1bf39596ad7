use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{NaiveDateTime, Utc};
use diesel::ExpressionMethods;
use diesel::JoinOnDsl;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel::result::DatabaseErrorKind;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::api::rest;
use crate::db::models::{
    DeviceSecret, DeviceTypeSecret, NewDeviceSecret, NewSecretLog, SecretLog, SecretLogAction,
};
use crate::service::secrets;

/// Secret values never leave the API in cleartext; listings only say whether
/// a value is present.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSecretPayload {
    pub id: i32,
    pub name: String,
    pub has_value: bool,
    pub force_renewal: bool,
    pub manual_edit: bool,
    pub updated_at: NaiveDateTime,
}

impl From<(DeviceSecret, DeviceTypeSecret)> for DeviceSecretPayload {
    fn from((secret, definition): (DeviceSecret, DeviceTypeSecret)) -> Self {
        DeviceSecretPayload {
            id: secret.id,
            name: definition.name,
            has_value: secret.value.is_some(),
            force_renewal: secret.force_renewal,
            manual_edit: definition.manual_edit,
            updated_at: secret.updated_at,
        }
    }
}

#[axum::debug_handler]
pub async fn list_device_secrets(
    State(api_config): State<rest::RestApiConfig>,
    Path(device_id): Path<i32>,
) -> Result<Json<Vec<DeviceSecretPayload>>, rest::error::ApiError> {
    use crate::db::schema::device_secret::dsl as secret_dsl;
    use crate::db::schema::device_type_secret::dsl as dts_dsl;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let rows: Vec<(DeviceSecret, DeviceTypeSecret)> = secret_dsl::device_secret
        .inner_join(
            dts_dsl::device_type_secret.on(dts_dsl::id.eq(secret_dsl::device_type_secret)),
        )
        .filter(secret_dsl::device.eq(device_id))
        .select((DeviceSecret::as_select(), DeviceTypeSecret::as_select()))
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(rows.into_iter().map(DeviceSecretPayload::from).collect()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDeviceSecretPayload {
    pub device_type_secret: i32,
    /// Explicit value; generated when omitted.
    pub value: Option<String>,
}

#[axum::debug_handler]
pub async fn create_device_secret(
    State(api_config): State<rest::RestApiConfig>,
    Path(device_id): Path<i32>,
    Json(payload): Json<NewDeviceSecretPayload>,
) -> Result<(StatusCode, Json<DeviceSecretPayload>), rest::error::ApiError> {
    use diesel_async::AsyncConnection;

    let mut conn = match api_config.shared_pool.get().await {
        Ok(c) => c,
        Err(e) => {
            return Err(rest::error::internal_error(e));
        }
    };

    let encryption_key = api_config.encryption_key.clone();
    let tx_result: Result<(DeviceSecret, DeviceTypeSecret), rest::error::TransactionError> = conn
        .transaction::<_, rest::error::TransactionError, _>(|conn| {
            Box::pin(async move {
                use crate::db::schema::device_secret::dsl as secret_dsl;
                use crate::db::schema::device_type_secret::dsl as dts_dsl;
                use crate::db::schema::secret_log::dsl as log_dsl;

                let definition: DeviceTypeSecret = match dts_dsl::device_type_secret
                    .filter(dts_dsl::id.eq(payload.device_type_secret))
                    .select(DeviceTypeSecret::as_select())
                    .first(conn)
                    .await
                {
                    Ok(row) => row,
                    Err(diesel::result::Error::NotFound) => {
                        return Err(rest::error::TransactionError::from(
                            rest::error::client_error(
                                StatusCode::BAD_REQUEST,
                                "unknown secret definition".to_string(),
                            ),
                        ));
                    }
                    Err(e) => return Err(rest::error::TransactionError::from(e)),
                };

                if payload.value.is_some() && !definition.manual_edit {
                    return Err(rest::error::TransactionError::from(
                        rest::error::client_error(
                            StatusCode::BAD_REQUEST,
                            format!("secret '{}' does not allow manual values", definition.name),
                        ),
                    ));
                }

                let (value, action) = match &payload.value {
                    Some(value) => (
                        zeroize::Zeroizing::new(value.clone()),
                        SecretLogAction::Edited,
                    ),
                    None => (
                        secrets::generate_secret_value()
                            .map_err(rest::error::internal_error)
                            .map_err(rest::error::TransactionError::from)?,
                        SecretLogAction::Generated,
                    ),
                };

                let encrypted = secrets::encrypt_secret_value(&encryption_key, &value)
                    .map_err(rest::error::internal_error)
                    .map_err(rest::error::TransactionError::from)?;

                let new_row = NewDeviceSecret {
                    device: device_id,
                    device_type_secret: definition.id,
                    value: Some(encrypted),
                    force_renewal: false,
                    updated_at: Utc::now().naive_utc(),
                };

                let created: DeviceSecret = diesel::insert_into(secret_dsl::device_secret)
                    .values(&new_row)
                    .returning(DeviceSecret::as_returning())
                    .get_result(conn)
                    .await?;

                // The secret and its log entry land together or not at all.
                diesel::insert_into(log_dsl::secret_log)
                    .values(&NewSecretLog {
                        device_secret: created.id,
                        action,
                        created_at: created.updated_at,
                    })
                    .execute(conn)
                    .await?;

                Ok((created, definition))
            })
        })
        .await;

    use diesel::result::Error as DieselError;

    match tx_result {
        Ok((created, definition)) => Ok((
            StatusCode::CREATED,
            Json(DeviceSecretPayload::from((created, definition))),
        )),
        Err(rest::error::TransactionError::Db(DieselError::DatabaseError(
            DatabaseErrorKind::ForeignKeyViolation,
            _info,
        ))) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("device {} not found", device_id),
        )),
        Err(rest::error::TransactionError::Db(DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            _info,
        ))) => Err(rest::error::client_error(
            StatusCode::CONFLICT,
            format!("secret already exists on device {}", device_id),
        )),
        Err(rest::error::TransactionError::Db(e)) => Err(rest::error::internal_error(e)),
        Err(rest::error::TransactionError::Api(api)) => Err(api),
    }
}

#[axum::debug_handler]
pub async fn delete_device_secret(
    State(api_config): State<rest::RestApiConfig>,
    Path((device_id, path_id)): Path<(i32, i32)>,
) -> Result<StatusCode, rest::error::ApiError> {
    use crate::db::schema::device_secret::dsl as secret_dsl;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let deleted: Result<DeviceSecret, diesel::result::Error> = diesel::delete(
        secret_dsl::device_secret
            .filter(secret_dsl::id.eq(path_id))
            .filter(secret_dsl::device.eq(device_id)),
    )
    .returning(DeviceSecret::as_returning())
    .get_result(&mut conn)
    .await;

    match deleted {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(diesel::result::Error::NotFound) => Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("device {} or secret {} not found", device_id, path_id),
        )),
        Err(e) => Err(rest::error::internal_error(e)),
    }
}

#[axum::debug_handler]
pub async fn list_device_secret_logs(
    State(api_config): State<rest::RestApiConfig>,
    Path((device_id, path_id)): Path<(i32, i32)>,
) -> Result<Json<Vec<SecretLog>>, rest::error::ApiError> {
    use crate::db::schema::device_secret::dsl as secret_dsl;
    use crate::db::schema::secret_log::dsl as log_dsl;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let secret_filter = secret_dsl::device_secret
        .filter(secret_dsl::id.eq(path_id))
        .filter(secret_dsl::device.eq(device_id));
    let secret_exists: bool = diesel::select(diesel::dsl::exists(secret_filter))
        .get_result(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;
    if !secret_exists {
        return Err(rest::error::client_error(
            StatusCode::NOT_FOUND,
            format!("device {} or secret {} not found", device_id, path_id),
        ));
    }

    let result = log_dsl::secret_log
        .filter(log_dsl::device_secret.eq(path_id))
        .order(log_dsl::created_at.desc())
        .select(SecretLog::as_select())
        .load(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(result))
}

/// Marks a secret for renewal at the device's next check-in.
#[axum::debug_handler]
pub async fn renew_device_secret(
    State(api_config): State<rest::RestApiConfig>,
    Path((device_id, path_id)): Path<(i32, i32)>,
) -> Result<Json<DeviceSecretPayload>, rest::error::ApiError> {
    use crate::db::schema::device_secret::dsl as secret_dsl;
    use crate::db::schema::device_type_secret::dsl as dts_dsl;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let existing: DeviceSecret = match secret_dsl::device_secret
        .filter(secret_dsl::id.eq(path_id))
        .filter(secret_dsl::device.eq(device_id))
        .select(DeviceSecret::as_select())
        .first(&mut conn)
        .await
    {
        Ok(row) => row,
        Err(diesel::result::Error::NotFound) => {
            return Err(rest::error::client_error(
                StatusCode::NOT_FOUND,
                format!("device {} or secret {} not found", device_id, path_id),
            ));
        }
        Err(e) => return Err(rest::error::internal_error(e)),
    };

    let definition: DeviceTypeSecret = dts_dsl::device_type_secret
        .filter(dts_dsl::id.eq(existing.device_type_secret))
        .select(DeviceTypeSecret::as_select())
        .first(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    if !definition.renewal_policy.allows_renew() {
        return Err(rest::error::client_error(
            StatusCode::CONFLICT,
            format!(
                "secret '{}' renewal policy does not allow renewal",
                definition.name
            ),
        ));
    }

    let updated: DeviceSecret = diesel::update(secret_dsl::device_secret.find(existing.id))
        .set(secret_dsl::force_renewal.eq(true))
        .returning(DeviceSecret::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(DeviceSecretPayload::from((updated, definition))))
}
