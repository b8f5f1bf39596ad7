use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::RunQueryDsl;
use log::{error, warn};

use crate::api::device::auth;
use crate::api::device::dispatch::requested_device_type;
use crate::api::device::{DeviceApiConfig, query_param};
use crate::db::models::{AuthenticationMethod, Firmware};

pub const FIRMWARE_FILEPATH_HEADER: &str = "FIRMWARE-FILEPATH";

/// Firmware download auth-check endpoint for a reverse-proxy auth subrequest:
/// `204` + `FIRMWARE-FILEPATH` header when the download may proceed, a bare
/// `401` on any failure. The proxy serves the file itself.
#[axum::debug_handler]
pub async fn check_firmware_download(
    State(config): State<DeviceApiConfig>,
    Path((slug, uuid, filename)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let unauthorized = || StatusCode::UNAUTHORIZED.into_response();

    let mut conn = match config.shared_pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Failed to get DB connection: {e}");
            return unauthorized();
        }
    };

    let device_type = match requested_device_type(&mut conn, &slug).await {
        Ok(Some(device_type)) => device_type,
        Ok(None) => return unauthorized(),
        Err(e) => {
            error!("Failed to query device type: {e}");
            return unauthorized();
        }
    };

    // Only procedures that declare firmware secured require authentication
    // for the download itself.
    let secured = device_type.communication_procedure.is_firmware_secured()
        && AuthenticationMethod::None != device_type.authentication_method;
    if secured {
        let device_query = query_param(query.as_deref(), "device");
        let uri_path = format!("/download/firmware/{slug}/{uuid}/{filename}");
        let result = auth::authenticate(
            &mut conn,
            &config.realm,
            &config.encryption_key,
            &device_type,
            auth::DeviceAuthRequest {
                headers: &headers,
                method: method.as_str(),
                uri_path: &uri_path,
                uuid: None,
                device_query: device_query.as_deref(),
            },
        )
        .await;

        if result.is_err() {
            warn!(
                "Unauthorized firmware download for device type '{}' ({}/{})",
                device_type.name, uuid, filename
            );
            return unauthorized();
        }
    }

    let firmware: Option<Firmware> = {
        use crate::db::schema::firmware::dsl;
        dsl::firmware
            .filter(dsl::device_type.eq(device_type.id))
            .filter(dsl::uuid.eq(&uuid))
            .filter(dsl::filename.eq(&filename))
            .select(Firmware::as_select())
            .first(&mut conn)
            .await
            .optional()
            .unwrap_or_else(|e| {
                error!("Failed to query firmware: {e}");
                None
            })
    };

    let Some(firmware) = firmware else {
        return unauthorized();
    };

    let firmware_filepath = format!("{}/{}/{}", slug, firmware.uuid, firmware.filename);

    (
        StatusCode::NO_CONTENT,
        [(FIRMWARE_FILEPATH_HEADER, firmware_filepath)],
    )
        .into_response()
}
