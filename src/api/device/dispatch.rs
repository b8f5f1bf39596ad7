use axum::Json;
use axum::response::{IntoResponse, Response};
use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use log::{debug, error};

use crate::api::device::response::ResponseModel;
use crate::db::models::DeviceType;
use crate::service::maintenance;

pub const UNDER_MAINTENANCE_ERROR: &str = "Under maintenance";
pub const INTERNAL_ERROR: &str = "Internal error";

/// Looks up the device type addressed by a check-in route. `None` is a plain
/// 404 upstream; unknown slugs never reach protocol handling.
pub async fn requested_device_type(
    conn: &mut AsyncPgConnection,
    requested_slug: &str,
) -> Result<Option<DeviceType>, diesel::result::Error> {
    use crate::db::schema::device_type::dsl::*;

    device_type
        .filter(slug.eq(requested_slug))
        .select(DeviceType::as_select())
        .first(conn)
        .await
        .optional()
}

/// Admission control shared by every check-in route. A deny response is a
/// protocol-shaped model with the error set in-band, never an HTTP error.
pub async fn pre_action<R: ResponseModel>(
    conn: &mut AsyncPgConnection,
) -> Result<Option<R>, diesel::result::Error> {
    if maintenance::maintenance_mode_enabled(conn).await? {
        let mut response = R::default();
        response.set_error(UNDER_MAINTENANCE_ERROR);
        return Ok(Some(response));
    }

    Ok(None)
}

/// Response-shaping hook: every check-in result leaves through the same
/// serialization path, deny and success alike.
pub fn post_action<R: ResponseModel>(response: R) -> Response {
    if let Some(protocol_error) = response.error() {
        debug!("Device check-in answered with in-band error: {protocol_error}");
    }

    Json(response).into_response()
}

/// Protocol-shaped response for an internal failure. Logged with full detail
/// server side, opaque towards the device.
pub fn internal_error_response<R: ResponseModel, E: std::fmt::Display>(error: E) -> R {
    error!("Device check-in failed: {error}");
    let mut response = R::default();
    response.set_error(INTERNAL_ERROR);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::device::response::{
        EdgeGatewayResponseModel, VpnContainerClientResponseModel,
    };

    #[test]
    fn internal_error_stays_in_band() {
        let response: EdgeGatewayResponseModel = internal_error_response("boom");
        assert_eq!(response.error.as_deref(), Some(INTERNAL_ERROR));
    }

    #[test]
    fn maintenance_deny_is_protocol_shaped() {
        // The deny response serializes like any other check-in response; no
        // HTTP-level error surfaces towards the device.
        let mut deny = VpnContainerClientResponseModel::default();
        deny.set_error(UNDER_MAINTENANCE_ERROR);

        assert_eq!(
            serde_json::to_value(&deny).expect("serializable"),
            serde_json::json!({"error": "Under maintenance"})
        );
    }
}
