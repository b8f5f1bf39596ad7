use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use diesel::ExpressionMethods;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::RunQueryDsl;
use serde::Serialize;

use crate::api::rest;
use crate::db::models::{Device, DeviceType};
use crate::provider::model::VpnConnectedClient;
use crate::provider::{LogModel, LogsCollector};
use crate::service::vpn;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnOperationResult {
    pub firewall_rule_identifiers: Vec<String>,
    pub logs: Vec<LogModel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnConnectedClientsResult {
    pub clients: Vec<VpnConnectedClient>,
    pub logs: Vec<LogModel>,
}

fn vpn_provider(
    api_config: &rest::RestApiConfig,
) -> Result<std::sync::Arc<crate::provider::opnsense::OpnSenseVpnProvider>, rest::error::ApiError> {
    api_config.vpn_provider.clone().ok_or_else(|| {
        rest::error::client_error(
            StatusCode::CONFLICT,
            "VPN provider is not configured".to_string(),
        )
    })
}

async fn load_vpn_device(
    api_config: &rest::RestApiConfig,
    device_id: i32,
) -> Result<Device, rest::error::ApiError> {
    use crate::db::schema::device::dsl as device_dsl;
    use crate::db::schema::device_type::dsl as device_type_dsl;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let found: Device = match device_dsl::device
        .filter(device_dsl::id.eq(device_id))
        .select(Device::as_select())
        .first(&mut conn)
        .await
    {
        Ok(row) => row,
        Err(diesel::result::Error::NotFound) => {
            return Err(rest::error::client_error(
                StatusCode::NOT_FOUND,
                format!("device {} not found", device_id),
            ));
        }
        Err(e) => return Err(rest::error::internal_error(e)),
    };

    let device_type: DeviceType = device_type_dsl::device_type
        .filter(device_type_dsl::id.eq(found.device_type))
        .select(DeviceType::as_select())
        .first(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    if !device_type.has_vpn || !device_type.is_device_to_network_available {
        return Err(rest::error::client_error(
            StatusCode::CONFLICT,
            format!(
                "device type '{}' does not allow device-to-network connections",
                device_type.name
            ),
        ));
    }

    Ok(found)
}

/// Opens the device-to-network connection: CSC deployment plus firewall
/// rules, best effort. The applied rule identifiers are persisted even when
/// some rules failed; the collected logs carry the failures.
#[axum::debug_handler]
pub async fn open_connection(
    State(api_config): State<rest::RestApiConfig>,
    Path(device_id): Path<i32>,
) -> Result<Json<VpnOperationResult>, rest::error::ApiError> {
    use crate::db::schema::device::dsl as device_dsl;

    let provider = vpn_provider(&api_config)?;
    let target = load_vpn_device(&api_config, device_id).await?;

    if target.vpn_ip.is_none() {
        return Err(rest::error::client_error(
            StatusCode::CONFLICT,
            format!("device {} has no VPN IP address assigned", device_id),
        ));
    }

    let mut logs = LogsCollector::new();
    let outcome = vpn::open_device_connection(
        provider.as_ref(),
        &api_config.vpn_settings,
        &target,
        &mut logs,
    )
    .await;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let stored_rules = if outcome.firewall_rule_identifiers.is_empty() {
        None
    } else {
        Some(outcome.firewall_rule_identifiers.join(","))
    };
    diesel::update(device_dsl::device.find(target.id))
        .set((
            device_dsl::connection_firewall_rules.eq(stored_rules),
            device_dsl::csc_hash.eq(outcome.csc_hash.clone()),
        ))
        .execute(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(VpnOperationResult {
        firewall_rule_identifiers: outcome.firewall_rule_identifiers,
        logs: logs.take_logs(),
    }))
}

#[axum::debug_handler]
pub async fn close_connection(
    State(api_config): State<rest::RestApiConfig>,
    Path(device_id): Path<i32>,
) -> Result<Json<VpnOperationResult>, rest::error::ApiError> {
    use crate::db::schema::device::dsl as device_dsl;

    let provider = vpn_provider(&api_config)?;
    let target = load_vpn_device(&api_config, device_id).await?;

    let mut logs = LogsCollector::new();

    // Fold the final traffic snapshot into the counters before tearing the
    // connection down.
    let traffic = vpn::connection_traffic(provider.as_ref(), &target, &mut logs)
        .await
        .ok()
        .flatten();

    vpn::close_device_connection(provider.as_ref(), &target, &mut logs).await;

    let mut conn = api_config
        .shared_pool
        .clone()
        .get_owned()
        .await
        .map_err(rest::error::internal_error)?;

    let (traffic_in, traffic_out) = traffic.unwrap_or((0, 0));
    diesel::update(device_dsl::device.find(target.id))
        .set((
            device_dsl::connection_firewall_rules.eq(None::<String>),
            device_dsl::vpn_traffic_in.eq(device_dsl::vpn_traffic_in + traffic_in),
            device_dsl::vpn_traffic_out.eq(device_dsl::vpn_traffic_out + traffic_out),
        ))
        .execute(&mut conn)
        .await
        .map_err(rest::error::internal_error)?;

    Ok(Json(VpnOperationResult {
        firewall_rule_identifiers: Vec::new(),
        logs: logs.take_logs(),
    }))
}

#[axum::debug_handler]
pub async fn connected_clients(
    State(api_config): State<rest::RestApiConfig>,
) -> Result<Json<VpnConnectedClientsResult>, rest::error::ApiError> {
    use crate::provider::VpnProvider;

    let provider = vpn_provider(&api_config)?;

    let mut logs = LogsCollector::new();
    let clients = match provider.vpn_connected_clients(&mut logs).await {
        Ok(clients) => clients,
        Err(_) => {
            // Failure detail is in the collected logs; the snapshot is empty.
            Vec::new()
        }
    };

    Ok(Json(VpnConnectedClientsResult {
        clients,
        logs: logs.take_logs(),
    }))
}
