use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::db::models::CommunicationProcedure;
use crate::service::vpn::VpnSettings;

pub mod auth;
pub mod dispatch;
pub mod download;
pub mod forms;
pub mod handlers;
pub mod response;

use dispatch::{internal_error_response, post_action, pre_action, requested_device_type};
use forms::{ProtocolForm, ValidationGroup, bind_json, bind_urlencoded, effective_validation_groups};
use handlers::edge_gateway::EdgeGatewayCommunication;
use handlers::router::RouterCommunication;
use handlers::vpn_container_client::VpnContainerClientCommunication;
use response::{
    EdgeGatewayResponseModel, FlexEdgeResponseModel, ResponseModel, RouterResponseModel,
    VpnContainerClientResponseModel,
};

#[derive(Clone)]
pub struct DeviceApiConfig {
    pub listen_address: SocketAddr,
    pub shared_pool: Arc<crate::DbPool>,
    pub realm: String,
    pub encryption_key: Arc<Vec<u8>>,
    pub vpn_settings: VpnSettings,
}

pub struct DeviceApi {
    config: DeviceApiConfig,
    router: axum::Router,
    joiner: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl DeviceApi {
    pub fn new(config: DeviceApiConfig) -> Self {
        let router = axum::Router::new()
            .route(
                "/download/firmware/{slug}/{uuid}/{filename}",
                axum::routing::get(download::check_firmware_download),
            )
            .route("/{slug}/config", axum::routing::post(router_config))
            .route(
                "/{slug}/edge-gateway/configuration",
                axum::routing::post(edge_gateway_configuration),
            )
            .route("/{slug}/register", axum::routing::post(vpn_container_client_register))
            .route(
                "/{slug}/configuration/{uuid}",
                axum::routing::get(vpn_container_client_configuration)
                    .post(vpn_container_client_configuration),
            )
            .route(
                "/{slug}/send/logs/{uuid}",
                axum::routing::post(vpn_container_client_send_logs),
            )
            .with_state(config.clone());

        DeviceApi {
            config,
            router,
            joiner: None,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn start(&mut self) {
        let tcp = TcpListener::bind(self.config.listen_address)
            .await
            .expect("Failed to bind device API TCP listener");
        info!(
            "Device API listening on {}:{}",
            self.config.listen_address.ip(),
            self.config.listen_address.port()
        );

        let router = self.router.clone();
        let cancel = self.cancel.clone();
        self.joiner = Some(tokio::spawn(async move {
            let serve = axum::serve(
                tcp,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(e) = serve.await {
                error!("Device API server error: {e}");
            }
        }));
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.joiner.take() {
            let _ = handle.await;
        }
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query?).ok()?;
    pairs.into_iter().find(|(key, _)| key == name).map(|(_, value)| value)
}

/// Authentication happens before admission control and protocol handling,
/// per device type configuration.
async fn authenticate_request(
    conn: &mut diesel_async::AsyncPgConnection,
    config: &DeviceApiConfig,
    device_type: &crate::db::models::DeviceType,
    headers: &HeaderMap,
    method: &Method,
    uri_path: &str,
    uuid: Option<&str>,
    query: Option<&str>,
) -> Result<auth::AuthenticatedDevice, auth::AuthRejection> {
    let device_query = query_param(query, "device");

    auth::authenticate(
        conn,
        &config.realm,
        &config.encryption_key,
        device_type,
        auth::DeviceAuthRequest {
            headers,
            method: method.as_str(),
            uri_path,
            uuid,
            device_query: device_query.as_deref(),
        },
    )
    .await
}

#[axum::debug_handler]
async fn router_config(
    State(config): State<DeviceApiConfig>,
    Path(slug): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Response {
    let mut conn = match config.shared_pool.get().await {
        Ok(conn) => conn,
        Err(e) => return post_action::<RouterResponseModel>(internal_error_response(e)),
    };

    let device_type = match requested_device_type(&mut conn, &slug).await {
        Ok(Some(device_type)) if device_type.communication_procedure.is_router_family() => {
            device_type
        }
        Ok(_) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return post_action::<RouterResponseModel>(internal_error_response(e)),
    };

    let uri_path = format!("/{slug}/config");
    if let Err(rejection) = authenticate_request(
        &mut conn,
        &config,
        &device_type,
        &headers,
        &method,
        &uri_path,
        None,
        query.as_deref(),
    )
    .await
    {
        return rejection.into_response();
    }

    let communication = RouterCommunication {
        device_type: &device_type,
        encryption_key: &config.encryption_key,
    };

    let flex_edge = CommunicationProcedure::FlexEdge == device_type.communication_procedure;

    match pre_action::<RouterResponseModel>(&mut conn).await {
        Ok(Some(deny)) if !flex_edge => return post_action(deny),
        Ok(Some(_)) => {
            let mut deny = FlexEdgeResponseModel::default();
            deny.set_error(dispatch::UNDER_MAINTENANCE_ERROR);
            return post_action(deny);
        }
        Ok(None) => {}
        Err(e) => return post_action::<RouterResponseModel>(internal_error_response(e)),
    }

    // Router payloads arrive with arbitrary content types; the raw body is
    // re-parsed as an URL-encoded parameter set either way.
    let form: forms::RouterForm = match bind_urlencoded(&body, None) {
        Ok(form) => form,
        Err(message) => {
            let errors = [forms::ValidationError {
                field: "payload".to_string(),
                message,
            }];
            return if flex_edge {
                post_action(communication.prepare_flex_edge_error_response(&errors))
            } else {
                post_action(communication.prepare_error_response(&errors))
            };
        }
    };

    let groups = effective_validation_groups(
        &[ValidationGroup::Default, ValidationGroup::Router],
        &device_type,
    );
    let errors = form.validate(&groups);
    if !errors.is_empty() {
        return if flex_edge {
            post_action(communication.prepare_flex_edge_error_response(&errors))
        } else {
            post_action(communication.prepare_error_response(&errors))
        };
    }

    let peer_ip = Some(peer.ip().to_string());
    if flex_edge {
        post_action(communication.process_flex_edge(&mut conn, &form, peer_ip).await)
    } else {
        post_action(communication.process(&mut conn, &form, peer_ip).await)
    }
}

#[axum::debug_handler]
async fn edge_gateway_configuration(
    State(config): State<DeviceApiConfig>,
    Path(slug): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Response {
    let mut conn = match config.shared_pool.get().await {
        Ok(conn) => conn,
        Err(e) => return post_action::<EdgeGatewayResponseModel>(internal_error_response(e)),
    };

    let device_type = match requested_device_type(&mut conn, &slug).await {
        Ok(Some(device_type))
            if CommunicationProcedure::EdgeGateway == device_type.communication_procedure =>
        {
            device_type
        }
        Ok(_) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return post_action::<EdgeGatewayResponseModel>(internal_error_response(e)),
    };

    let uri_path = format!("/{slug}/edge-gateway/configuration");
    if let Err(rejection) = authenticate_request(
        &mut conn,
        &config,
        &device_type,
        &headers,
        &method,
        &uri_path,
        None,
        query.as_deref(),
    )
    .await
    {
        return rejection.into_response();
    }

    match pre_action::<EdgeGatewayResponseModel>(&mut conn).await {
        Ok(Some(deny)) => return post_action(deny),
        Ok(None) => {}
        Err(e) => return post_action::<EdgeGatewayResponseModel>(internal_error_response(e)),
    }

    let communication = EdgeGatewayCommunication {
        device_type: &device_type,
        encryption_key: &config.encryption_key,
    };

    let form: forms::EdgeGatewayForm = match bind_json(&body) {
        Ok(form) => form,
        Err(message) => {
            let errors = [forms::ValidationError {
                field: "payload".to_string(),
                message,
            }];
            return post_action(communication.prepare_error_response(&errors));
        }
    };

    let groups = effective_validation_groups(
        &[
            ValidationGroup::Default,
            ValidationGroup::EdgeGatewayConfiguration,
        ],
        &device_type,
    );
    let errors = form.validate(&groups);
    if !errors.is_empty() {
        return post_action(communication.prepare_error_response(&errors));
    }

    let peer_ip = Some(peer.ip().to_string());
    post_action(
        communication
            .process_edge_gateway_request(&mut conn, &form, peer_ip)
            .await,
    )
}

#[axum::debug_handler]
async fn vpn_container_client_register(
    State(config): State<DeviceApiConfig>,
    Path(slug): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: axum::body::Bytes,
) -> Response {
    let mut conn = match config.shared_pool.get().await {
        Ok(conn) => conn,
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    };

    let device_type = match requested_device_type(&mut conn, &slug).await {
        Ok(Some(device_type))
            if CommunicationProcedure::VpnContainerClient == device_type.communication_procedure =>
        {
            device_type
        }
        Ok(_) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    };

    let uri_path = format!("/{slug}/register");
    if let Err(rejection) = authenticate_request(
        &mut conn,
        &config,
        &device_type,
        &headers,
        &method,
        &uri_path,
        None,
        query.as_deref(),
    )
    .await
    {
        return rejection.into_response();
    }

    match pre_action::<VpnContainerClientResponseModel>(&mut conn).await {
        Ok(Some(deny)) => return post_action(deny),
        Ok(None) => {}
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    }

    let communication = VpnContainerClientCommunication {
        device_type: &device_type,
        encryption_key: &config.encryption_key,
        vpn_settings: &config.vpn_settings,
    };

    // Register payloads are URL-encoded and merged with query parameters.
    let form: forms::VpnContainerClientRegisterForm =
        match bind_urlencoded(&body, query.as_deref()) {
            Ok(form) => form,
            Err(message) => {
                let errors = [forms::ValidationError {
                    field: "payload".to_string(),
                    message,
                }];
                return post_action(communication.prepare_error_response(&errors));
            }
        };

    let groups = effective_validation_groups(&[ValidationGroup::Default], &device_type);
    let errors = form.validate(&groups);
    if !errors.is_empty() {
        return post_action(communication.prepare_error_response(&errors));
    }

    post_action(communication.process_register(&mut conn, &form).await)
}

#[axum::debug_handler]
async fn vpn_container_client_configuration(
    State(config): State<DeviceApiConfig>,
    Path((slug, uuid)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let mut conn = match config.shared_pool.get().await {
        Ok(conn) => conn,
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    };

    let device_type = match requested_device_type(&mut conn, &slug).await {
        Ok(Some(device_type))
            if CommunicationProcedure::VpnContainerClient == device_type.communication_procedure =>
        {
            device_type
        }
        Ok(_) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    };

    let uri_path = format!("/{slug}/configuration/{uuid}");
    if let Err(rejection) = authenticate_request(
        &mut conn,
        &config,
        &device_type,
        &headers,
        &method,
        &uri_path,
        Some(&uuid),
        query.as_deref(),
    )
    .await
    {
        return rejection.into_response();
    }

    match pre_action::<VpnContainerClientResponseModel>(&mut conn).await {
        Ok(Some(deny)) => return post_action(deny),
        Ok(None) => {}
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    }

    let communication = VpnContainerClientCommunication {
        device_type: &device_type,
        encryption_key: &config.encryption_key,
        vpn_settings: &config.vpn_settings,
    };

    post_action(communication.process_configuration(&mut conn, &uuid).await)
}

#[axum::debug_handler]
async fn vpn_container_client_send_logs(
    State(config): State<DeviceApiConfig>,
    Path((slug, uuid)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: axum::body::Bytes,
) -> Response {
    let mut conn = match config.shared_pool.get().await {
        Ok(conn) => conn,
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    };

    let device_type = match requested_device_type(&mut conn, &slug).await {
        Ok(Some(device_type))
            if CommunicationProcedure::VpnContainerClient == device_type.communication_procedure =>
        {
            device_type
        }
        Ok(_) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    };

    let uri_path = format!("/{slug}/send/logs/{uuid}");
    if let Err(rejection) = authenticate_request(
        &mut conn,
        &config,
        &device_type,
        &headers,
        &method,
        &uri_path,
        Some(&uuid),
        query.as_deref(),
    )
    .await
    {
        return rejection.into_response();
    }

    match pre_action::<VpnContainerClientResponseModel>(&mut conn).await {
        Ok(Some(deny)) => return post_action(deny),
        Ok(None) => {}
        Err(e) => return post_action::<VpnContainerClientResponseModel>(internal_error_response(e)),
    }

    let communication = VpnContainerClientCommunication {
        device_type: &device_type,
        encryption_key: &config.encryption_key,
        vpn_settings: &config.vpn_settings,
    };

    let form: forms::VpnContainerClientLogsForm = match bind_json(&body) {
        Ok(form) => form,
        Err(message) => {
            let errors = [forms::ValidationError {
                field: "payload".to_string(),
                message,
            }];
            return post_action(communication.prepare_error_response(&errors));
        }
    };

    let groups = effective_validation_groups(
        &[
            ValidationGroup::Default,
            ValidationGroup::VpnContainerClientLogs,
        ],
        &device_type,
    );
    let errors = form.validate(&groups);
    if !errors.is_empty() {
        return post_action(communication.prepare_error_response(&errors));
    }

    post_action(
        communication
            .process_send_logs(&mut conn, &uuid, &form)
            .await,
    )
}
