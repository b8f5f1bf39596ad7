use axum::http::StatusCode;
use axum::response::IntoResponse;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

use crate::provider::opnsense::OpnSenseVpnProvider;
use crate::service::vpn::VpnSettings;

mod device;
mod device_secret;
mod device_type;
pub mod error;
mod firmware;
mod maintenance;
mod vpn;

#[derive(Clone)]
pub struct RestApiConfig {
    pub listen_address: SocketAddr,
    pub shared_pool: Arc<crate::DbPool>,
    pub api_key: String,
    pub encryption_key: Arc<Vec<u8>>,
    pub vpn_provider: Option<Arc<OpnSenseVpnProvider>>,
    pub vpn_settings: VpnSettings,
}

pub struct RestApi {
    config: RestApiConfig,
    router: axum::Router,
}

async fn api_key_mw(
    axum::extract::State(state): axum::extract::State<RestApiConfig>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            [("www-authenticate", r#"ApiKey realm="api""#)],
            "missing or invalid x-api-key",
        )
            .into_response()
    };

    let key = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    match key {
        Some(k) if state.api_key == k => next.run(req).await,
        _ => {
            let peer_opt: Option<SocketAddr> = req
                .extensions()
                .get::<axum::extract::ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0);
            if let Some(peer) = peer_opt {
                warn!(
                    "unauthorized access to endpoint \"{}\" from \"{:?}\"",
                    req.uri().path(),
                    peer
                );
            } else {
                warn!("unauthorized access to endpoint \"{}\"", req.uri().path());
            }

            unauthorized()
        }
    }
}

impl RestApi {
    pub fn new(config: RestApiConfig) -> Self {
        let router = axum::Router::new()
            .route(
                "/device_type",
                axum::routing::post(device_type::create_device_type),
            )
            .route(
                "/device_type",
                axum::routing::get(device_type::list_device_types),
            )
            .route(
                "/device_type/{id}",
                axum::routing::get(device_type::get_device_type),
            )
            .route(
                "/device_type/{id}",
                axum::routing::patch(device_type::update_device_type),
            )
            .route(
                "/device_type/{id}",
                axum::routing::delete(device_type::delete_device_type),
            )
            .route(
                "/device_type/{id}/secret",
                axum::routing::get(device_type::list_device_type_secrets),
            )
            .route(
                "/device_type/{id}/secret",
                axum::routing::post(device_type::create_device_type_secret),
            )
            .route(
                "/device_type/{id}/secret/{id}",
                axum::routing::delete(device_type::delete_device_type_secret),
            )
            .route("/device", axum::routing::get(device::list_devices))
            .route("/device", axum::routing::post(device::create_device))
            .route("/device/{id}", axum::routing::get(device::get_device))
            .route("/device/{id}", axum::routing::patch(device::update_device))
            .route("/device/{id}", axum::routing::delete(device::delete_device))
            .route(
                "/device/{id}/secret",
                axum::routing::get(device_secret::list_device_secrets),
            )
            .route(
                "/device/{id}/secret",
                axum::routing::post(device_secret::create_device_secret),
            )
            .route(
                "/device/{id}/secret/{id}",
                axum::routing::delete(device_secret::delete_device_secret),
            )
            .route(
                "/device/{id}/secret/{id}/renew",
                axum::routing::post(device_secret::renew_device_secret),
            )
            .route(
                "/device/{id}/secret/{id}/log",
                axum::routing::get(device_secret::list_device_secret_logs),
            )
            .route(
                "/device_failed_login_attempt",
                axum::routing::get(device::list_failed_login_attempts),
            )
            .route("/device/{id}/vpn/open", axum::routing::post(vpn::open_connection))
            .route(
                "/device/{id}/vpn/close",
                axum::routing::post(vpn::close_connection),
            )
            .route("/vpn/connected", axum::routing::get(vpn::connected_clients))
            .route("/firmware", axum::routing::get(firmware::list_firmwares))
            .route("/firmware", axum::routing::post(firmware::create_firmware))
            .route("/firmware/{id}", axum::routing::get(firmware::get_firmware))
            .route(
                "/firmware/{id}",
                axum::routing::delete(firmware::delete_firmware),
            )
            .route(
                "/maintenance",
                axum::routing::get(maintenance::list_maintenances),
            )
            .route(
                "/maintenance",
                axum::routing::post(maintenance::create_maintenance),
            )
            .route(
                "/maintenance/{id}/start",
                axum::routing::post(maintenance::start_maintenance),
            )
            .route(
                "/maintenance/{id}/finish",
                axum::routing::post(maintenance::finish_maintenance),
            )
            .route(
                "/maintenance_schedule",
                axum::routing::get(maintenance::list_maintenance_schedules),
            )
            .route(
                "/maintenance_schedule",
                axum::routing::post(maintenance::create_maintenance_schedule),
            )
            .route(
                "/maintenance_schedule/{id}",
                axum::routing::get(maintenance::get_maintenance_schedule),
            )
            .route(
                "/maintenance_schedule/{id}",
                axum::routing::patch(maintenance::update_maintenance_schedule),
            )
            .route(
                "/maintenance_schedule/{id}",
                axum::routing::delete(maintenance::delete_maintenance_schedule),
            )
            .with_state(config.clone())
            .layer(axum::middleware::from_fn_with_state(
                config.clone(),
                api_key_mw,
            )); // apply globally
        RestApi { config, router }
    }

    pub async fn start_blocking(&mut self) {
        let tcp = TcpListener::bind(self.config.listen_address)
            .await
            .expect("Failed to bind TCP listener");
        info!(
            "Admin REST API listening on {}:{}",
            self.config.listen_address.ip(),
            self.config.listen_address.port()
        );
        axum::serve(
            tcp,
            self.router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("CTRL+C received; shutting down");
        })
        .await
        .expect("Server error");
    }
}
