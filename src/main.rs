use base64::{Engine as _, engine::general_purpose::STANDARD};
use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{AsyncDieselConnectionManager, bb8},
};
use dotenvy::dotenv;
use log::{error, info};
use std::fs;
use std::time::Duration;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

mod api;
mod db;
mod http_client;
mod provider;
mod service;

use provider::opnsense::{OpnSenseConfig, OpnSenseVpnProvider};
use service::vpn::VpnSettings;

type DbPool = bb8::Pool<AsyncPgConnection>;

#[tokio::main]
async fn main() {
    dotenv().ok();

    // DB Pool setup
    let db_url = std::env::var("FLEETLINK_DATABASE_URL").expect("FLEETLINK_DATABASE_URL environment variable is missing. Please set it before running the app.");
    let config = AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(db_url);
    let pool = DbPool::builder()
        .build(config)
        .await
        .expect("Failed to create pool");
    let shared_pool = Arc::new(pool);

    // initialize logging
    let log_path_env = std::env::var("FLEETLINK_LOG_PATH");
    let log_path: PathBuf = match log_path_env {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            println!("FLEETLINK_LOG_PATH not set using default: /opt/fleetlink/logs");
            PathBuf::from("/opt/fleetlink/logs")
        }
    };
    // Ensure log directory exists
    if let Err(e) = fs::create_dir_all(&log_path) {
        eprintln!("Failed to create log directory {:?}: {}", log_path, e);
        std::process::exit(1);
    }

    let max_log_days: usize = std::env::var("FLEETLINK_MAX_LOG_DAYS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(7);
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("fleetlink")
        .filename_suffix("log")
        .max_log_files(max_log_days)
        .build(log_path)
        .expect("create rolling file");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr)) // console
        .with(fmt::layer().with_ansi(false).with_writer(file_appender)) // file
        .init();

    info!("Logging initialized.");

    // Secret encryption key (base64, 32 bytes once decoded)
    let encryption_key: Arc<Vec<u8>> = {
        let encoded = std::env::var("FLEETLINK_ENCRYPTION_KEY").expect(
            "FLEETLINK_ENCRYPTION_KEY environment variable is missing. Please set it before running the app.",
        );
        let decoded = match STANDARD.decode(encoded.trim()) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("FLEETLINK_ENCRYPTION_KEY is not valid base64: {e}");
                return;
            }
        };
        if decoded.len() != 32 {
            error!(
                "FLEETLINK_ENCRYPTION_KEY has to decode to 32 bytes, got {}",
                decoded.len()
            );
            return;
        }
        Arc::new(decoded)
    };

    let realm = std::env::var("FLEETLINK_REALM").unwrap_or_else(|_| "devices".to_string());

    let api_key_env = std::env::var("FLEETLINK_API_KEY");
    let api_key: String = match api_key_env {
        Ok(key) => {
            if key.len() < 16 {
                error!("API key to short. Needs to be at least 16 characters");
                return;
            };
            key
        }
        Err(_) => {
            info!("FLEETLINK_API_KEY not set generating random key...");
            const CHARSET: &'static [u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                              abcdefghijklmnopqrstuvwxyz\
                              0123456789";
            const LENGTH: usize = 32;
            let mut buf = [0u8; LENGTH];
            getrandom::fill(&mut buf).expect("Failed to get random bytes");

            let key: String = buf
                .iter()
                .map(|&b| {
                    let idx = (b as usize) % CHARSET.len();
                    CHARSET[idx] as char
                })
                .collect();

            info!("Generated api_key {}", key);
            key
        }
    };

    let vpn_settings = VpnSettings {
        server_description: std::env::var("FLEETLINK_VPN_SERVER_DESCRIPTION")
            .unwrap_or_else(|_| "Devices VPN".to_string()),
        devices_vpn_gateway: std::env::var("FLEETLINK_VPN_GATEWAY")
            .unwrap_or_else(|_| "10.8.0.1".to_string()),
        devices_vpn_networks: std::env::var("FLEETLINK_VPN_NETWORKS")
            .unwrap_or_else(|_| "10.8.0.0/24".to_string())
            .split(',')
            .map(|network| network.trim().to_string())
            .filter(|network| !network.is_empty())
            .collect(),
        technicians_vpn_network: std::env::var("FLEETLINK_TECHNICIANS_VPN_NETWORK")
            .unwrap_or_else(|_| "10.9.0.0/24".to_string()),
    };

    // OPNsense provider is optional; VPN operations answer 409 without it.
    let vpn_provider = match std::env::var("FLEETLINK_OPNSENSE_URI") {
        Ok(base_uri) => {
            let base_uri = match Url::parse(&base_uri) {
                Ok(base_uri) => base_uri,
                Err(e) => {
                    error!("FLEETLINK_OPNSENSE_URI is not a valid URL: {e}");
                    return;
                }
            };
            let timeout_seconds: u64 = std::env::var("FLEETLINK_OPNSENSE_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(30);
            let verify_ssl = std::env::var("FLEETLINK_OPNSENSE_VERIFY_SSL")
                .map(|value| "false" != value.to_lowercase())
                .unwrap_or(true);

            let provider_config = OpnSenseConfig {
                base_uri,
                timeout: Duration::from_secs(timeout_seconds),
                verify_server_ssl_certificate: verify_ssl,
                user: std::env::var("FLEETLINK_OPNSENSE_USER").ok(),
                password: std::env::var("FLEETLINK_OPNSENSE_PASSWORD").ok(),
            };
            match OpnSenseVpnProvider::new(provider_config) {
                Ok(provider) => Some(Arc::new(provider)),
                Err(e) => {
                    error!("Failed to build OPNsense HTTP client: {e}");
                    return;
                }
            }
        }
        Err(_) => {
            info!("FLEETLINK_OPNSENSE_URI not set; VPN provider operations disabled");
            None
        }
    };

    // Maintenance scheduler
    let mut scheduler = service::maintenance::MaintenanceScheduler::new(shared_pool.clone());
    scheduler.start();

    // Device API
    let device_addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
    let device_api_config = api::device::DeviceApiConfig {
        listen_address: device_addr,
        shared_pool: shared_pool.clone(),
        realm: realm.clone(),
        encryption_key: encryption_key.clone(),
        vpn_settings: vpn_settings.clone(),
    };
    let mut device_api = api::device::DeviceApi::new(device_api_config);
    device_api.start().await;

    // Admin REST API
    let rest_addr: SocketAddr = "0.0.0.0:3000".parse().unwrap();
    let rest_api_config = api::rest::RestApiConfig {
        listen_address: rest_addr,
        shared_pool: shared_pool.clone(),
        api_key: api_key,
        encryption_key: encryption_key,
        vpn_provider,
        vpn_settings,
    };
    let mut rest_api = api::rest::RestApi::new(rest_api_config);
    rest_api.start_blocking().await;
    device_api.shutdown().await;
    scheduler.shutdown().await;
}
