use chrono::Utc;
use diesel::ExpressionMethods;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use log::info;

use crate::api::device::auth::sha256_hex;
use crate::api::device::dispatch::internal_error_response;
use crate::api::device::forms::{RouterForm, ValidationError, validation_errors_message};
use crate::api::device::handlers::find_device_by_serial;
use crate::api::device::response::{FlexEdgeResponseModel, ResponseModel, RouterResponseModel};
use crate::db::models::{CommunicationProcedure, Device, DeviceType, NewDevice};
use crate::service::secrets;

/// Handler for the router family of check-in procedures. The variants share
/// the check-in flow and differ in what the response carries:
/// `router`/`routerOneConfig` distribute the device config, `routerDsa`
/// additionally attaches the config checksum, `flexEdge` acknowledges only.
pub struct RouterCommunication<'a> {
    pub device_type: &'a DeviceType,
    pub encryption_key: &'a [u8],
}

impl RouterCommunication<'_> {
    pub fn prepare_error_response(&self, errors: &[ValidationError]) -> RouterResponseModel {
        let mut response = RouterResponseModel::default();
        response.set_error(&validation_errors_message(errors));
        response
    }

    pub fn prepare_flex_edge_error_response(
        &self,
        errors: &[ValidationError],
    ) -> FlexEdgeResponseModel {
        let mut response = FlexEdgeResponseModel::default();
        response.set_error(&validation_errors_message(errors));
        response
    }

    pub async fn process(
        &self,
        conn: &mut AsyncPgConnection,
        form: &RouterForm,
        peer_ip: Option<String>,
    ) -> RouterResponseModel {
        let checked_in = match self.check_in(conn, form, peer_ip).await {
            Ok(device) => device,
            Err(e) => return internal_error_response(e),
        };

        let mut response = RouterResponseModel {
            serial: checked_in.serial_number.clone(),
            ..RouterResponseModel::default()
        };

        match self.device_type.communication_procedure {
            CommunicationProcedure::Router | CommunicationProcedure::RouterOneConfig => {
                response.config = checked_in.config.clone();
            }
            CommunicationProcedure::RouterDsa => {
                response.config = checked_in.config.clone();
                response.checksum = checked_in
                    .config_checksum
                    .clone()
                    .or_else(|| checked_in.config.as_deref().map(sha256_hex));
            }
            _ => {}
        }

        response
    }

    pub async fn process_flex_edge(
        &self,
        conn: &mut AsyncPgConnection,
        form: &RouterForm,
        peer_ip: Option<String>,
    ) -> FlexEdgeResponseModel {
        match self.check_in(conn, form, peer_ip).await {
            Ok(device) => FlexEdgeResponseModel {
                serial: device.serial_number,
                ..FlexEdgeResponseModel::default()
            },
            Err(e) => internal_error_response(e),
        }
    }

    /// Resolves (or creates) the device by serial and records the reported
    /// state: firmware, GSM data, uptime, addresses, counters.
    async fn check_in(
        &self,
        conn: &mut AsyncPgConnection,
        form: &RouterForm,
        peer_ip: Option<String>,
    ) -> Result<Device, diesel::result::Error> {
        use crate::db::schema::device::dsl as device_dsl;

        // Guaranteed non-empty by validation.
        let serial = form.serial.as_deref().unwrap_or_default();

        let existing = find_device_by_serial(conn, self.device_type.id, serial).await?;

        let device_id = match existing {
            Some(device) => device.id,
            None => {
                info!(
                    "Unknown router '{}' checking in for device type '{}'; creating device",
                    serial, self.device_type.name
                );
                let new_device = NewDevice {
                    name: serial.to_string(),
                    uuid: None,
                    device_type: self.device_type.id,
                    enabled: true,
                    password_hash: None,
                    certificate_subject: None,
                    serial_number: Some(serial.to_string()),
                    config: None,
                    vpn_ip: None,
                    virtual_ip: None,
                };
                let created: Device = diesel::insert_into(device_dsl::device)
                    .values(&new_device)
                    .returning(Device::as_returning())
                    .get_result(conn)
                    .await?;
                created.id
            }
        };

        let last_ip = form.cellular1_ip.clone().or(peer_ip);

        let updated: Device = diesel::update(device_dsl::device.find(device_id))
            .set((
                device_dsl::firmware_version_1.eq(form.firmware.clone()),
                device_dsl::model.eq(form.model.clone()),
                device_dsl::imsi.eq(form.imsi.clone()),
                device_dsl::uptime.eq(form.router_uptime.clone()),
                device_dsl::last_ip.eq(last_ip),
                device_dsl::last_communication_at.eq(Some(Utc::now().naive_utc())),
                device_dsl::connections_count.eq(device_dsl::connections_count + 1),
            ))
            .returning(Device::as_returning())
            .get_result(conn)
            .await?;

        secrets::process_auto_generation_or_renew(conn, &updated, self.encryption_key).await?;

        Ok(updated)
    }
}
