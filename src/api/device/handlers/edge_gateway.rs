use chrono::Utc;
use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use log::{info, warn};
use uuid::Uuid;

use crate::api::device::dispatch::internal_error_response;
use crate::api::device::forms::{EdgeGatewayForm, ValidationError, validation_errors_message};
use crate::api::device::handlers::find_device_by_serial;
use crate::api::device::response::{EdgeGatewayResponseModel, ResponseModel};
use crate::db::models::{Device, DeviceType, Firmware, NewDevice};
use crate::service::secrets;

pub const COMMAND_UPDATE_FIRMWARE: &str = "updateFirmware";

pub struct EdgeGatewayCommunication<'a> {
    pub device_type: &'a DeviceType,
    pub encryption_key: &'a [u8],
}

impl EdgeGatewayCommunication<'_> {
    pub fn prepare_error_response(&self, errors: &[ValidationError]) -> EdgeGatewayResponseModel {
        let mut response = EdgeGatewayResponseModel::default();
        response.set_error(&validation_errors_message(errors));
        response
    }

    pub async fn process_edge_gateway_request(
        &self,
        conn: &mut AsyncPgConnection,
        form: &EdgeGatewayForm,
        peer_ip: Option<String>,
    ) -> EdgeGatewayResponseModel {
        match self.process_inner(conn, form, peer_ip).await {
            Ok(response) => response,
            Err(e) => internal_error_response(e),
        }
    }

    async fn process_inner(
        &self,
        conn: &mut AsyncPgConnection,
        form: &EdgeGatewayForm,
        peer_ip: Option<String>,
    ) -> Result<EdgeGatewayResponseModel, diesel::result::Error> {
        use crate::db::schema::device::dsl as device_dsl;

        // Guaranteed non-empty by validation.
        let serial = form.serial_number.as_deref().unwrap_or_default();

        let mut response = EdgeGatewayResponseModel {
            serial_number: Some(serial.to_string()),
            ..EdgeGatewayResponseModel::default()
        };

        let existing = find_device_by_serial(conn, self.device_type.id, serial).await?;

        let checked_in = match existing {
            Some(device) => device,
            None => {
                info!(
                    "Unknown edge gateway '{}' checking in for device type '{}'; creating device",
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
                diesel::insert_into(device_dsl::device)
                    .values(&new_device)
                    .returning(Device::as_returning())
                    .get_result(conn)
                    .await?
            }
        };

        if !checked_in.enabled {
            warn!("Disabled edge gateway '{}' attempted check-in", serial);
            response.set_error(&format!("Device '{serial}' is disabled"));
            return Ok(response);
        }

        // Command status reported back by the device closes the loop on a
        // previously issued command.
        if let (Some(transaction_id), Some(command_status)) =
            (&form.command_transaction_id, &form.command_status)
        {
            match form.command_error.as_deref() {
                Some(command_error) if !command_error.is_empty() => warn!(
                    "Edge gateway '{}' reported command {} as {}: {}",
                    serial, transaction_id, command_status, command_error
                ),
                _ => info!(
                    "Edge gateway '{}' reported command {} as {}",
                    serial, transaction_id, command_status
                ),
            }
        }

        let updated: Device = diesel::update(device_dsl::device.find(checked_in.id))
            .set((
                device_dsl::firmware_version_1.eq(form.firmware1.clone()),
                device_dsl::firmware_version_2.eq(form.firmware2.clone()),
                device_dsl::firmware_version_3.eq(form.firmware3.clone()),
                device_dsl::model.eq(form.model.clone()),
                device_dsl::uptime.eq(form.uptime.clone()),
                device_dsl::last_ip.eq(peer_ip),
                device_dsl::last_communication_at.eq(Some(Utc::now().naive_utc())),
                device_dsl::connections_count.eq(device_dsl::connections_count + 1),
            ))
            .returning(Device::as_returning())
            .get_result(conn)
            .await?;

        secrets::process_auto_generation_or_renew(conn, &updated, self.encryption_key).await?;

        self.process_firmware(conn, form, &mut response).await?;

        if form.request_config_data.unwrap_or(false) {
            response.config = updated.config.clone();
        }

        Ok(response)
    }

    /// Issues an updateFirmware command when the reported slot-1 firmware
    /// version differs from the device type's desired one and a matching
    /// firmware file is registered.
    async fn process_firmware(
        &self,
        conn: &mut AsyncPgConnection,
        form: &EdgeGatewayForm,
        response: &mut EdgeGatewayResponseModel,
    ) -> Result<(), diesel::result::Error> {
        use crate::db::schema::firmware::dsl as firmware_dsl;

        let Some(desired_version) = self.device_type.firmware_name_1.as_deref() else {
            return Ok(());
        };

        if form.firmware1.as_deref() == Some(desired_version) {
            return Ok(());
        }

        let desired_firmware: Option<Firmware> = firmware_dsl::firmware
            .filter(firmware_dsl::device_type.eq(self.device_type.id))
            .filter(firmware_dsl::version.eq(desired_version))
            .order(firmware_dsl::id.desc())
            .select(Firmware::as_select())
            .first(conn)
            .await
            .optional()?;

        let Some(desired_firmware) = desired_firmware else {
            warn!(
                "Device type '{}' wants firmware '{}' but no firmware file is registered",
                self.device_type.name, desired_version
            );
            return Ok(());
        };

        response.command_name = Some(COMMAND_UPDATE_FIRMWARE.to_string());
        response.command_transaction_id = Some(Uuid::new_v4().to_string());
        response.firmware_url = Some(format!(
            "/download/firmware/{}/{}/{}",
            self.device_type.slug, desired_firmware.uuid, desired_firmware.filename
        ));

        Ok(())
    }
}
