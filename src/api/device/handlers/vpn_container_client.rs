use chrono::Utc;
use diesel::ExpressionMethods;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use log::{error, info, warn};
use uuid::Uuid;

use crate::api::device::dispatch::internal_error_response;
use crate::api::device::forms::{
    ValidationError, VpnContainerClientLogsForm, VpnContainerClientRegisterForm,
    validation_errors_message,
};
use crate::api::device::handlers::find_device_by_uuid;
use crate::api::device::response::{ResponseModel, VpnContainerClientResponseModel};
use crate::db::models::{Device, DeviceType, NewDevice};
use crate::service::secrets;
use crate::service::vpn::VpnSettings;

pub struct VpnContainerClientCommunication<'a> {
    pub device_type: &'a DeviceType,
    pub encryption_key: &'a [u8],
    pub vpn_settings: &'a VpnSettings,
}

impl VpnContainerClientCommunication<'_> {
    pub fn prepare_error_response(
        &self,
        errors: &[ValidationError],
    ) -> VpnContainerClientResponseModel {
        let mut response = VpnContainerClientResponseModel::default();
        response.set_error(&validation_errors_message(errors));
        response
    }

    pub async fn process_register(
        &self,
        conn: &mut AsyncPgConnection,
        form: &VpnContainerClientRegisterForm,
    ) -> VpnContainerClientResponseModel {
        match self.process_register_inner(conn, form).await {
            Ok(response) => response,
            Err(e) => internal_error_response(e),
        }
    }

    async fn process_register_inner(
        &self,
        conn: &mut AsyncPgConnection,
        form: &VpnContainerClientRegisterForm,
    ) -> Result<VpnContainerClientResponseModel, diesel::result::Error> {
        use crate::db::schema::device::dsl as device_dsl;

        let mut response = VpnContainerClientResponseModel {
            name: form.name.clone(),
            uuid: form.uuid.clone(),
            ..VpnContainerClientResponseModel::default()
        };

        if let Some(requested_uuid) = form.uuid.as_deref().filter(|uuid| !uuid.is_empty()) {
            let Some(registered) =
                find_device_by_uuid(conn, self.device_type.id, requested_uuid).await?
            else {
                // A stale uuid means the client has to start over.
                response.set_error("VPN Container Client cannot be found - register without UUID");
                response.clear_uuid = true;
                response.uuid = None;
                warn!(
                    "VPN container client register with unknown uuid '{}' for device type '{}'",
                    requested_uuid, self.device_type.name
                );
                return Ok(response);
            };

            let updated = self.update_last_data(conn, registered.id).await?;
            response.name = Some(updated.name);
            response.uuid = updated.uuid;
            return Ok(response);
        }

        // Guaranteed non-empty by validation.
        let name = form.name.as_deref().unwrap_or_default();
        let assigned_uuid = Uuid::new_v4().to_string();

        info!(
            "Registering new VPN container client '{}' for device type '{}'",
            name, self.device_type.name
        );

        let new_device = NewDevice {
            name: name.to_string(),
            uuid: Some(assigned_uuid),
            device_type: self.device_type.id,
            enabled: true,
            password_hash: None,
            certificate_subject: None,
            serial_number: Some(form.serial_number.clone().unwrap_or_else(|| name.to_string())),
            config: None,
            vpn_ip: None,
            virtual_ip: None,
        };
        let created: Device = diesel::insert_into(device_dsl::device)
            .values(&new_device)
            .returning(Device::as_returning())
            .get_result(conn)
            .await?;

        let updated = self.update_last_data(conn, created.id).await?;
        response.name = Some(updated.name);
        response.uuid = updated.uuid;
        Ok(response)
    }

    pub async fn process_configuration(
        &self,
        conn: &mut AsyncPgConnection,
        requested_uuid: &str,
    ) -> VpnContainerClientResponseModel {
        match self.process_configuration_inner(conn, requested_uuid).await {
            Ok(response) => response,
            Err(e) => internal_error_response(e),
        }
    }

    async fn process_configuration_inner(
        &self,
        conn: &mut AsyncPgConnection,
        requested_uuid: &str,
    ) -> Result<VpnContainerClientResponseModel, diesel::result::Error> {
        let mut response = VpnContainerClientResponseModel {
            uuid: Some(requested_uuid.to_string()),
            ..VpnContainerClientResponseModel::default()
        };

        let Some(registered) = find_device_by_uuid(conn, self.device_type.id, requested_uuid).await?
        else {
            response.set_error(&format!(
                "VPN Container Client with identifier = '{requested_uuid}' not found"
            ));
            response.unregister = true;
            return Ok(response);
        };

        let checked_in = self.update_last_data(conn, registered.id).await?;

        if !checked_in.enabled {
            warn!("Disabled VPN container client '{}' requested configuration", checked_in.name);
            response.set_error(&format!(
                "VPN Container Client with identifier = '{requested_uuid}' is disabled"
            ));
            return Ok(response);
        }

        let Some(vpn_ip) = checked_in.vpn_ip.as_deref() else {
            warn!(
                "VPN container client '{}' has no OpenVPN IP address assigned",
                checked_in.name
            );
            response.set_error(&format!(
                "VPN Container Client with identifier = '{requested_uuid}' doesn't have OpenVPN IP address assigned"
            ));
            return Ok(response);
        };

        secrets::process_auto_generation_or_renew(conn, &checked_in, self.encryption_key).await?;

        let openvpn = parse_openvpn_configuration(checked_in.config.as_deref().unwrap_or_default());
        if openvpn.len() < 2 {
            error!(
                "VPN container client '{}' has an invalid OpenVPN configuration",
                checked_in.name
            );
        }

        let mut nat = Vec::new();
        match checked_in.virtual_ip.as_deref() {
            Some(virtual_ip) => nat.push(serde_json::json!({
                "source": virtual_ip,
                "destination": vpn_ip,
            })),
            None => warn!(
                "VPN container client '{}' has no virtual IP address assigned",
                checked_in.name
            ),
        }

        let routes = serde_json::json!([
            {
                "host": self.vpn_settings.devices_vpn_gateway,
                "device": "openvpn",
            },
            {
                "network": self.vpn_settings.technicians_vpn_network,
                "gateway": self.vpn_settings.devices_vpn_gateway,
            },
        ]);

        response.configuration = Some(serde_json::json!({
            "openvpn": serde_json::Value::Object(openvpn),
            "nat": nat,
            "routes": routes,
        }));
        response.name = Some(checked_in.name);
        response.uuid = checked_in.uuid;

        Ok(response)
    }

    pub async fn process_send_logs(
        &self,
        conn: &mut AsyncPgConnection,
        requested_uuid: &str,
        form: &VpnContainerClientLogsForm,
    ) -> VpnContainerClientResponseModel {
        match self.process_send_logs_inner(conn, requested_uuid, form).await {
            Ok(response) => response,
            Err(e) => internal_error_response(e),
        }
    }

    async fn process_send_logs_inner(
        &self,
        conn: &mut AsyncPgConnection,
        requested_uuid: &str,
        form: &VpnContainerClientLogsForm,
    ) -> Result<VpnContainerClientResponseModel, diesel::result::Error> {
        let mut response = VpnContainerClientResponseModel {
            uuid: Some(requested_uuid.to_string()),
            ..VpnContainerClientResponseModel::default()
        };

        let Some(registered) = find_device_by_uuid(conn, self.device_type.id, requested_uuid).await?
        else {
            response.set_error(&format!(
                "VPN Container Client with identifier = '{requested_uuid}' not found"
            ));
            response.unregister = true;
            return Ok(response);
        };

        let checked_in = self.update_last_data(conn, registered.id).await?;

        for entry in form.logs.iter().flatten() {
            info!(
                "Device log from '{}' [{}]: {}",
                checked_in.name,
                entry.level.as_deref().unwrap_or("info"),
                entry.message
            );
        }

        response.uuid = checked_in.uuid;
        Ok(response)
    }

    async fn update_last_data(
        &self,
        conn: &mut AsyncPgConnection,
        device_id: i32,
    ) -> Result<Device, diesel::result::Error> {
        use crate::db::schema::device::dsl as device_dsl;

        diesel::update(device_dsl::device.find(device_id))
            .set((
                device_dsl::last_communication_at.eq(Some(Utc::now().naive_utc())),
                device_dsl::connections_count.eq(device_dsl::connections_count + 1),
            ))
            .returning(Device::as_returning())
            .get_result(conn)
            .await
    }
}

const PEM_ARMORED_KEYS: [(&str, &str); 4] = [
    ("ca", "CERTIFICATE"),
    ("cert", "CERTIFICATE"),
    ("key", "PRIVATE KEY"),
    ("tls-auth", "OpenVPN Static key V1"),
];

/// Parses an OpenVPN configuration text into a key/value document: plain
/// directives become string (or `true`) entries, `<tag>` blocks are inlined,
/// PEM armor is stripped from the ca/cert/key/tls-auth entries and CA chains
/// are split into arrays.
pub fn parse_openvpn_configuration(
    openvpn_configuration: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut config = serde_json::Map::new();
    let mut tag: Option<String> = None;

    for line in openvpn_configuration.lines() {
        let line = line.trim();
        if line.len() <= 1 || line.starts_with('#') {
            continue;
        }

        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        let (first_token, value) = match line.split_once(' ') {
            Some((first_token, value)) => (first_token.to_lowercase(), Some(value.to_string())),
            None => (line.to_lowercase(), None),
        };

        if let Some(open_tag) = &tag {
            if first_token == format!("</{open_tag}>") {
                tag = None;
            } else if let Some(serde_json::Value::String(content)) = config.get_mut(open_tag) {
                content.push_str(&line);
            }
            continue;
        }

        if first_token.starts_with('<') && first_token.ends_with('>') {
            let tag_name = first_token
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string();
            config.insert(tag_name.clone(), serde_json::Value::String(String::new()));
            tag = Some(tag_name);
            continue;
        }

        let entry = match value {
            Some(value) => serde_json::Value::String(value),
            None => serde_json::Value::Bool(true),
        };
        config.insert(first_token, entry);
    }

    // Some clients pack the remote protocol into the remote directive.
    if !config.contains_key("proto") {
        let rewritten_remote = if let Some(serde_json::Value::String(remote)) = config.get("remote")
        {
            let remote_parts: Vec<&str> = remote.split(' ').collect();
            if 3 == remote_parts.len() {
                let (host, port, proto) = (remote_parts[0], remote_parts[1], remote_parts[2]);
                Some((format!("{host} {port}"), proto.to_string()))
            } else {
                None
            }
        } else {
            None
        };
        if let Some((remote, proto)) = rewritten_remote {
            config.insert("remote".to_string(), serde_json::Value::String(remote));
            config.insert("proto".to_string(), serde_json::Value::String(proto));
        }
    }

    for (key, armor_label) in PEM_ARMORED_KEYS {
        let Some(serde_json::Value::String(content)) = config.get(key) else {
            continue;
        };

        let stripped = strip_pem_armor(content.trim(), armor_label);
        config.insert(key.to_string(), serde_json::Value::String(stripped));
    }

    // A CA entry may carry a whole chain; split it into separate entries.
    if let Some(serde_json::Value::String(ca)) = config.get("ca") {
        const CHAIN_SEPARATOR: &str = "-----END CERTIFICATE----------BEGIN CERTIFICATE-----";
        if ca.contains(CHAIN_SEPARATOR) {
            let chain: Vec<serde_json::Value> = ca
                .split(CHAIN_SEPARATOR)
                .map(|item| serde_json::Value::String(item.to_string()))
                .collect();
            config.insert("ca".to_string(), serde_json::Value::Array(chain));
        }
    }

    config
}

fn strip_pem_armor(content: &str, label: &str) -> String {
    let start = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    match content.strip_prefix(&start).and_then(|rest| rest.strip_suffix(&end)) {
        Some(inner) => inner.to_string(),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_directives_and_flags() {
        let config = parse_openvpn_configuration(
            "client\n\
             dev tun\n\
             # a comment\n\
             remote vpn.example.com 1194 udp\n\
             nobind\n",
        );

        assert_eq!(config.get("client"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(
            config.get("dev"),
            Some(&serde_json::Value::String("tun".to_string()))
        );
        assert_eq!(
            config.get("remote"),
            Some(&serde_json::Value::String("vpn.example.com 1194".to_string()))
        );
        assert_eq!(
            config.get("proto"),
            Some(&serde_json::Value::String("udp".to_string()))
        );
        assert!(!config.contains_key("#"));
    }

    #[test]
    fn inline_blocks_are_captured_and_armor_stripped() {
        let config = parse_openvpn_configuration(
            "client\n\
             <cert>\n\
             -----BEGIN CERTIFICATE-----\n\
             AAAABBBB\n\
             -----END CERTIFICATE-----\n\
             </cert>\n",
        );

        assert_eq!(
            config.get("cert"),
            Some(&serde_json::Value::String("AAAABBBB".to_string()))
        );
    }

    #[test]
    fn ca_chain_is_split_into_array() {
        let config = parse_openvpn_configuration(
            "client\n\
             <ca>\n\
             -----BEGIN CERTIFICATE-----\n\
             FIRST\n\
             -----END CERTIFICATE-----\n\
             -----BEGIN CERTIFICATE-----\n\
             SECOND\n\
             -----END CERTIFICATE-----\n\
             </ca>\n",
        );

        assert_eq!(
            config.get("ca"),
            Some(&serde_json::json!(["FIRST", "SECOND"]))
        );
    }
}
