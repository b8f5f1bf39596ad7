use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fmt;

use crate::db::models::{DeviceType, FieldRequirement};

/// Validation group markers. A single form type enforces different
/// required-field sets per device type by unioning protocol markers with the
/// device type's own requirement columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationGroup {
    Default,
    Router,
    EdgeGatewayConfiguration,
    VpnContainerClientLogs,
    SerialNumberRequired,
    ImsiRequired,
    ModelRequired,
    RegistrationIdRequired,
    HardwareVersionRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn required(field: &str) -> Self {
        ValidationError {
            field: field.to_string(),
            message: format!("{field} is required"),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validation_errors_message(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ValidationError::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Extra validation groups from the device type's per-field requirement
/// configuration.
pub fn device_type_validation_groups(device_type: &DeviceType) -> Vec<ValidationGroup> {
    let mut groups = Vec::new();

    let requirements = [
        (
            device_type.field_serial_number,
            ValidationGroup::SerialNumberRequired,
        ),
        (device_type.field_imsi, ValidationGroup::ImsiRequired),
        (device_type.field_model, ValidationGroup::ModelRequired),
        (
            device_type.field_registration_id,
            ValidationGroup::RegistrationIdRequired,
        ),
        (
            device_type.field_hardware_version,
            ValidationGroup::HardwareVersionRequired,
        ),
    ];

    for (requirement, group) in requirements {
        if FieldRequirement::Required == requirement {
            groups.push(group);
        }
    }

    groups
}

/// Effective group set for one request: protocol markers unioned with the
/// device type groups, order preserved, duplicates dropped.
pub fn effective_validation_groups(
    markers: &[ValidationGroup],
    device_type: &DeviceType,
) -> Vec<ValidationGroup> {
    let mut groups = markers.to_vec();
    for group in device_type_validation_groups(device_type) {
        if !groups.contains(&group) {
            groups.push(group);
        }
    }
    groups
}

fn require(
    errors: &mut Vec<ValidationError>,
    value: Option<&String>,
    field: &str,
) {
    if value.is_none_or(|value| value.trim().is_empty()) {
        errors.push(ValidationError::required(field));
    }
}

pub trait ProtocolForm: DeserializeOwned {
    fn validate(&self, groups: &[ValidationGroup]) -> Vec<ValidationError>;
}

/// Router check-in payload. Field names are the exact wire names sent by the
/// routers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterForm {
    #[serde(rename = "Serial")]
    pub serial: Option<String>,
    #[serde(rename = "Firmware")]
    pub firmware: Option<String>,
    #[serde(rename = "agentVersion")]
    pub agent_version: Option<String>,
    #[serde(rename = "Model")]
    pub model: Option<String>,
    #[serde(rename = "CellID")]
    pub cell_id: Option<String>,
    #[serde(rename = "RSRP")]
    pub rsrp: Option<String>,
    #[serde(rename = "IMEI")]
    pub imei: Option<String>,
    #[serde(rename = "IMSI")]
    pub imsi: Option<String>,
    #[serde(rename = "RouterUptime")]
    pub router_uptime: Option<String>,
    #[serde(rename = "OperatorCode")]
    pub operator_code: Option<String>,
    #[serde(rename = "Band")]
    pub band: Option<String>,
    #[serde(rename = "Cellular1_IP")]
    pub cellular1_ip: Option<String>,
    #[serde(rename = "Cellular1_uptime")]
    pub cellular1_uptime: Option<String>,
    #[serde(rename = "Cellular2_IP")]
    pub cellular2_ip: Option<String>,
    #[serde(rename = "Cellular2_uptime")]
    pub cellular2_uptime: Option<String>,
    #[serde(rename = "IPv6Prefix")]
    pub ipv6_prefix: Option<String>,
}

impl ProtocolForm for RouterForm {
    fn validate(&self, groups: &[ValidationGroup]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if groups.contains(&ValidationGroup::Router) {
            require(&mut errors, self.serial.as_ref(), "Serial");
        }
        if groups.contains(&ValidationGroup::SerialNumberRequired) {
            require(&mut errors, self.serial.as_ref(), "Serial");
        }
        if groups.contains(&ValidationGroup::ImsiRequired) {
            require(&mut errors, self.imsi.as_ref(), "IMSI");
        }
        if groups.contains(&ValidationGroup::ModelRequired) {
            require(&mut errors, self.model.as_ref(), "Model");
        }

        errors.dedup();
        errors
    }
}

/// Edge gateway check-in payload (JSON).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeGatewayForm {
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub hardware_version: Option<String>,
    pub registration_id: Option<String>,
    pub firmware1: Option<String>,
    pub firmware2: Option<String>,
    pub firmware3: Option<String>,
    pub uptime: Option<String>,
    pub request_config_data: Option<bool>,
    pub command_transaction_id: Option<String>,
    pub command_status: Option<String>,
    pub command_error: Option<String>,
}

impl ProtocolForm for EdgeGatewayForm {
    fn validate(&self, groups: &[ValidationGroup]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if groups.contains(&ValidationGroup::EdgeGatewayConfiguration) {
            require(&mut errors, self.serial_number.as_ref(), "serialNumber");
        }
        if groups.contains(&ValidationGroup::SerialNumberRequired) {
            require(&mut errors, self.serial_number.as_ref(), "serialNumber");
        }
        if groups.contains(&ValidationGroup::ModelRequired) {
            require(&mut errors, self.model.as_ref(), "model");
        }
        if groups.contains(&ValidationGroup::RegistrationIdRequired) {
            require(&mut errors, self.registration_id.as_ref(), "registrationId");
        }
        if groups.contains(&ValidationGroup::HardwareVersionRequired) {
            require(
                &mut errors,
                self.hardware_version.as_ref(),
                "hardwareVersion",
            );
        }

        errors.dedup();
        errors
    }
}

/// VPN container client registration payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnContainerClientRegisterForm {
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub serial_number: Option<String>,
    pub version: Option<String>,
}

impl ProtocolForm for VpnContainerClientRegisterForm {
    fn validate(&self, groups: &[ValidationGroup]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if groups.contains(&ValidationGroup::Default) {
            require(&mut errors, self.name.as_ref(), "name");
        }
        if groups.contains(&ValidationGroup::SerialNumberRequired) {
            require(&mut errors, self.serial_number.as_ref(), "serialNumber");
        }

        errors
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VpnContainerClientLogEntry {
    pub level: Option<String>,
    pub message: String,
}

/// VPN container client diagnostic logs payload (JSON).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VpnContainerClientLogsForm {
    pub logs: Option<Vec<VpnContainerClientLogEntry>>,
}

impl ProtocolForm for VpnContainerClientLogsForm {
    fn validate(&self, groups: &[ValidationGroup]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if groups.contains(&ValidationGroup::VpnContainerClientLogs)
            && self.logs.as_ref().is_none_or(Vec::is_empty)
        {
            errors.push(ValidationError::required("logs"));
        }

        errors
    }
}

/// Decodes a raw body as an URL-encoded parameter set and binds it into a
/// form. Devices send check-ins with arbitrary content types (e.g.
/// dls/diagnosedata), so the body is re-parsed manually instead of trusting
/// transport content-type detection. Unknown keys are tolerated.
pub fn bind_urlencoded<T: ProtocolForm>(body: &[u8], query: Option<&str>) -> Result<T, String> {
    let mut pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(body).map_err(|error| error.to_string())?;

    if let Some(query) = query {
        let query_pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(query).map_err(|error| error.to_string())?;
        pairs.extend(query_pairs);
    }

    let mut map = serde_json::Map::new();
    for (key, value) in pairs {
        map.insert(key, serde_json::Value::String(value));
    }

    serde_json::from_value(serde_json::Value::Object(map)).map_err(|error| error.to_string())
}

/// Binds a raw JSON body into a form. An empty body counts as a zero-field
/// payload, not an error; missing required fields are caught by validation.
pub fn bind_json<T: ProtocolForm>(body: &[u8]) -> Result<T, String> {
    if body.is_empty() {
        return serde_json::from_value(serde_json::Value::Object(serde_json::Map::new()))
            .map_err(|error| error.to_string());
    }

    serde_json::from_slice(body).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        AuthenticationMethod, CommunicationProcedure, DeviceType, FieldRequirement,
    };

    fn device_type(field_imsi: FieldRequirement) -> DeviceType {
        DeviceType {
            id: 1,
            name: "Test".to_string(),
            slug: "test".to_string(),
            authentication_method: AuthenticationMethod::None,
            credentials_source: None,
            communication_procedure: CommunicationProcedure::Router,
            field_serial_number: FieldRequirement::Optional,
            field_imsi,
            field_model: FieldRequirement::None,
            field_registration_id: FieldRequirement::None,
            field_hardware_version: FieldRequirement::None,
            has_vpn: false,
            is_device_to_network_available: false,
            firmware_name_1: None,
            firmware_name_2: None,
            firmware_name_3: None,
            config_format_1: None,
            config_format_2: None,
            config_format_3: None,
        }
    }

    #[test]
    fn effective_groups_union_device_type_requirements() {
        let groups = effective_validation_groups(
            &[ValidationGroup::Default, ValidationGroup::Router],
            &device_type(FieldRequirement::Required),
        );

        assert_eq!(
            groups,
            vec![
                ValidationGroup::Default,
                ValidationGroup::Router,
                ValidationGroup::ImsiRequired,
            ]
        );
    }

    #[test]
    fn raw_body_reparse_matches_native_form_parse() {
        // A body that transport content-type detection would have skipped
        // must bind identically to a normally form-encoded body.
        let body = b"Serial=R123&Firmware=1.2.3&IMSI=262011234567890&unknownField=x";

        let form: RouterForm = bind_urlencoded(body, None).expect("binds");
        assert_eq!(form.serial.as_deref(), Some("R123"));
        assert_eq!(form.firmware.as_deref(), Some("1.2.3"));
        assert_eq!(form.imsi.as_deref(), Some("262011234567890"));
    }

    #[test]
    fn register_binding_merges_query_parameters() {
        let body = b"name=vcc-1";
        let form: VpnContainerClientRegisterForm =
            bind_urlencoded(body, Some("uuid=11111111-2222-3333-4444-555555555555"))
                .expect("binds");

        assert_eq!(form.name.as_deref(), Some("vcc-1"));
        assert_eq!(
            form.uuid.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    #[test]
    fn router_validation_honors_group_union() {
        let form: RouterForm = bind_urlencoded(b"Serial=R123", None).expect("binds");

        let without_imsi = effective_validation_groups(
            &[ValidationGroup::Default, ValidationGroup::Router],
            &device_type(FieldRequirement::Optional),
        );
        assert!(form.validate(&without_imsi).is_empty());

        let with_imsi = effective_validation_groups(
            &[ValidationGroup::Default, ValidationGroup::Router],
            &device_type(FieldRequirement::Required),
        );
        let errors = form.validate(&with_imsi);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "IMSI");
    }

    #[test]
    fn json_binding_ignores_unknown_keys_and_accepts_empty_body() {
        let body = br#"{"serialNumber": "EG-1", "vendorExtension": {"a": 1}}"#;
        let form: EdgeGatewayForm = bind_json(body).expect("binds");
        assert_eq!(form.serial_number.as_deref(), Some("EG-1"));

        let empty: EdgeGatewayForm = bind_json(b"").expect("binds");
        assert!(empty.serial_number.is_none());
        let errors = empty.validate(&[ValidationGroup::EdgeGatewayConfiguration]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "serialNumber");
    }

    #[test]
    fn logs_form_requires_entries_under_logs_group() {
        let form: VpnContainerClientLogsForm = bind_json(b"{}").expect("binds");
        assert!(form.validate(&[ValidationGroup::Default]).is_empty());
        assert_eq!(
            form.validate(&[ValidationGroup::VpnContainerClientLogs])
                .len(),
            1
        );

        let form: VpnContainerClientLogsForm =
            bind_json(br#"{"logs": [{"level": "info", "message": "started"}]}"#).expect("binds");
        assert!(
            form.validate(&[ValidationGroup::VpnContainerClientLogs])
                .is_empty()
        );
    }
}
