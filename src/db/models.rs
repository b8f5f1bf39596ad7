use chrono::NaiveDateTime;
use diesel::prelude::*;

use diesel_derive_enum::DbEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::AuthenticationMethod"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationMethod {
    None,
    Basic,
    Digest,
    X509,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::CredentialsSource"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum CredentialsSource {
    Secret,
    UserIfSecretMissing,
    X509,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::CommunicationProcedure"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum CommunicationProcedure {
    None,
    Router,
    RouterOneConfig,
    RouterDsa,
    FlexEdge,
    EdgeGateway,
    VpnContainerClient,
}

impl CommunicationProcedure {
    /// Procedures served by the shared router config endpoint.
    pub fn is_router_family(self) -> bool {
        matches!(
            self,
            CommunicationProcedure::Router
                | CommunicationProcedure::RouterOneConfig
                | CommunicationProcedure::RouterDsa
                | CommunicationProcedure::FlexEdge
        )
    }

    /// Whether firmware downloads for this procedure require device authentication.
    pub fn is_firmware_secured(self) -> bool {
        matches!(self, CommunicationProcedure::EdgeGateway)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::FieldRequirement"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum FieldRequirement {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::ConfigFormat"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum ConfigFormat {
    Json,
    Xml,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::SecretRenewalPolicy"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum SecretRenewalPolicy {
    None,
    Generate,
    Renew,
    GenerateRenew,
}

impl SecretRenewalPolicy {
    pub fn allows_generate(self) -> bool {
        matches!(
            self,
            SecretRenewalPolicy::Generate | SecretRenewalPolicy::GenerateRenew
        )
    }

    pub fn allows_renew(self) -> bool {
        matches!(
            self,
            SecretRenewalPolicy::Renew | SecretRenewalPolicy::GenerateRenew
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::SecretLogAction"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum SecretLogAction {
    Generated,
    Renewed,
    Edited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::MaintenanceKind"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum MaintenanceKind {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, serde::Serialize, serde::Deserialize)]
#[ExistingTypePath = "crate::db::schema::sql_types::MaintenanceStatus"]
#[DbValueStyle = "snake_case"]
#[serde(rename_all = "camelCase")]
pub enum MaintenanceStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl MaintenanceStatus {
    /// pending -> inProgress -> success|failed
    pub fn can_transition_to(self, next: MaintenanceStatus) -> bool {
        matches!(
            (self, next),
            (MaintenanceStatus::Pending, MaintenanceStatus::InProgress)
                | (MaintenanceStatus::InProgress, MaintenanceStatus::Success)
                | (MaintenanceStatus::InProgress, MaintenanceStatus::Failed)
        )
    }
}

// -----------------------------
// Models
// -----------------------------

// device_type
#[derive(
    Debug,
    Clone,
    Identifiable,
    Queryable,
    Selectable,
    AsChangeset,
    serde::Serialize,
    serde::Deserialize,
)]
#[diesel(table_name = crate::db::schema::device_type)]
pub struct DeviceType {
    pub id: i32,
    pub name: String,
    pub slug: String,
    pub authentication_method: AuthenticationMethod,
    pub credentials_source: Option<CredentialsSource>,
    pub communication_procedure: CommunicationProcedure,
    pub field_serial_number: FieldRequirement,
    pub field_imsi: FieldRequirement,
    pub field_model: FieldRequirement,
    pub field_registration_id: FieldRequirement,
    pub field_hardware_version: FieldRequirement,
    pub has_vpn: bool,
    pub is_device_to_network_available: bool,
    pub firmware_name_1: Option<String>,
    pub firmware_name_2: Option<String>,
    pub firmware_name_3: Option<String>,
    pub config_format_1: Option<ConfigFormat>,
    pub config_format_2: Option<ConfigFormat>,
    pub config_format_3: Option<ConfigFormat>,
}

#[derive(Debug, Clone, Insertable, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::device_type)]
pub struct NewDeviceType {
    pub name: String,
    pub slug: String,
    pub authentication_method: AuthenticationMethod,
    pub credentials_source: Option<CredentialsSource>,
    pub communication_procedure: CommunicationProcedure,
    pub field_serial_number: FieldRequirement,
    pub field_imsi: FieldRequirement,
    pub field_model: FieldRequirement,
    pub field_registration_id: FieldRequirement,
    pub field_hardware_version: FieldRequirement,
    pub has_vpn: bool,
    pub is_device_to_network_available: bool,
    pub firmware_name_1: Option<String>,
    pub firmware_name_2: Option<String>,
    pub firmware_name_3: Option<String>,
    pub config_format_1: Option<ConfigFormat>,
    pub config_format_2: Option<ConfigFormat>,
    pub config_format_3: Option<ConfigFormat>,
}

#[derive(Debug, Clone, AsChangeset, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::device_type)]
pub struct UpdateDeviceType {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub authentication_method: Option<AuthenticationMethod>,
    pub credentials_source: Option<Option<CredentialsSource>>,
    pub communication_procedure: Option<CommunicationProcedure>,
    pub field_serial_number: Option<FieldRequirement>,
    pub field_imsi: Option<FieldRequirement>,
    pub field_model: Option<FieldRequirement>,
    pub field_registration_id: Option<FieldRequirement>,
    pub field_hardware_version: Option<FieldRequirement>,
    pub has_vpn: Option<bool>,
    pub is_device_to_network_available: Option<bool>,
    pub firmware_name_1: Option<Option<String>>,
    pub firmware_name_2: Option<Option<String>>,
    pub firmware_name_3: Option<Option<String>>,
    pub config_format_1: Option<Option<ConfigFormat>>,
    pub config_format_2: Option<Option<ConfigFormat>>,
    pub config_format_3: Option<Option<ConfigFormat>>,
}

// device
#[derive(
    Debug,
    Clone,
    Identifiable,
    Queryable,
    Selectable,
    Associations,
    AsChangeset,
    serde::Serialize,
    serde::Deserialize,
)]
#[diesel(table_name = crate::db::schema::device)]
#[diesel(belongs_to(DeviceType, foreign_key = device_type))]
pub struct Device {
    pub id: i32,
    pub name: String,
    pub uuid: Option<String>,
    pub device_type: i32,
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub certificate_subject: Option<String>,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub imsi: Option<String>,
    pub firmware_version_1: Option<String>,
    pub firmware_version_2: Option<String>,
    pub firmware_version_3: Option<String>,
    pub uptime: Option<String>,
    pub last_ip: Option<String>,
    pub last_communication_at: Option<NaiveDateTime>,
    pub connections_count: i32,
    pub config: Option<String>,
    pub config_checksum: Option<String>,
    pub vpn_ip: Option<String>,
    pub virtual_ip: Option<String>,
    pub csc_hash: Option<String>,
    pub connection_firewall_rules: Option<String>,
    pub vpn_traffic_in: i64,
    pub vpn_traffic_out: i64,
}

impl Device {
    /// Stored remote firewall rule identifiers for the open device connection.
    pub fn firewall_rule_identifiers(&self) -> Vec<String> {
        match &self.connection_firewall_rules {
            Some(raw) if !raw.is_empty() => raw.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Insertable, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::device)]
pub struct NewDevice {
    pub name: String,
    pub uuid: Option<String>,
    pub device_type: i32,
    pub enabled: bool,
    pub password_hash: Option<String>,
    pub certificate_subject: Option<String>,
    pub serial_number: Option<String>,
    pub config: Option<String>,
    pub vpn_ip: Option<String>,
    pub virtual_ip: Option<String>,
}

#[derive(Debug, Clone, Default, AsChangeset, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::device)]
pub struct UpdateDevice {
    pub name: Option<String>,
    pub device_type: Option<i32>,
    pub enabled: Option<bool>,
    pub password_hash: Option<Option<String>>,
    pub certificate_subject: Option<Option<String>>,
    pub serial_number: Option<Option<String>>,
    pub model: Option<Option<String>>,
    pub imsi: Option<Option<String>>,
    pub firmware_version_1: Option<Option<String>>,
    pub firmware_version_2: Option<Option<String>>,
    pub firmware_version_3: Option<Option<String>>,
    pub uptime: Option<Option<String>>,
    pub last_ip: Option<Option<String>>,
    pub last_communication_at: Option<Option<NaiveDateTime>>,
    pub connections_count: Option<i32>,
    pub config: Option<Option<String>>,
    pub config_checksum: Option<Option<String>>,
    pub vpn_ip: Option<Option<String>>,
    pub virtual_ip: Option<Option<String>>,
    pub csc_hash: Option<Option<String>>,
    pub connection_firewall_rules: Option<Option<String>>,
    pub vpn_traffic_in: Option<i64>,
    pub vpn_traffic_out: Option<i64>,
}

// device_type_secret
#[derive(
    Debug,
    Clone,
    Identifiable,
    Queryable,
    Selectable,
    Associations,
    AsChangeset,
    serde::Serialize,
    serde::Deserialize,
)]
#[diesel(table_name = crate::db::schema::device_type_secret)]
#[diesel(belongs_to(DeviceType, foreign_key = device_type))]
pub struct DeviceTypeSecret {
    pub id: i32,
    pub device_type: i32,
    pub name: String,
    pub renewal_policy: SecretRenewalPolicy,
    pub manual_edit: bool,
    pub is_credential: bool,
}

#[derive(Debug, Clone, Insertable, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::device_type_secret)]
pub struct NewDeviceTypeSecret {
    pub device_type: i32,
    pub name: String,
    pub renewal_policy: SecretRenewalPolicy,
    pub manual_edit: bool,
    pub is_credential: bool,
}

// device_secret
#[derive(Debug, Clone, Identifiable, Queryable, Selectable, Associations, AsChangeset)]
#[diesel(table_name = crate::db::schema::device_secret)]
#[diesel(belongs_to(Device, foreign_key = device))]
#[diesel(belongs_to(DeviceTypeSecret, foreign_key = device_type_secret))]
pub struct DeviceSecret {
    pub id: i32,
    pub device: i32,
    pub device_type_secret: i32,
    pub value: Option<Vec<u8>>,
    pub force_renewal: bool,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::device_secret)]
pub struct NewDeviceSecret {
    pub device: i32,
    pub device_type_secret: i32,
    pub value: Option<Vec<u8>>,
    pub force_renewal: bool,
    pub updated_at: NaiveDateTime,
}

// secret_log
#[derive(Debug, Clone, Identifiable, Queryable, Selectable, Associations, serde::Serialize)]
#[diesel(table_name = crate::db::schema::secret_log)]
#[diesel(belongs_to(DeviceSecret, foreign_key = device_secret))]
pub struct SecretLog {
    pub id: i32,
    pub device_secret: i32,
    pub action: SecretLogAction,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::secret_log)]
pub struct NewSecretLog {
    pub device_secret: i32,
    pub action: SecretLogAction,
    pub created_at: NaiveDateTime,
}

// device_failed_login_attempt
#[derive(Debug, Clone, Identifiable, Queryable, Selectable, serde::Serialize)]
#[diesel(table_name = crate::db::schema::device_failed_login_attempt)]
pub struct DeviceFailedLoginAttempt {
    pub id: i32,
    pub device_type: Option<i32>,
    pub username: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::device_failed_login_attempt)]
pub struct NewDeviceFailedLoginAttempt {
    pub device_type: Option<i32>,
    pub username: String,
    pub created_at: NaiveDateTime,
}

// firmware
#[derive(
    Debug,
    Clone,
    Identifiable,
    Queryable,
    Selectable,
    Associations,
    AsChangeset,
    serde::Serialize,
    serde::Deserialize,
)]
#[diesel(table_name = crate::db::schema::firmware)]
#[diesel(belongs_to(DeviceType, foreign_key = device_type))]
pub struct Firmware {
    pub id: i32,
    pub device_type: i32,
    pub uuid: String,
    pub filename: String,
    pub version: String,
}

#[derive(Debug, Clone, Insertable, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::firmware)]
pub struct NewFirmware {
    pub device_type: i32,
    pub uuid: String,
    pub filename: String,
    pub version: String,
}

// maintenance
#[derive(
    Debug,
    Clone,
    Identifiable,
    Queryable,
    Selectable,
    AsChangeset,
    serde::Serialize,
    serde::Deserialize,
)]
#[diesel(table_name = crate::db::schema::maintenance)]
pub struct Maintenance {
    pub id: i32,
    pub kind: MaintenanceKind,
    pub status: MaintenanceStatus,
    pub filepath: Option<String>,
    pub backup_database: bool,
    pub backup_filestorage: bool,
    pub scheduled_backup: bool,
    pub maintenance_schedule: Option<i32>,
    pub created_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::maintenance)]
pub struct NewMaintenance {
    pub kind: MaintenanceKind,
    pub status: MaintenanceStatus,
    pub filepath: Option<String>,
    pub backup_database: bool,
    pub backup_filestorage: bool,
    pub scheduled_backup: bool,
    pub maintenance_schedule: Option<i32>,
    pub created_at: NaiveDateTime,
}

// maintenance_schedule
#[derive(
    Debug,
    Clone,
    Identifiable,
    Queryable,
    Selectable,
    AsChangeset,
    serde::Serialize,
    serde::Deserialize,
)]
#[diesel(table_name = crate::db::schema::maintenance_schedule)]
pub struct MaintenanceSchedule {
    pub id: i32,
    pub name: String,
    pub enabled: bool,
    pub backup_database: bool,
    pub backup_filestorage: bool,
    pub day_of_month: i32,
    pub day_of_week: i32,
    pub hour: i32,
    pub minute: i32,
    pub next_job_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Insertable, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::maintenance_schedule)]
pub struct NewMaintenanceSchedule {
    pub name: String,
    pub enabled: bool,
    pub backup_database: bool,
    pub backup_filestorage: bool,
    pub day_of_month: i32,
    pub day_of_week: i32,
    pub hour: i32,
    pub minute: i32,
    pub next_job_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, AsChangeset, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = crate::db::schema::maintenance_schedule)]
pub struct UpdateMaintenanceSchedule {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub backup_database: Option<bool>,
    pub backup_filestorage: Option<bool>,
    pub day_of_month: Option<i32>,
    pub day_of_week: Option<i32>,
    pub hour: Option<i32>,
    pub minute: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_status_transitions() {
        assert!(MaintenanceStatus::Pending.can_transition_to(MaintenanceStatus::InProgress));
        assert!(MaintenanceStatus::InProgress.can_transition_to(MaintenanceStatus::Success));
        assert!(MaintenanceStatus::InProgress.can_transition_to(MaintenanceStatus::Failed));
        assert!(!MaintenanceStatus::Pending.can_transition_to(MaintenanceStatus::Success));
        assert!(!MaintenanceStatus::Success.can_transition_to(MaintenanceStatus::InProgress));
        assert!(!MaintenanceStatus::Failed.can_transition_to(MaintenanceStatus::Pending));
    }

    #[test]
    fn firewall_rule_identifiers_splits_stored_value() {
        let mut device = sample_device();
        assert!(device.firewall_rule_identifiers().is_empty());

        device.connection_firewall_rules = Some("aa11,bb22".to_string());
        assert_eq!(device.firewall_rule_identifiers(), vec!["aa11", "bb22"]);
    }

    fn sample_device() -> Device {
        Device {
            id: 1,
            name: "router-1".to_string(),
            uuid: None,
            device_type: 1,
            enabled: true,
            password_hash: None,
            certificate_subject: None,
            serial_number: None,
            model: None,
            imsi: None,
            firmware_version_1: None,
            firmware_version_2: None,
            firmware_version_3: None,
            uptime: None,
            last_ip: None,
            last_communication_at: None,
            connections_count: 0,
            config: None,
            config_checksum: None,
            vpn_ip: None,
            virtual_ip: None,
            csc_hash: None,
            connection_firewall_rules: None,
            vpn_traffic_in: 0,
            vpn_traffic_out: 0,
        }
    }
}
