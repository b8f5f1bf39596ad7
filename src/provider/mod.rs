use std::collections::BTreeMap;

use thiserror::Error;

use crate::http_client::HttpClientError;

pub mod model;
pub mod opnsense;

pub use model::{
    FirewallRuleConfiguration, FirewallRuleConfigurationCollection, Protocol, VpnConnectedClient,
    VpnCscConfiguration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One structured log entry: a translation key plus its variables.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogModel {
    pub level: LogLevel,
    pub message: String,
    pub variables: BTreeMap<String, String>,
}

/// Accumulator for partial failures across provider operations. One request
/// can report several independent sub-failures instead of failing fast on
/// the first.
#[derive(Debug, Default)]
pub struct LogsCollector {
    logs: Vec<LogModel>,
}

impl LogsCollector {
    pub fn new() -> Self {
        LogsCollector::default()
    }

    pub fn add_info(&mut self, message: &str, variables: &[(&str, String)]) -> LogModel {
        self.add(LogLevel::Info, message, variables)
    }

    pub fn add_warning(&mut self, message: &str, variables: &[(&str, String)]) -> LogModel {
        self.add(LogLevel::Warning, message, variables)
    }

    pub fn add_error(&mut self, message: &str, variables: &[(&str, String)]) -> LogModel {
        self.add(LogLevel::Error, message, variables)
    }

    fn add(&mut self, level: LogLevel, message: &str, variables: &[(&str, String)]) -> LogModel {
        let log = LogModel {
            level,
            message: message.to_string(),
            variables: variables
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        };
        self.logs.push(log.clone());
        log
    }

    /// Records an outbound HTTP failure under its own log message key.
    pub fn add_http_error(&mut self, error: &HttpClientError) -> LogModel {
        let log = LogModel {
            level: LogLevel::Error,
            message: error.log_message.to_string(),
            variables: error.log_message_variables.clone(),
        };
        self.logs.push(log.clone());
        log
    }

    pub fn logs(&self) -> &[LogModel] {
        &self.logs
    }

    pub fn take_logs(&mut self) -> Vec<LogModel> {
        std::mem::take(&mut self.logs)
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}

/// Failed provider operation. The failure has already been recorded in the
/// request's `LogsCollector`; the carried entry is the one that caused the
/// abort.
#[derive(Debug, Error)]
#[error("provider operation failed: {}", log.message)]
pub struct ProviderError {
    pub log: LogModel,
}

impl ProviderError {
    pub fn new(log: LogModel) -> Self {
        ProviderError { log }
    }
}

/// Abstraction over the external VPN/firewall control plane.
///
/// Every fallible operation records its failure into the passed collector
/// before returning `Err`, so callers can apply partial success and report
/// all collected entries at the end.
pub trait VpnProvider {
    /// Hash of the CSC configuration as the provider would deploy it. Stored
    /// alongside the device so drift can be detected without re-adding
    /// unchanged entries.
    fn vpn_csc_configuration_hash(&self, configuration: &VpnCscConfiguration) -> String;

    async fn vpn_connected_clients(
        &self,
        logs: &mut LogsCollector,
    ) -> Result<Vec<VpnConnectedClient>, ProviderError>;

    async fn update_vpn_server_crl(
        &self,
        server_description: &str,
        crl_content_pem: &str,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError>;

    async fn vpn_server_name_by_description(
        &self,
        server_description: &str,
        logs: &mut LogsCollector,
    ) -> Result<String, ProviderError>;

    async fn is_csc_in_vpn_server(
        &self,
        csc_common_name: &str,
        logs: &mut LogsCollector,
    ) -> Result<bool, ProviderError>;

    async fn add_csc_in_vpn_server(
        &self,
        configuration: &VpnCscConfiguration,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError>;

    async fn delete_csc_in_vpn_server(
        &self,
        csc_common_name: &str,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError>;

    async fn firewall_rules(
        &self,
        logs: &mut LogsCollector,
    ) -> Result<FirewallRuleConfigurationCollection, ProviderError>;

    /// Returns the provider-assigned rule identifier.
    async fn add_firewall_rule(
        &self,
        rule: &FirewallRuleConfiguration,
        logs: &mut LogsCollector,
    ) -> Result<String, ProviderError>;

    async fn delete_firewall_rule(
        &self,
        rule: &FirewallRuleConfiguration,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_accumulates_and_takes() {
        let mut logs = LogsCollector::new();
        logs.add_info("log.test.first", &[("key", "value".to_string())]);
        let error = logs.add_error("log.test.second", &[]);

        assert_eq!(logs.logs().len(), 2);
        assert_eq!(error.message, "log.test.second");
        assert_eq!(error.level, LogLevel::Error);

        let taken = logs.take_logs();
        assert_eq!(taken.len(), 2);
        assert!(logs.logs().is_empty());
    }

    #[test]
    fn collector_records_http_errors_under_their_key() {
        let mut logs = LogsCollector::new();
        let error = HttpClientError {
            log_message: crate::http_client::LOG_FORBIDDEN,
            log_message_variables: [("service".to_string(), "OPNsense".to_string())]
                .into_iter()
                .collect(),
        };

        let log = logs.add_http_error(&error);
        assert_eq!(log.message, "log.httpClient.forbidden");
        assert_eq!(log.variables.get("service").map(String::as_str), Some("OPNsense"));
    }
}
