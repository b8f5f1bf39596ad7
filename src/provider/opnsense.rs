use std::time::Duration;

use sha2::{Digest, Sha256};
use url::Url;

use crate::http_client::{HttpClient, HttpClientError};
use crate::provider::model::{
    FirewallRuleConfiguration, FirewallRuleConfigurationCollection, Protocol, VpnConnectedClient,
    VpnCscConfiguration,
};
use crate::provider::{LogsCollector, ProviderError, VpnProvider};

pub const ENDPOINT_CONNECTED_CLIENTS: &str = "vpnsecuritysuite-opnsense/connected-clients.php";
pub const ENDPOINT_CRL: &str = "vpnsecuritysuite-opnsense/crl.php";
pub const ENDPOINT_SERVERS_DATA: &str = "vpnsecuritysuite-opnsense/servers_data.php";
pub const ENDPOINT_CSC_GET_LIST: &str = "vpnsecuritysuite-opnsense/get-csc-list.php";
pub const ENDPOINT_CSC_DELETE: &str = "vpnsecuritysuite-opnsense/delete-csc.php";
pub const ENDPOINT_CSC_ADD: &str = "vpnsecuritysuite-opnsense/add-csc.php";
pub const ENDPOINT_FIREWALL_RULES: &str = "vpnsecuritysuite-opnsense/firewall-rules.php";
pub const ENDPOINT_FIREWALL_DELETE_RULE: &str = "vpnsecuritysuite-opnsense/delete-firewall-rule.php";
pub const ENDPOINT_FIREWALL_ADD_RULE: &str = "vpnsecuritysuite-opnsense/add-firewall-rule.php";

#[derive(Debug, Clone)]
pub struct OpnSenseConfig {
    pub base_uri: Url,
    pub timeout: Duration,
    pub verify_server_ssl_certificate: bool,
    pub user: Option<String>,
    pub password: Option<String>,
}

pub struct OpnSenseVpnProvider {
    http_client: HttpClient,
}

impl OpnSenseVpnProvider {
    pub fn new(config: OpnSenseConfig) -> Result<Self, reqwest::Error> {
        let basic_auth = match (config.user, config.password) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };

        let http_client = HttpClient::with_options(
            config.base_uri,
            config.timeout,
            config.verify_server_ssl_certificate,
            basic_auth,
            "OPNsense",
            true,
        )?;

        Ok(OpnSenseVpnProvider { http_client })
    }

    async fn post_json(
        &self,
        endpoint: &str,
        data: Option<Vec<(String, String)>>,
        logs: &mut LogsCollector,
    ) -> Result<serde_json::Value, ProviderError> {
        match self.http_client.post(endpoint, data).await {
            Ok(body) => Ok(body.into_json()),
            Err(error) => Err(Self::http_error(logs, error)),
        }
    }

    fn http_error(logs: &mut LogsCollector, error: HttpClientError) -> ProviderError {
        ProviderError::new(logs.add_http_error(&error))
    }

    fn error(
        logs: &mut LogsCollector,
        message: &str,
        variables: &[(&str, String)],
    ) -> ProviderError {
        ProviderError::new(logs.add_error(message, variables))
    }

    fn vpn_csc_configuration_pairs(configuration: &VpnCscConfiguration) -> Vec<(String, String)> {
        let mut data = vec![
            (
                "common_name".to_string(),
                configuration.csc_common_name.clone(),
            ),
            (
                "ovpn_servers".to_string(),
                configuration.csc_server_name.clone(),
            ),
            (
                "tunnel_network".to_string(),
                configuration.tunnel_network.clone(),
            ),
        ];

        if configuration.has_remote_networks() {
            data.push((
                "remote_network".to_string(),
                configuration.comma_delimited_remote_networks(),
            ));
        }

        data
    }

    async fn vpn_server_crl_reference_id(
        &self,
        server_description: &str,
        logs: &mut LogsCollector,
    ) -> Result<String, ProviderError> {
        let crl_list = self.post_json(ENDPOINT_CRL, None, logs).await?;

        // Expected structure: { "result": [ { "refid": ..., "descr": ... } ] }
        let crl_items = match value_at(&crl_list, "result").and_then(serde_json::Value::as_array) {
            Some(items) => items,
            None => {
                return Err(Self::error(
                    logs,
                    "log.opnSenseVpnProvider.getCrl.invalidResponse",
                    &[("serverDescription", server_description.to_string())],
                ));
            }
        };

        let reference_id = crl_items
            .iter()
            .find(|item| {
                value_at(item, "descr").and_then(serde_json::Value::as_str)
                    == Some(server_description)
            })
            .and_then(|item| value_at(item, "refid"))
            .and_then(value_as_string);

        match reference_id {
            Some(reference_id) => Ok(reference_id),
            None => Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.getCrl.crlNotExisting",
                &[("serverDescription", server_description.to_string())],
            )),
        }
    }
}

impl VpnProvider for OpnSenseVpnProvider {
    // Hash covers only the values actually deployed, so unchanged entries can
    // be recognized without re-adding.
    fn vpn_csc_configuration_hash(&self, configuration: &VpnCscConfiguration) -> String {
        let pairs = Self::vpn_csc_configuration_pairs(configuration);
        let encoded = serde_json::to_string(&pairs).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn vpn_connected_clients(
        &self,
        logs: &mut LogsCollector,
    ) -> Result<Vec<VpnConnectedClient>, ProviderError> {
        let connections = self.post_json(ENDPOINT_CONNECTED_CLIENTS, None, logs).await?;

        let mut connected_clients = Vec::new();

        let defined_connections = match connections.as_array() {
            Some(defined_connections) => defined_connections,
            None => return Ok(connected_clients),
        };

        for defined_connection in defined_connections {
            let Some(conns) = value_at(defined_connection, "conns").and_then(serde_json::Value::as_array)
            else {
                continue;
            };

            for connection in conns {
                // We assume 'common_name' = connected device certificate subject,
                // 'virtual_addr' = its virtual IP address, one connection per subject.
                let mut connected_client = VpnConnectedClient::default();

                if let Some(bytes_received) = numeric_value(connection, "bytes_recv") {
                    connected_client.bytes_received = bytes_received;
                }
                if let Some(bytes_sent) = numeric_value(connection, "bytes_sent") {
                    connected_client.bytes_sent = bytes_sent;
                }

                let common_name = value_at(connection, "common_name")
                    .and_then(serde_json::Value::as_str)
                    .filter(|value| !value.is_empty());
                let virtual_addr = value_at(connection, "virtual_addr")
                    .and_then(serde_json::Value::as_str)
                    .filter(|value| !value.is_empty());

                // Without a common name and a virtual IP address this is not
                // counted as a valid connection.
                if let (Some(common_name), Some(virtual_addr)) = (common_name, virtual_addr) {
                    connected_client.common_name = common_name.to_string();
                    connected_client.vpn_ip = virtual_addr.to_string();
                    connected_clients.push(connected_client);
                }
            }
        }

        Ok(connected_clients)
    }

    async fn update_vpn_server_crl(
        &self,
        server_description: &str,
        crl_content_pem: &str,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError> {
        let crl_reference_id = self
            .vpn_server_crl_reference_id(server_description, logs)
            .await?;

        let data = vec![
            ("id".to_string(), crl_reference_id),
            ("descr".to_string(), server_description.to_string()),
            ("crlmethod".to_string(), "existing".to_string()),
            ("crltext".to_string(), crl_content_pem.to_string()),
        ];
        let update_result = self.post_json(ENDPOINT_CRL, Some(data), logs).await?;

        let request_status = value_at(&update_result, "result.status")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        match request_status.as_deref() {
            None => Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.updateCrl.invalidResponse",
                &[("serverDescription", server_description.to_string())],
            )),
            Some("OK") => Ok(()),
            Some(_) => {
                let errors = joined_strings(value_at(&update_result, "result.input_errors"));
                Err(Self::error(
                    logs,
                    "log.opnSenseVpnProvider.updateCrl.errors",
                    &[
                        ("serverDescription", server_description.to_string()),
                        ("errors", errors),
                    ],
                ))
            }
        }
    }

    async fn vpn_server_name_by_description(
        &self,
        server_description: &str,
        logs: &mut LogsCollector,
    ) -> Result<String, ProviderError> {
        let servers_data = self.post_json(ENDPOINT_SERVERS_DATA, None, logs).await?;

        // Expected structure: { "result": { "serverName": { "description": ... } } }
        let servers = match value_at(&servers_data, "result").and_then(serde_json::Value::as_object)
        {
            Some(servers) => servers,
            None => {
                return Err(Self::error(
                    logs,
                    "log.opnSenseVpnProvider.getVpnServer.invalidResponse",
                    &[("serverDescription", server_description.to_string())],
                ));
            }
        };

        let server_name = servers.iter().find_map(|(name, server)| {
            (value_at(server, "description").and_then(serde_json::Value::as_str)
                == Some(server_description))
            .then(|| name.clone())
        });

        match server_name {
            Some(server_name) => Ok(server_name),
            None => Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.getVpnServer.serverMissing",
                &[("serverDescription", server_description.to_string())],
            )),
        }
    }

    async fn is_csc_in_vpn_server(
        &self,
        csc_common_name: &str,
        logs: &mut LogsCollector,
    ) -> Result<bool, ProviderError> {
        let csc_list = self.post_json(ENDPOINT_CSC_GET_LIST, None, logs).await?;

        // Expected structure: [ { "common_name": ... } ] across all VPN servers.
        let found = csc_list.as_array().is_some_and(|items| {
            items.iter().any(|item| {
                value_at(item, "common_name").and_then(serde_json::Value::as_str)
                    == Some(csc_common_name)
            })
        });

        Ok(found)
    }

    async fn add_csc_in_vpn_server(
        &self,
        configuration: &VpnCscConfiguration,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError> {
        let data = Self::vpn_csc_configuration_pairs(configuration);
        let add_response = self.post_json(ENDPOINT_CSC_ADD, Some(data), logs).await?;

        let add_status = value_at(&add_response, "result.status_config_override")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        match add_status.as_deref() {
            None => Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.addCsc.invalidResponse",
                &[("cscCommonName", configuration.csc_common_name.clone())],
            )),
            Some("OK") => Ok(()),
            Some(_) => {
                let errors = joined_strings(value_at(
                    &add_response,
                    "result.info_config_override_input_errors",
                ));
                Err(Self::error(
                    logs,
                    "log.opnSenseVpnProvider.addCsc.errors",
                    &[
                        ("cscCommonName", configuration.csc_common_name.clone()),
                        ("errors", errors),
                    ],
                ))
            }
        }
    }

    async fn delete_csc_in_vpn_server(
        &self,
        csc_common_name: &str,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError> {
        let data = vec![("common_name".to_string(), csc_common_name.to_string())];
        let remove_response = self.post_json(ENDPOINT_CSC_DELETE, Some(data), logs).await?;

        let object = remove_response.as_object();
        let has_expected_keys = object.is_some_and(|object| {
            object.contains_key("status")
                && object.contains_key("warnings")
                && object.contains_key("errors")
        });
        if !has_expected_keys {
            return Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.deleteCsc.invalidResponse",
                &[("cscCommonName", csc_common_name.to_string())],
            ));
        }

        if let Some(warnings) = value_at(&remove_response, "warnings")
            .and_then(serde_json::Value::as_array)
            .filter(|warnings| !warnings.is_empty())
        {
            let warnings = joined_string_items(warnings);
            logs.add_warning(
                "log.opnSenseVpnProvider.deleteCsc.warnings",
                &[
                    ("cscCommonName", csc_common_name.to_string()),
                    ("warnings", warnings),
                ],
            );
        }

        let status = value_at(&remove_response, "status").and_then(serde_json::Value::as_str);
        if Some("OK") != status {
            let errors = joined_strings(value_at(&remove_response, "errors"));
            return Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.deleteCsc.errors",
                &[
                    ("cscCommonName", csc_common_name.to_string()),
                    ("errors", errors),
                ],
            ));
        }

        Ok(())
    }

    async fn firewall_rules(
        &self,
        logs: &mut LogsCollector,
    ) -> Result<FirewallRuleConfigurationCollection, ProviderError> {
        let rules_response = self.post_json(ENDPOINT_FIREWALL_RULES, None, logs).await?;

        let rules = match value_at(&rules_response, "rules").and_then(serde_json::Value::as_array) {
            Some(rules) => rules,
            None => {
                return Err(Self::error(
                    logs,
                    "log.opnSenseVpnProvider.getFirewallRules.invalidResponse",
                    &[],
                ));
            }
        };

        let mut collection = FirewallRuleConfigurationCollection::new();

        for (rule_index, rule) in rules.iter().enumerate() {
            let identifier = value_at(rule, "md5").and_then(serde_json::Value::as_str);
            let source_ip = value_at(rule, "source.address").and_then(serde_json::Value::as_str);
            let destination_ip =
                value_at(rule, "destination.address").and_then(serde_json::Value::as_str);

            let (Some(identifier), Some(source_ip), Some(destination_ip)) =
                (identifier, source_ip, destination_ip)
            else {
                continue;
            };

            let mut configuration = FirewallRuleConfiguration::new(source_ip, destination_ip);
            configuration.rule_identifier = Some(identifier.to_string());
            configuration.rule_index = Some(rule_index.to_string());

            collection.add(configuration);
        }

        Ok(collection)
    }

    async fn add_firewall_rule(
        &self,
        rule: &FirewallRuleConfiguration,
        logs: &mut LogsCollector,
    ) -> Result<String, ProviderError> {
        let mut data = vec![
            ("src".to_string(), rule.source_ip.clone()),
            ("dst".to_string(), rule.destination_ip.clone()),
            ("srcmask".to_string(), rule.source_netmask.to_string()),
            ("dstmask".to_string(), rule.destination_netmask.to_string()),
            ("protocol".to_string(), rule.protocol.as_str().to_string()),
            ("interface".to_string(), "openvpn".to_string()),
            ("ipprotocol".to_string(), "inet".to_string()),
            ("type".to_string(), "pass".to_string()),
            ("statetype".to_string(), "keep state".to_string()),
            ("direction".to_string(), "any".to_string()),
        ];

        // With protocol ANY the port parameters have to be omitted entirely.
        // '' means 'other' on the remote side, which then requires dstbeginport.
        if Protocol::Any != rule.protocol {
            data.push(("srcbeginport".to_string(), port_value(rule.source_begin_port)));
            data.push(("srcendport".to_string(), port_value(rule.source_end_port)));
            data.push((
                "dstbeginport".to_string(),
                port_value(rule.destination_begin_port),
            ));
            data.push((
                "dstendport".to_string(),
                port_value(rule.destination_end_port),
            ));
        }

        let add_response = self
            .post_json(ENDPOINT_FIREWALL_ADD_RULE, Some(data), logs)
            .await?;

        let add_status = value_at(&add_response, "result.status")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        match add_status.as_deref() {
            None => Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.addFirewallRule.invalidResponse",
                &[],
            )),
            Some("OK") => {
                match value_at(&add_response, "result.md5").and_then(value_as_string) {
                    Some(identifier) => Ok(identifier),
                    None => Err(Self::error(
                        logs,
                        "log.opnSenseVpnProvider.addFirewallRule.missingMd5",
                        &[],
                    )),
                }
            }
            Some(status) => {
                let errors = joined_strings(value_at(&add_response, "result.input_errors"));
                logs.add_error(
                    "log.opnSenseVpnProvider.addFirewallRule.inputErrors",
                    &[("errors", errors)],
                );

                Err(Self::error(
                    logs,
                    "log.opnSenseVpnProvider.addFirewallRule.statusNotOk",
                    &[("status", status.to_string())],
                ))
            }
        }
    }

    async fn delete_firewall_rule(
        &self,
        rule: &FirewallRuleConfiguration,
        logs: &mut LogsCollector,
    ) -> Result<(), ProviderError> {
        let Some(rule_index) = rule.rule_index.clone() else {
            return Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.deleteFirewallRule.invalidParameter",
                &[],
            ));
        };

        let data = vec![
            ("act".to_string(), "del".to_string()),
            ("id".to_string(), rule_index),
            ("sourceIp".to_string(), rule.source_ip.clone()),
        ];

        let delete_response = self
            .post_json(ENDPOINT_FIREWALL_DELETE_RULE, Some(data), logs)
            .await?;

        let delete_status = value_at(&delete_response, "result.status")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        match delete_status.as_deref() {
            None => Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.deleteFirewallRule.invalidResponse",
                &[],
            )),
            Some("OK") => Ok(()),
            Some(status) => Err(Self::error(
                logs,
                "log.opnSenseVpnProvider.deleteFirewallRule.statusNotOk",
                &[("status", status.to_string())],
            )),
        }
    }
}

/// Dotted-path lookup into a JSON document ("result.status").
fn value_at<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(string) => Some(string.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn numeric_value(value: &serde_json::Value, key: &str) -> Option<i64> {
    match value_at(value, key)? {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(string) => string.parse().ok(),
        _ => None,
    }
}

fn joined_strings(value: Option<&serde_json::Value>) -> String {
    match value.and_then(serde_json::Value::as_array) {
        Some(items) => joined_string_items(items),
        None => "N/A".to_string(),
    }
}

fn joined_string_items(items: &[serde_json::Value]) -> String {
    items
        .iter()
        .filter_map(serde_json::Value::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn port_value(port: Option<u16>) -> String {
    match port {
        Some(port) => port.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LogLevel;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> OpnSenseVpnProvider {
        OpnSenseVpnProvider::new(OpnSenseConfig {
            base_uri: Url::parse(&server.uri()).expect("mock server url"),
            timeout: Duration::from_secs(5),
            verify_server_ssl_certificate: false,
            user: Some("apiuser".to_string()),
            password: Some("apipass".to_string()),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn firewall_rules_parses_complete_entries_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_FIREWALL_RULES}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rules": [
                    {"descr": "missing identifier", "source": {"address": "10.8.0.5"}},
                    {
                        "md5": "aabbcc",
                        "source": {"address": "10.8.0.5"},
                        "destination": {"address": "10.9.0.0"}
                    },
                ]
            })))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let rules = provider(&server)
            .await
            .firewall_rules(&mut logs)
            .await
            .expect("rules expected");

        assert_eq!(rules.len(), 1);
        let rule = rules
            .search_firewall_rule_by_identifier("aabbcc")
            .expect("rule expected");
        // The remote rule index counts skipped entries too.
        assert_eq!(rule.rule_index.as_deref(), Some("1"));
        assert_eq!(rule.source_ip, "10.8.0.5");
    }

    #[tokio::test]
    async fn firewall_rules_invalid_response_is_collected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_FIREWALL_RULES}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"nope": 1})))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let error = provider(&server)
            .await
            .firewall_rules(&mut logs)
            .await
            .expect_err("error expected");

        assert_eq!(
            error.log.message,
            "log.opnSenseVpnProvider.getFirewallRules.invalidResponse"
        );
        assert_eq!(logs.logs().len(), 1);
    }

    #[tokio::test]
    async fn add_firewall_rule_returns_remote_identifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_FIREWALL_ADD_RULE}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"status": "OK", "md5": "ddeeff"}
            })))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let rule = FirewallRuleConfiguration::new("10.8.0.5", "10.9.0.1");
        let identifier = provider(&server)
            .await
            .add_firewall_rule(&rule, &mut logs)
            .await
            .expect("identifier expected");

        assert_eq!(identifier, "ddeeff");
        assert!(logs.logs().is_empty());
    }

    #[tokio::test]
    async fn add_firewall_rule_failure_collects_input_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_FIREWALL_ADD_RULE}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"status": "failed", "input_errors": ["bad source", "bad port"]}
            })))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let rule = FirewallRuleConfiguration::new("10.8.0.5", "10.9.0.1");
        let error = provider(&server)
            .await
            .add_firewall_rule(&rule, &mut logs)
            .await
            .expect_err("error expected");

        assert_eq!(
            error.log.message,
            "log.opnSenseVpnProvider.addFirewallRule.statusNotOk"
        );
        let messages: Vec<&str> = logs.logs().iter().map(|log| log.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "log.opnSenseVpnProvider.addFirewallRule.inputErrors",
                "log.opnSenseVpnProvider.addFirewallRule.statusNotOk",
            ]
        );
        assert_eq!(
            logs.logs()[0].variables.get("errors").map(String::as_str),
            Some("bad source, bad port")
        );
    }

    #[tokio::test]
    async fn add_firewall_rule_sends_ports_only_for_concrete_protocols() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_FIREWALL_ADD_RULE}")))
            .and(body_string_contains("protocol=tcp"))
            .and(body_string_contains("dstbeginport=8883"))
            .and(body_string_contains("srcbeginport="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"status": "OK", "md5": "aa11"}
            })))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let mut rule = FirewallRuleConfiguration::new("10.8.0.5", "10.9.0.1");
        rule.protocol = Protocol::Tcp;
        rule.destination_begin_port = Some(8883);
        rule.destination_end_port = Some(8883);

        let identifier = provider(&server)
            .await
            .add_firewall_rule(&rule, &mut logs)
            .await
            .expect("identifier expected");
        assert_eq!(identifier, "aa11");
    }

    #[tokio::test]
    async fn delete_firewall_rule_requires_remote_index() {
        let server = MockServer::start().await;

        let mut logs = LogsCollector::new();
        let rule = FirewallRuleConfiguration::new("10.8.0.5", "10.9.0.1");
        let error = provider(&server)
            .await
            .delete_firewall_rule(&rule, &mut logs)
            .await
            .expect_err("error expected");

        assert_eq!(
            error.log.message,
            "log.opnSenseVpnProvider.deleteFirewallRule.invalidParameter"
        );
    }

    #[tokio::test]
    async fn connected_clients_skips_incomplete_connections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CONNECTED_CLIENTS}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"conns": [
                    {
                        "common_name": "device-1",
                        "virtual_addr": "10.8.0.5",
                        "bytes_recv": "1024",
                        "bytes_sent": 2048
                    },
                    {"common_name": "", "virtual_addr": "10.8.0.6"},
                    {"virtual_addr": "10.8.0.7"}
                ]},
                {"no_conns": true}
            ])))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let clients = provider(&server)
            .await
            .vpn_connected_clients(&mut logs)
            .await
            .expect("clients expected");

        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].common_name, "device-1");
        assert_eq!(clients[0].vpn_ip, "10.8.0.5");
        assert_eq!(clients[0].bytes_received, 1024);
        assert_eq!(clients[0].bytes_sent, 2048);
    }

    #[tokio::test]
    async fn connected_clients_tolerates_zero_connections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CONNECTED_CLIENTS}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let clients = provider(&server)
            .await
            .vpn_connected_clients(&mut logs)
            .await
            .expect("clients expected");
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn update_crl_resolves_reference_id_then_pushes() {
        let server = MockServer::start().await;
        // The update request carries the CRL payload; the listing does not.
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CRL}")))
            .and(body_string_contains("crlmethod"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"status": "OK"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CRL}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": [
                    {"refid": "crl-1", "descr": "Devices VPN"},
                    {"refid": "crl-2", "descr": "Other VPN"}
                ]
            })))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        provider(&server)
            .await
            .update_vpn_server_crl("Devices VPN", "-----BEGIN X509 CRL-----", &mut logs)
            .await
            .expect("update expected");
        assert!(logs.logs().is_empty());
    }

    #[tokio::test]
    async fn update_crl_for_unknown_server_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CRL}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": [{"refid": "crl-2", "descr": "Other VPN"}]
            })))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let error = provider(&server)
            .await
            .update_vpn_server_crl("Devices VPN", "-----BEGIN X509 CRL-----", &mut logs)
            .await
            .expect_err("error expected");
        assert_eq!(error.log.message, "log.opnSenseVpnProvider.getCrl.crlNotExisting");
    }

    #[tokio::test]
    async fn csc_lifecycle_against_remote_lists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CSC_GET_LIST}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"common_name": "device-1"},
                {"common_name": "device-2"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CSC_ADD}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"status_config_override": "OK"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_CSC_DELETE}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "OK",
                "warnings": ["stale entry"],
                "errors": []
            })))
            .mount(&server)
            .await;

        let opnsense = provider(&server).await;
        let mut logs = LogsCollector::new();

        assert!(opnsense.is_csc_in_vpn_server("device-1", &mut logs).await.expect("list"));
        assert!(!opnsense.is_csc_in_vpn_server("device-9", &mut logs).await.expect("list"));

        let configuration = VpnCscConfiguration {
            csc_common_name: "device-1".to_string(),
            csc_server_name: "server1".to_string(),
            tunnel_network: "10.8.0.0/24".to_string(),
            remote_networks: vec!["192.168.1.0/24".to_string()],
        };
        opnsense
            .add_csc_in_vpn_server(&configuration, &mut logs)
            .await
            .expect("add expected");

        opnsense
            .delete_csc_in_vpn_server("device-1", &mut logs)
            .await
            .expect("delete expected");
        // Remote warnings surface as collected log entries.
        let warnings: Vec<&str> = logs
            .logs()
            .iter()
            .filter(|log| LogLevel::Warning == log.level)
            .map(|log| log.message.as_str())
            .collect();
        assert_eq!(warnings, vec!["log.opnSenseVpnProvider.deleteCsc.warnings"]);
    }

    #[tokio::test]
    async fn vpn_server_name_is_resolved_by_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{ENDPOINT_SERVERS_DATA}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {
                    "server1": {"description": "Devices VPN"},
                    "server2": {"description": "Other VPN"}
                }
            })))
            .mount(&server)
            .await;

        let mut logs = LogsCollector::new();
        let name = provider(&server)
            .await
            .vpn_server_name_by_description("Devices VPN", &mut logs)
            .await
            .expect("server name expected");
        assert_eq!(name, "server1");
    }

    #[test]
    fn value_at_walks_nested_paths() {
        let value = serde_json::json!({"result": {"status": "OK", "md5": "abc"}});
        assert_eq!(
            value_at(&value, "result.status").and_then(serde_json::Value::as_str),
            Some("OK")
        );
        assert!(value_at(&value, "result.missing").is_none());
        assert!(value_at(&value, "nothing.at.all").is_none());
    }

    #[test]
    fn csc_hash_is_stable_and_sensitive_to_content() {
        let provider = OpnSenseVpnProvider::new(OpnSenseConfig {
            base_uri: Url::parse("https://firewall.local/").expect("static url"),
            timeout: Duration::from_secs(5),
            verify_server_ssl_certificate: false,
            user: None,
            password: None,
        })
        .expect("client");

        let configuration = VpnCscConfiguration {
            csc_common_name: "device-1".to_string(),
            csc_server_name: "server1".to_string(),
            tunnel_network: "10.8.0.0/24".to_string(),
            remote_networks: vec![],
        };

        let first = provider.vpn_csc_configuration_hash(&configuration);
        let second = provider.vpn_csc_configuration_hash(&configuration);
        assert_eq!(first, second);

        let mut changed = configuration.clone();
        changed.tunnel_network = "10.9.0.0/24".to_string();
        assert_ne!(first, provider.vpn_csc_configuration_hash(&changed));
    }
}
