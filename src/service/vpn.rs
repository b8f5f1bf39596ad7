use log::info;

use crate::db::models::Device;
use crate::provider::model::{
    FirewallRuleConfiguration, FirewallRuleConfigurationCollection, VpnCscConfiguration,
};
use crate::provider::{LogsCollector, ProviderError, VpnProvider};

/// VPN topology settings shared by all reconciliation operations.
#[derive(Debug, Clone)]
pub struct VpnSettings {
    pub server_description: String,
    pub devices_vpn_gateway: String,
    /// CIDR networks reachable from connected devices ("10.8.0.0/24").
    pub devices_vpn_networks: Vec<String>,
    pub technicians_vpn_network: String,
}

/// Outcome of an open/close reconciliation pass. Partial success is the
/// norm: identifiers of the rules that were applied plus every collected
/// log entry.
#[derive(Debug)]
pub struct ReconciliationOutcome {
    pub firewall_rule_identifiers: Vec<String>,
    pub csc_hash: Option<String>,
}

/// Builds the device-to-network rule set for one device: its VPN IP (and
/// virtual IP where assigned) towards every configured device network.
pub fn device_to_network_firewall_rules(
    connected_device: &Device,
    devices_vpn_networks: &[String],
) -> FirewallRuleConfigurationCollection {
    let mut collection = FirewallRuleConfigurationCollection::new();

    let Some(device_ip) = connected_device.vpn_ip.as_deref() else {
        return collection;
    };

    for device_network in devices_vpn_networks {
        let Some((network_ip, network_netmask)) = split_cidr(device_network) else {
            continue;
        };

        collection.add(FirewallRuleConfiguration::with_netmasks(
            device_ip,
            network_ip,
            32,
            network_netmask,
        ));

        if let Some(virtual_ip) = connected_device.virtual_ip.as_deref() {
            collection.add(FirewallRuleConfiguration::with_netmasks(
                virtual_ip,
                network_ip,
                32,
                network_netmask,
            ));
        }
    }

    collection
}

fn split_cidr(network: &str) -> Option<(&str, u8)> {
    let (ip, netmask) = network.split_once('/')?;
    let netmask: u8 = netmask.parse().ok()?;
    Some((ip, netmask))
}

fn rule_variables(rule: &FirewallRuleConfiguration) -> [(&'static str, String); 2] {
    [
        (
            "sourceIp",
            format!("{}/{}", rule.source_ip, rule.source_netmask),
        ),
        (
            "destinationIp",
            format!("{}/{}", rule.destination_ip, rule.destination_netmask),
        ),
    ]
}

/// Adds one firewall rule, first removing any rule already present for the
/// same IP pair. Returns the provider-assigned rule identifier.
async fn add_firewall_rule<P: VpnProvider>(
    provider: &P,
    rule_to_be_added: &FirewallRuleConfiguration,
    logs: &mut LogsCollector,
) -> Result<String, ProviderError> {
    let current_rules = provider.firewall_rules(logs).await?;

    let obsolete_rule = current_rules
        .search_firewall_rule_by_ip(&rule_to_be_added.source_ip, &rule_to_be_added.destination_ip)
        .cloned();

    if let Some(obsolete_rule) = obsolete_rule {
        logs.add_error(
            "log.vpnProviders.openConnection.unexpectedFirewallRule",
            &rule_variables(rule_to_be_added),
        );

        provider.delete_firewall_rule(&obsolete_rule, logs).await?;
    }

    let rule_identifier = provider.add_firewall_rule(rule_to_be_added, logs).await?;

    logs.add_info(
        "log.vpnProviders.openConnection.firewallRuleAdded",
        &rule_variables(rule_to_be_added),
    );

    Ok(rule_identifier)
}

/// Ensures the device's client-specific config is deployed and matches the
/// desired configuration (detected through the stored hash). Returns the
/// hash to persist.
async fn ensure_csc_deployed<P: VpnProvider>(
    provider: &P,
    settings: &VpnSettings,
    connected_device: &Device,
    logs: &mut LogsCollector,
) -> Result<Option<String>, ProviderError> {
    let Some(tunnel_network) = connected_device.vpn_ip.as_deref() else {
        return Ok(None);
    };

    let csc_common_name = connected_device
        .certificate_subject
        .as_deref()
        .unwrap_or(&connected_device.name);

    let csc_server_name = provider
        .vpn_server_name_by_description(&settings.server_description, logs)
        .await?;

    let configuration = VpnCscConfiguration {
        csc_common_name: csc_common_name.to_string(),
        csc_server_name,
        tunnel_network: tunnel_network.to_string(),
        remote_networks: Vec::new(),
    };

    let desired_hash = provider.vpn_csc_configuration_hash(&configuration);

    let deployed = connected_device.csc_hash.as_deref() == Some(desired_hash.as_str())
        && provider.is_csc_in_vpn_server(csc_common_name, logs).await?;
    if deployed {
        return Ok(Some(desired_hash));
    }

    if provider.is_csc_in_vpn_server(csc_common_name, logs).await? {
        provider.delete_csc_in_vpn_server(csc_common_name, logs).await?;
    }

    provider.add_csc_in_vpn_server(&configuration, logs).await?;

    info!(
        "Deployed CSC configuration for device {} ({})",
        connected_device.id, csc_common_name
    );

    Ok(Some(desired_hash))
}

/// Opens a device-to-network connection: CSC deployment plus one firewall
/// rule per (device IP, device network) pair. Rules that fail are reported
/// through the collector while the remaining rules are still applied —
/// callers persist whatever succeeded.
pub async fn open_device_connection<P: VpnProvider>(
    provider: &P,
    settings: &VpnSettings,
    connected_device: &Device,
    logs: &mut LogsCollector,
) -> ReconciliationOutcome {
    let csc_hash = match ensure_csc_deployed(provider, settings, connected_device, logs).await {
        Ok(csc_hash) => csc_hash,
        // Already collected; firewall rules are still attempted.
        Err(_) => None,
    };

    let rules_to_add = device_to_network_firewall_rules(
        connected_device,
        &settings.devices_vpn_networks,
    );

    let mut firewall_rule_identifiers = Vec::new();
    for rule in rules_to_add.iter() {
        match add_firewall_rule(provider, rule, logs).await {
            Ok(rule_identifier) => firewall_rule_identifiers.push(rule_identifier),
            Err(_) => continue,
        }
    }

    ReconciliationOutcome {
        firewall_rule_identifiers,
        csc_hash,
    }
}

/// Closes a device connection by deleting every stored rule identifier.
/// Missing rules are reported and skipped.
pub async fn close_device_connection<P: VpnProvider>(
    provider: &P,
    connected_device: &Device,
    logs: &mut LogsCollector,
) {
    for rule_identifier in connected_device.firewall_rule_identifiers() {
        let current_rules = match provider.firewall_rules(logs).await {
            Ok(rules) => rules,
            Err(_) => continue,
        };

        let Some(rule_to_remove) = current_rules
            .search_firewall_rule_by_identifier(&rule_identifier)
            .cloned()
        else {
            logs.add_error(
                "log.vpnProviders.closeConnection.firewallRuleNotFound",
                &[("ruleIdentifier", rule_identifier.clone())],
            );
            continue;
        };

        if provider.delete_firewall_rule(&rule_to_remove, logs).await.is_ok() {
            logs.add_info(
                "log.vpnProviders.openConnection.firewallRuleDeleted",
                &rule_variables(&rule_to_remove),
            );
        }
    }
}

/// Folds the connected-clients snapshot into traffic deltas for one device.
/// Returns the byte counters to add, `None` when the device is not in the
/// snapshot.
pub async fn connection_traffic<P: VpnProvider>(
    provider: &P,
    connected_device: &Device,
    logs: &mut LogsCollector,
) -> Result<Option<(i64, i64)>, ProviderError> {
    let common_name = connected_device
        .certificate_subject
        .as_deref()
        .unwrap_or(&connected_device.name);

    let connected_clients = provider.vpn_connected_clients(logs).await?;

    Ok(connected_clients
        .iter()
        .find(|client| client.common_name == common_name)
        .map(|client| (client.bytes_received, client.bytes_sent)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vpn_ip: Option<&str>, virtual_ip: Option<&str>) -> Device {
        Device {
            id: 5,
            name: "edge-5".to_string(),
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
            vpn_ip: vpn_ip.map(str::to_string),
            virtual_ip: virtual_ip.map(str::to_string),
            csc_hash: None,
            connection_firewall_rules: None,
            vpn_traffic_in: 0,
            vpn_traffic_out: 0,
        }
    }

    #[test]
    fn rule_set_covers_vpn_and_virtual_ips() {
        let networks = vec!["10.8.0.0/24".to_string(), "10.9.0.0/16".to_string()];
        let rules =
            device_to_network_firewall_rules(&device(Some("10.8.0.5"), Some("172.16.0.5")), &networks);

        assert_eq!(rules.len(), 4);
        let first = rules
            .search_firewall_rule_by_ip("10.8.0.5", "10.8.0.0")
            .expect("rule expected");
        assert_eq!(first.source_netmask, 32);
        assert_eq!(first.destination_netmask, 24);
        assert!(
            rules
                .search_firewall_rule_by_ip("172.16.0.5", "10.9.0.0")
                .is_some()
        );
    }

    #[test]
    fn rule_set_is_empty_without_vpn_ip() {
        let networks = vec!["10.8.0.0/24".to_string()];
        let rules = device_to_network_firewall_rules(&device(None, Some("172.16.0.5")), &networks);
        assert!(rules.is_empty());
    }

    #[test]
    fn malformed_networks_are_skipped() {
        let networks = vec!["not-a-cidr".to_string(), "10.8.0.0/24".to_string()];
        let rules = device_to_network_firewall_rules(&device(Some("10.8.0.5"), None), &networks);
        assert_eq!(rules.len(), 1);
    }
}
