use serde::Serialize;

/// Inet protocol of a firewall rule. String values are what the remote
/// system expects in rule payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// One firewall rule as exchanged with the remote control plane. Identity
/// for reconciliation is the IP pair or the remote rule identifier, never a
/// local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRuleConfiguration {
    pub source_ip: String,
    pub source_netmask: u8,
    pub source_begin_port: Option<u16>,
    pub source_end_port: Option<u16>,
    pub destination_ip: String,
    pub destination_netmask: u8,
    pub destination_begin_port: Option<u16>,
    pub destination_end_port: Option<u16>,
    pub protocol: Protocol,
    /// Existing rule index in the remote system (e.g. OPNsense rule index).
    pub rule_index: Option<String>,
    /// Existing rule identifier in the remote system (e.g. OPNsense rule md5).
    pub rule_identifier: Option<String>,
}

impl FirewallRuleConfiguration {
    pub fn new(source_ip: &str, destination_ip: &str) -> Self {
        Self::with_netmasks(source_ip, destination_ip, 32, 32)
    }

    pub fn with_netmasks(
        source_ip: &str,
        destination_ip: &str,
        source_netmask: u8,
        destination_netmask: u8,
    ) -> Self {
        FirewallRuleConfiguration {
            source_ip: source_ip.to_string(),
            source_netmask,
            source_begin_port: None,
            source_end_port: None,
            destination_ip: destination_ip.to_string(),
            destination_netmask,
            destination_begin_port: None,
            destination_end_port: None,
            protocol: Protocol::Any,
            rule_index: None,
            rule_identifier: None,
        }
    }
}

/// Rule sets are bounded by device count, so a plain list with linear scans
/// is kept deliberately.
#[derive(Debug, Clone, Default)]
pub struct FirewallRuleConfigurationCollection {
    rules: Vec<FirewallRuleConfiguration>,
}

impl FirewallRuleConfigurationCollection {
    pub fn new() -> Self {
        FirewallRuleConfigurationCollection::default()
    }

    pub fn add(&mut self, rule: FirewallRuleConfiguration) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FirewallRuleConfiguration> {
        self.rules.iter()
    }

    /// First rule matching the IP pair, `None` when absent. Duplicates by IP
    /// pair are possible on some backends; the first structural match wins.
    pub fn search_firewall_rule_by_ip(
        &self,
        source_ip: &str,
        destination_ip: &str,
    ) -> Option<&FirewallRuleConfiguration> {
        self.rules
            .iter()
            .find(|rule| rule.source_ip == source_ip && rule.destination_ip == destination_ip)
    }

    pub fn search_firewall_rule_by_identifier(
        &self,
        rule_identifier: &str,
    ) -> Option<&FirewallRuleConfiguration> {
        self.rules
            .iter()
            .find(|rule| rule.rule_identifier.as_deref() == Some(rule_identifier))
    }
}

impl IntoIterator for FirewallRuleConfigurationCollection {
    type Item = FirewallRuleConfiguration;
    type IntoIter = std::vec::IntoIter<FirewallRuleConfiguration>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.into_iter()
    }
}

/// One client specific config entry for a VPN server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnCscConfiguration {
    pub csc_common_name: String,
    pub csc_server_name: String,
    pub tunnel_network: String,
    pub remote_networks: Vec<String>,
}

impl VpnCscConfiguration {
    pub fn has_remote_networks(&self) -> bool {
        !self.remote_networks.is_empty()
    }

    pub fn comma_delimited_remote_networks(&self) -> String {
        self.remote_networks.join(",")
    }
}

/// Snapshot entry of a currently connected VPN client.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnConnectedClient {
    pub common_name: String,
    pub vpn_ip: String,
    pub bytes_received: i64,
    pub bytes_sent: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(source: &str, destination: &str, identifier: Option<&str>) -> FirewallRuleConfiguration {
        let mut rule = FirewallRuleConfiguration::new(source, destination);
        rule.rule_identifier = identifier.map(str::to_string);
        rule
    }

    #[test]
    fn search_by_ip_returns_none_on_empty_collection() {
        let collection = FirewallRuleConfigurationCollection::new();
        assert!(
            collection
                .search_firewall_rule_by_ip("10.0.0.1", "10.0.0.2")
                .is_none()
        );
    }

    #[test]
    fn search_by_ip_returns_first_match_when_duplicates_exist() {
        let mut collection = FirewallRuleConfigurationCollection::new();
        collection.add(rule("10.0.0.1", "10.0.0.2", Some("first")));
        collection.add(rule("10.0.0.1", "10.0.0.2", Some("second")));

        let found = collection
            .search_firewall_rule_by_ip("10.0.0.1", "10.0.0.2")
            .expect("rule expected");
        assert_eq!(found.rule_identifier.as_deref(), Some("first"));
    }

    #[test]
    fn search_by_identifier_matches_exact_rule() {
        let mut collection = FirewallRuleConfigurationCollection::new();
        collection.add(rule("10.0.0.1", "10.0.0.2", Some("aa")));
        collection.add(rule("10.0.0.3", "10.0.0.4", Some("bb")));

        let found = collection
            .search_firewall_rule_by_identifier("bb")
            .expect("rule expected");
        assert_eq!(found.source_ip, "10.0.0.3");
        assert!(collection.search_firewall_rule_by_identifier("cc").is_none());
    }

    #[test]
    fn csc_remote_networks_join() {
        let configuration = VpnCscConfiguration {
            csc_common_name: "device-1".to_string(),
            csc_server_name: "server1".to_string(),
            tunnel_network: "10.8.0.0/24".to_string(),
            remote_networks: vec!["192.168.1.0/24".to_string(), "192.168.2.0/24".to_string()],
        };

        assert!(configuration.has_remote_networks());
        assert_eq!(
            configuration.comma_delimited_remote_networks(),
            "192.168.1.0/24,192.168.2.0/24"
        );
    }
}
