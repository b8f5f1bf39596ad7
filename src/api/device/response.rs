use serde::Serialize;

/// Device check-in responses always carry errors in-band. The wire format
/// stays stable even on failure, so devices never have to parse anything
/// but their own protocol shape.
pub trait ResponseModel: Serialize + Default {
    fn set_error(&mut self, error: &str);

    fn error(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterResponseModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseModel for RouterResponseModel {
    fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlexEdgeResponseModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseModel for FlexEdgeResponseModel {
    fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeGatewayResponseModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseModel for EdgeGatewayResponseModel {
    fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnContainerClientResponseModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    // Command flags are serialized only when set, for backwards compatibility
    // with older clients that reject unknown false-valued keys.
    #[serde(skip_serializing_if = "is_false")]
    pub clear_uuid: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unregister: bool,
}

impl ResponseModel for VpnContainerClientResponseModel {
    fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

fn is_false(value: &bool) -> bool {
    !value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_flags_serialize_only_when_set() {
        let mut response = VpnContainerClientResponseModel::default();
        response.uuid = Some("abc".to_string());

        let serialized = serde_json::to_value(&response).expect("serializable");
        assert_eq!(serialized, serde_json::json!({"uuid": "abc"}));

        response.clear_uuid = true;
        response.set_error("VPN Container Client cannot be found - register without UUID");
        let serialized = serde_json::to_value(&response).expect("serializable");
        assert_eq!(serialized.get("clearUuid"), Some(&serde_json::json!(true)));
        assert!(serialized.get("unregister").is_none());
        assert!(serialized.get("error").is_some());
    }

    #[test]
    fn none_fields_are_omitted() {
        let response = EdgeGatewayResponseModel {
            serial_number: Some("SN-1".to_string()),
            ..EdgeGatewayResponseModel::default()
        };
        let serialized = serde_json::to_value(&response).expect("serializable");
        assert_eq!(serialized, serde_json::json!({"serialNumber": "SN-1"}));
    }
}
