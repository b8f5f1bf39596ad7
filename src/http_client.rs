use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use thiserror::Error;
use url::Url;

pub const LOG_UNAUTHORIZED: &str = "log.httpClient.unauthorized";
pub const LOG_FORBIDDEN: &str = "log.httpClient.forbidden";
pub const LOG_UNEXPECTED_STATUS_CODE: &str = "log.httpClient.unexpectedStatusCode";
pub const LOG_DECODING_EXCEPTION: &str = "log.httpClient.decodingException";
pub const LOG_TRANSPORT_EXCEPTION: &str = "log.httpClient.transportException";

const EMPTY_RESPONSE: &str = "(empty response)";

/// Failure of an outbound HTTP request, narrowed to a closed set of log
/// message keys. Downstream log rendering depends on these keys staying
/// stable.
#[derive(Debug, Error)]
#[error("{log_message}")]
pub struct HttpClientError {
    pub log_message: &'static str,
    pub log_message_variables: BTreeMap<String, String>,
}

impl HttpClientError {
    fn new(log_message: &'static str, variables: Vec<(&str, String)>) -> Self {
        HttpClientError {
            log_message,
            log_message_variables: variables
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

/// Response payload, either raw text or a decoded JSON document depending on
/// the `to_array` flag.
#[derive(Debug, Clone)]
pub enum HttpResponseBody {
    Text(String),
    Json(serde_json::Value),
}

impl HttpResponseBody {
    pub fn into_text(self) -> String {
        match self {
            HttpResponseBody::Text(text) => text,
            HttpResponseBody::Json(value) => value.to_string(),
        }
    }

    pub fn into_json(self) -> serde_json::Value {
        match self {
            HttpResponseBody::Json(value) => value,
            HttpResponseBody::Text(text) => serde_json::Value::String(text),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Option<Vec<(String, String)>>,
    pub form: Option<Vec<(String, String)>>,
    pub json: Option<serde_json::Value>,
}

/// Synchronous-feeling wrapper around `reqwest` normalizing transport,
/// decoding and non-200 failures into `HttpClientError`.
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Option<Url>,
    basic_auth: Option<(String, String)>,
    service: String,
    to_array: bool,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, service: &str, to_array: bool) -> Self {
        HttpClient {
            client,
            base_url: None,
            basic_auth: None,
            service: service.to_string(),
            to_array,
        }
    }

    /// Builds the underlying client with a fixed base URI, timeout, optional
    /// TLS verification and basic auth credentials.
    pub fn with_options(
        base_url: Url,
        timeout: Duration,
        verify_server_ssl_certificate: bool,
        basic_auth: Option<(String, String)>,
        service: &str,
        to_array: bool,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if !verify_server_ssl_certificate {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        Ok(HttpClient {
            client,
            base_url: Some(base_url),
            basic_auth,
            service: service.to_string(),
            to_array,
        })
    }

    pub async fn get(
        &self,
        url: &str,
        query: Option<Vec<(String, String)>>,
    ) -> Result<HttpResponseBody, HttpClientError> {
        let options = RequestOptions {
            query,
            ..RequestOptions::default()
        };
        self.request(Method::GET, url, options, None).await
    }

    pub async fn delete(
        &self,
        url: &str,
        query: Option<Vec<(String, String)>>,
    ) -> Result<HttpResponseBody, HttpClientError> {
        let options = RequestOptions {
            query,
            ..RequestOptions::default()
        };
        self.request(Method::DELETE, url, options, None).await
    }

    pub async fn post(
        &self,
        url: &str,
        form: Option<Vec<(String, String)>>,
    ) -> Result<HttpResponseBody, HttpClientError> {
        let options = RequestOptions {
            form,
            ..RequestOptions::default()
        };
        self.request(Method::POST, url, options, None).await
    }

    pub async fn put(
        &self,
        url: &str,
        form: Option<Vec<(String, String)>>,
    ) -> Result<HttpResponseBody, HttpClientError> {
        let options = RequestOptions {
            form,
            ..RequestOptions::default()
        };
        self.request(Method::PUT, url, options, None).await
    }

    pub async fn patch(
        &self,
        url: &str,
        form: Option<Vec<(String, String)>>,
    ) -> Result<HttpResponseBody, HttpClientError> {
        let options = RequestOptions {
            form,
            ..RequestOptions::default()
        };
        self.request(Method::PATCH, url, options, None).await
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        to_array: Option<bool>,
    ) -> Result<HttpResponseBody, HttpClientError> {
        let resolved_url = self.resolve_url(url)?;
        let url_variable = resolved_url.to_string();

        let mut request = self.client.request(method, resolved_url);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }
        if let Some(query) = &options.query {
            request = request.query(query);
        }
        if let Some(form) = &options.form {
            request = request.form(form);
        }
        if let Some(json) = &options.json {
            request = request.json(json);
        }

        let response = request.send().await.map_err(|error| {
            HttpClientError::new(
                LOG_TRANSPORT_EXCEPTION,
                vec![
                    ("service", self.service.clone()),
                    ("url", url_variable.clone()),
                    ("message", error.to_string()),
                ],
            )
        })?;

        let status_code = response.status().as_u16();

        if 401 == status_code {
            return Err(HttpClientError::new(
                LOG_UNAUTHORIZED,
                vec![("service", self.service.clone()), ("url", url_variable)],
            ));
        }

        if 403 == status_code {
            return Err(HttpClientError::new(
                LOG_FORBIDDEN,
                vec![("service", self.service.clone()), ("url", url_variable)],
            ));
        }

        let content = response.text().await.map_err(|error| {
            HttpClientError::new(
                LOG_TRANSPORT_EXCEPTION,
                vec![
                    ("service", self.service.clone()),
                    ("url", url_variable.clone()),
                    ("message", error.to_string()),
                ],
            )
        })?;

        if 200 != status_code {
            return Err(HttpClientError::new(
                LOG_UNEXPECTED_STATUS_CODE,
                vec![
                    ("service", self.service.clone()),
                    ("url", url_variable),
                    ("response", Self::response_variable(&content)),
                    ("statusCode", status_code.to_string()),
                ],
            ));
        }

        if to_array.unwrap_or(self.to_array) {
            let value: serde_json::Value = serde_json::from_str(&content).map_err(|error| {
                HttpClientError::new(
                    LOG_DECODING_EXCEPTION,
                    vec![
                        ("service", self.service.clone()),
                        ("url", url_variable.clone()),
                        ("response", Self::response_variable(&content)),
                        ("message", error.to_string()),
                    ],
                )
            })?;

            return Ok(HttpResponseBody::Json(value));
        }

        Ok(HttpResponseBody::Text(content))
    }

    fn resolve_url(&self, url: &str) -> Result<Url, HttpClientError> {
        let parsed = match &self.base_url {
            Some(base) => base.join(url),
            None => Url::parse(url),
        };

        parsed.map_err(|error| {
            HttpClientError::new(
                LOG_TRANSPORT_EXCEPTION,
                vec![
                    ("service", self.service.clone()),
                    ("url", url.to_string()),
                    ("message", error.to_string()),
                ],
            )
        })
    }

    fn response_variable(content: &str) -> String {
        if content.is_empty() {
            EMPTY_RESPONSE.to_string()
        } else {
            content.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_client(server: &MockServer, to_array: bool) -> HttpClient {
        let mut client = HttpClient::new(reqwest::Client::new(), "Test service", to_array);
        client.base_url = Some(Url::parse(&server.uri()).expect("mock server url"));
        client
    }

    fn assert_http_client_error(error: &HttpClientError, log_message: &str) {
        assert_eq!(
            error.log_message, log_message,
            "Message \"{}\" not found in HttpClientError with message \"{}\" and message variables {:?}",
            log_message, error.log_message, error.log_message_variables
        );
        assert_eq!(
            error.log_message_variables.get("service").map(String::as_str),
            Some("Test service")
        );
    }

    #[tokio::test]
    async fn returns_body_text_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Example response"))
            .mount(&server)
            .await;

        let result = http_client(&server, false)
            .get("/anywhere", None)
            .await
            .expect("success expected");
        assert_eq!(result.into_text(), "Example response");
    }

    #[tokio::test]
    async fn invalid_json_is_fine_without_to_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Invalid JSON"))
            .mount(&server)
            .await;

        let result = http_client(&server, false)
            .get("/anywhere", None)
            .await
            .expect("success expected");
        assert_eq!(result.into_text(), "Invalid JSON");
    }

    #[tokio::test]
    async fn status_401_maps_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let error = http_client(&server, false)
            .get("/anywhere", None)
            .await
            .expect_err("HttpClientError expected");
        assert_http_client_error(&error, LOG_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_403_maps_to_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let error = http_client(&server, false)
            .get("/anywhere", None)
            .await
            .expect_err("HttpClientError expected");
        assert_http_client_error(&error, LOG_FORBIDDEN);
    }

    #[tokio::test]
    async fn other_statuses_map_to_unexpected_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let error = http_client(&server, false)
            .get("/anywhere", None)
            .await
            .expect_err("HttpClientError expected");
        assert_http_client_error(&error, LOG_UNEXPECTED_STATUS_CODE);
        assert_eq!(
            error.log_message_variables.get("statusCode").map(String::as_str),
            Some("500")
        );
        assert_eq!(
            error.log_message_variables.get("response").map(String::as_str),
            Some("(empty response)")
        );
    }

    #[tokio::test]
    async fn unexpected_status_code_keeps_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let error = http_client(&server, false)
            .get("/anywhere", None)
            .await
            .expect_err("HttpClientError expected");
        assert_http_client_error(&error, LOG_UNEXPECTED_STATUS_CODE);
        assert_eq!(
            error.log_message_variables.get("response").map(String::as_str),
            Some("upstream down")
        );
    }

    #[tokio::test]
    async fn connection_failure_maps_to_transport_exception() {
        // Nothing listens on port 1.
        let mut client = HttpClient::new(reqwest::Client::new(), "Test service", false);
        client.base_url = Some(Url::parse("http://127.0.0.1:1/").expect("static url"));

        let error = client
            .get("/anywhere", None)
            .await
            .expect_err("HttpClientError expected");
        assert_http_client_error(&error, LOG_TRANSPORT_EXCEPTION);
        assert!(error.log_message_variables.contains_key("message"));
    }

    #[tokio::test]
    async fn to_array_decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"any": "thing"}"#),
            )
            .mount(&server)
            .await;

        let result = http_client(&server, true)
            .get("/anywhere", None)
            .await
            .expect("success expected");
        assert_eq!(result.into_json(), serde_json::json!({"any": "thing"}));
    }

    #[tokio::test]
    async fn to_array_invalid_json_maps_to_decoding_exception() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Invalid JSON"))
            .mount(&server)
            .await;

        let error = http_client(&server, true)
            .get("/anywhere", None)
            .await
            .expect_err("HttpClientError expected");
        assert_http_client_error(&error, LOG_DECODING_EXCEPTION);
        // The raw response body has to be retained in the variables.
        assert_eq!(
            error.log_message_variables.get("response").map(String::as_str),
            Some("Invalid JSON")
        );
    }

    #[tokio::test]
    async fn per_call_to_array_overrides_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/anywhere"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"any": "thing"}"#))
            .mount(&server)
            .await;

        let client = http_client(&server, false);
        let result = client
            .request(Method::GET, "/anywhere", RequestOptions::default(), Some(true))
            .await
            .expect("success expected");
        assert_eq!(result.into_json(), serde_json::json!({"any": "thing"}));
    }
}
