use std::collections::BTreeMap;

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::db::models::{
    AuthenticationMethod, CredentialsSource, Device, DeviceSecret, DeviceType, DeviceTypeSecret,
    NewDeviceFailedLoginAttempt,
};
use crate::service::secrets;

/// Maximum age of a digest nonce before the device has to request a new one.
const NONCE_MAX_AGE_SECONDS: i64 = 300;

/// Header a TLS-terminating proxy uses to forward the verified client
/// certificate subject.
pub const CLIENT_SUBJECT_HEADER: &str = "x-ssl-client-subject";

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Identity established for one device request.
#[derive(Debug, Clone)]
pub struct AuthenticatedDevice {
    pub device_id: Option<i32>,
    pub username: Option<String>,
    pub via_secret: bool,
}

impl AuthenticatedDevice {
    fn anonymous() -> Self {
        AuthenticatedDevice {
            device_id: None,
            username: None,
            via_secret: false,
        }
    }
}

/// Rejected authentication. Responds 401 with the scheme-appropriate
/// challenge header when one applies.
#[derive(Debug, Clone)]
pub struct AuthRejection {
    pub challenge: Option<String>,
}

impl AuthRejection {
    fn basic(realm: &str) -> Self {
        AuthRejection {
            challenge: Some(format!(r#"Basic realm="{realm}""#)),
        }
    }

    fn digest(realm: &str, nonce: &str) -> Self {
        AuthRejection {
            challenge: Some(format!(
                r#"Digest realm="{realm}", qop="auth", algorithm=SHA-256, nonce="{nonce}", charset=UTF-8"#
            )),
        }
    }

    fn bare() -> Self {
        AuthRejection { challenge: None }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self.challenge {
            Some(challenge) => {
                (StatusCode::UNAUTHORIZED, [("www-authenticate", challenge)]).into_response()
            }
            None => StatusCode::UNAUTHORIZED.into_response(),
        }
    }
}

/// Request context needed to resolve the device-side credentials.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAuthRequest<'a> {
    pub headers: &'a HeaderMap,
    pub method: &'a str,
    pub uri_path: &'a str,
    /// uuid path segment, when the route carries one.
    pub uuid: Option<&'a str>,
    /// `device` query parameter identifying the device by name.
    pub device_query: Option<&'a str>,
}

pub fn parse_basic_authorization(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

pub fn parse_digest_authorization(headers: &HeaderMap) -> Option<BTreeMap<String, String>> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let params = value.strip_prefix("Digest ")?;
    Some(parse_digest_params(params))
}

/// Parses `key="quoted value", key=token` parameter lists.
fn parse_digest_params(input: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();

        let after_key = after_key.trim_start();
        let (value, remaining) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after_key.find(',') {
                Some(end) => (after_key[..end].trim().to_string(), &after_key[end..]),
                None => (after_key.trim().to_string(), ""),
            }
        };

        params.insert(key, value);
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

/// Time-limited stateless nonce: `base64(timestamp:sha256(timestamp:key))`.
pub fn create_nonce(key: &[u8], timestamp: i64) -> String {
    let digest = nonce_digest(key, timestamp);
    STANDARD.encode(format!("{timestamp}:{digest}"))
}

pub fn validate_nonce(key: &[u8], nonce: &str, now: i64) -> bool {
    let Ok(decoded) = STANDARD.decode(nonce) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((timestamp, digest)) = decoded.split_once(':') else {
        return false;
    };
    let Ok(timestamp) = timestamp.parse::<i64>() else {
        return false;
    };

    if digest != nonce_digest(key, timestamp) {
        return false;
    }

    now >= timestamp && now - timestamp <= NONCE_MAX_AGE_SECONDS
}

fn nonce_digest(key: &[u8], timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(key);
    format!("{:x}", hasher.finalize())
}

/// RFC 7616 SHA-256 digest response for the given credentials.
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: Option<&str>,
) -> String {
    let ha1 = sha256_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = sha256_hex(&format!("{method}:{uri}"));

    match qop {
        Some(qop) => sha256_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}")),
        None => sha256_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretAuthOutcome {
    Matched,
    Mismatch,
    NoSecret,
}

/// Core DeviceSecret credential decision. `secret` is `(name, value)` of the
/// resolved credential secret, `None` when no secret could be resolved for
/// the request context.
pub fn evaluate_secret_credentials(
    secret: Option<(&str, &str)>,
    username: &str,
    password: &str,
) -> SecretAuthOutcome {
    match secret {
        None => SecretAuthOutcome::NoSecret,
        Some((name, value)) => {
            if username == name && password == value {
                SecretAuthOutcome::Matched
            } else {
                SecretAuthOutcome::Mismatch
            }
        }
    }
}

/// Authenticates one device request against the device type configuration.
pub async fn authenticate(
    conn: &mut AsyncPgConnection,
    realm: &str,
    encryption_key: &[u8],
    device_type: &DeviceType,
    request: DeviceAuthRequest<'_>,
) -> Result<AuthenticatedDevice, AuthRejection> {
    match device_type.authentication_method {
        AuthenticationMethod::None => Ok(AuthenticatedDevice::anonymous()),
        AuthenticationMethod::Basic => authenticate_basic(conn, realm, encryption_key, device_type, request).await,
        AuthenticationMethod::Digest => authenticate_digest(conn, realm, encryption_key, device_type, request).await,
        AuthenticationMethod::X509 => authenticate_x509(conn, device_type, request).await,
    }
}

async fn authenticate_basic(
    conn: &mut AsyncPgConnection,
    realm: &str,
    encryption_key: &[u8],
    device_type: &DeviceType,
    request: DeviceAuthRequest<'_>,
) -> Result<AuthenticatedDevice, AuthRejection> {
    // Without credentials this authenticator does not apply; the entry point
    // answers with the challenge.
    let Some((username, password)) = parse_basic_authorization(request.headers) else {
        return Err(AuthRejection::basic(realm));
    };

    match device_type.credentials_source {
        Some(CredentialsSource::Secret) => {
            let secret = resolve_secret_credentials(conn, encryption_key, device_type, request, &username)
                .await
                .map_err(|_| AuthRejection::basic(realm))?;
            let secret_ref = secret
                .as_ref()
                .map(|resolved| (resolved.secret_name.as_str(), resolved.value.as_str()));

            match evaluate_secret_credentials(secret_ref, &username, &password) {
                SecretAuthOutcome::Matched => {
                    // Secret-backed identity wins even if a device shares the
                    // presented username.
                    Ok(AuthenticatedDevice {
                        device_id: secret.map(|resolved| resolved.device_id),
                        username: Some(username),
                        via_secret: true,
                    })
                }
                _ => Err(record_and_reject(conn, device_type, username, AuthRejection::basic(realm)).await),
            }
        }
        Some(CredentialsSource::UserIfSecretMissing) => {
            let secret = resolve_secret_credentials(conn, encryption_key, device_type, request, &username)
                .await
                .map_err(|_| AuthRejection::basic(realm))?;
            let secret_ref = secret
                .as_ref()
                .map(|resolved| (resolved.secret_name.as_str(), resolved.value.as_str()));

            match evaluate_secret_credentials(secret_ref, &username, &password) {
                SecretAuthOutcome::Matched => Ok(AuthenticatedDevice {
                    device_id: secret.map(|resolved| resolved.device_id),
                    username: Some(username),
                    via_secret: true,
                }),
                // A resolved secret with wrong credentials fails hard, so one
                // flow cannot be credential-stuffed into the other.
                SecretAuthOutcome::Mismatch => {
                    Err(record_and_reject(conn, device_type, username, AuthRejection::basic(realm)).await)
                }
                SecretAuthOutcome::NoSecret => {
                    match check_device_user(conn, device_type, &username, &password).await {
                        Ok(device) => Ok(AuthenticatedDevice {
                            device_id: Some(device.id),
                            username: Some(username),
                            via_secret: false,
                        }),
                        Err(_) => Err(record_and_reject(
                            conn,
                            device_type,
                            username,
                            AuthRejection::basic(realm),
                        )
                        .await),
                    }
                }
            }
        }
        _ => match check_device_user(conn, device_type, &username, &password).await {
            Ok(device) => Ok(AuthenticatedDevice {
                device_id: Some(device.id),
                username: Some(username),
                via_secret: false,
            }),
            Err(_) => Err(record_and_reject(conn, device_type, username, AuthRejection::basic(realm)).await),
        },
    }
}

async fn authenticate_digest(
    conn: &mut AsyncPgConnection,
    realm: &str,
    encryption_key: &[u8],
    device_type: &DeviceType,
    request: DeviceAuthRequest<'_>,
) -> Result<AuthenticatedDevice, AuthRejection> {
    let now = Utc::now().timestamp();
    let challenge = AuthRejection::digest(realm, &create_nonce(encryption_key, now));

    let Some(params) = parse_digest_authorization(request.headers) else {
        return Err(challenge);
    };

    let username = params.get("username").cloned().unwrap_or_default();

    let (Some(nonce), Some(uri), Some(response)) =
        (params.get("nonce"), params.get("uri"), params.get("response"))
    else {
        return Err(record_and_reject(conn, device_type, username, challenge).await);
    };

    if username.is_empty() || !validate_nonce(encryption_key, nonce, now) {
        return Err(record_and_reject(conn, device_type, username, challenge).await);
    }

    if uri.as_str() != request.uri_path {
        return Err(record_and_reject(conn, device_type, username, challenge).await);
    }

    // Digest verification needs a recoverable password, which only
    // secret-backed credentials provide.
    let secret =
        match resolve_secret_credentials(conn, encryption_key, device_type, request, &username).await
        {
            Ok(secret) => secret,
            Err(_) => return Err(challenge),
        };
    let Some(secret) = secret else {
        return Err(record_and_reject(conn, device_type, username, challenge).await);
    };
    if secret.secret_name != username {
        return Err(record_and_reject(conn, device_type, username, challenge).await);
    }

    let nc = params.get("nc").map(String::as_str).unwrap_or("");
    let cnonce = params.get("cnonce").map(String::as_str).unwrap_or("");
    let qop = params.get("qop").map(String::as_str);

    let expected = digest_response(
        &username,
        realm,
        &secret.value,
        request.method,
        uri,
        nonce,
        nc,
        cnonce,
        qop,
    );

    if expected != *response {
        return Err(record_and_reject(conn, device_type, username, challenge).await);
    }

    Ok(AuthenticatedDevice {
        device_id: Some(secret.device_id),
        username: Some(username),
        via_secret: true,
    })
}

async fn authenticate_x509(
    conn: &mut AsyncPgConnection,
    device_type: &DeviceType,
    request: DeviceAuthRequest<'_>,
) -> Result<AuthenticatedDevice, AuthRejection> {
    let subject = request
        .headers
        .get(CLIENT_SUBJECT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let Some(subject) = subject else {
        return Err(AuthRejection::bare());
    };

    let device = resolve_requested_device(conn, device_type, request, &subject)
        .await
        .map_err(|_| AuthRejection::bare())?;

    match device {
        Some(device)
            if device.enabled && device.certificate_subject.as_deref() == Some(subject.as_str()) =>
        {
            Ok(AuthenticatedDevice {
                device_id: Some(device.id),
                username: Some(subject),
                via_secret: false,
            })
        }
        _ => Err(record_and_reject(conn, device_type, subject, AuthRejection::bare()).await),
    }
}

struct ResolvedSecretCredentials {
    device_id: i32,
    secret_name: String,
    value: String,
}

/// Resolves the credential DeviceSecret for the request context: the device
/// is identified by the uuid path segment, the `device` query parameter or
/// the presented username, in that order; the secret definition is the
/// device type's credential secret.
async fn resolve_secret_credentials(
    conn: &mut AsyncPgConnection,
    encryption_key: &[u8],
    device_type: &DeviceType,
    request: DeviceAuthRequest<'_>,
    username: &str,
) -> Result<Option<ResolvedSecretCredentials>, diesel::result::Error> {
    use crate::db::schema::device_secret::dsl as secret_dsl;
    use crate::db::schema::device_type_secret::dsl as dts_dsl;

    let Some(requested_device) = resolve_requested_device(conn, device_type, request, username).await?
    else {
        return Ok(None);
    };

    let definition: Option<DeviceTypeSecret> = dts_dsl::device_type_secret
        .filter(dts_dsl::device_type.eq(device_type.id))
        .filter(dts_dsl::is_credential.eq(true))
        .order(dts_dsl::id.asc())
        .select(DeviceTypeSecret::as_select())
        .first(conn)
        .await
        .optional()?;

    let Some(definition) = definition else {
        return Ok(None);
    };

    let secret: Option<DeviceSecret> = secret_dsl::device_secret
        .filter(secret_dsl::device.eq(requested_device.id))
        .filter(secret_dsl::device_type_secret.eq(definition.id))
        .select(DeviceSecret::as_select())
        .first(conn)
        .await
        .optional()?;

    let Some(secret) = secret else {
        return Ok(None);
    };
    let Some(stored_value) = secret.value.as_deref() else {
        return Ok(None);
    };

    let value = match secrets::decrypt_secret_value(encryption_key, stored_value) {
        Ok(value) => value.to_string(),
        Err(e) => {
            warn!(
                "Failed to decrypt credential secret for device {}: {}",
                requested_device.id, e
            );
            return Ok(None);
        }
    };

    Ok(Some(ResolvedSecretCredentials {
        device_id: requested_device.id,
        secret_name: definition.name,
        value,
    }))
}

async fn resolve_requested_device(
    conn: &mut AsyncPgConnection,
    device_type: &DeviceType,
    request: DeviceAuthRequest<'_>,
    username: &str,
) -> Result<Option<Device>, diesel::result::Error> {
    use crate::db::schema::device::dsl as device_dsl;

    if let Some(device_uuid) = request.uuid {
        return device_dsl::device
            .filter(device_dsl::uuid.eq(device_uuid))
            .filter(device_dsl::device_type.eq(device_type.id))
            .select(Device::as_select())
            .first(conn)
            .await
            .optional();
    }

    let device_name = request.device_query.unwrap_or(username);
    if device_name.is_empty() {
        return Ok(None);
    }

    device_dsl::device
        .filter(device_dsl::name.eq(device_name))
        .filter(device_dsl::device_type.eq(device_type.id))
        .select(Device::as_select())
        .first(conn)
        .await
        .optional()
}

async fn check_device_user(
    conn: &mut AsyncPgConnection,
    device_type: &DeviceType,
    username: &str,
    password: &str,
) -> Result<Device, ()> {
    use crate::db::schema::device::dsl as device_dsl;

    let device: Option<Device> = device_dsl::device
        .filter(device_dsl::name.eq(username))
        .filter(device_dsl::device_type.eq(device_type.id))
        .select(Device::as_select())
        .first(conn)
        .await
        .optional()
        .map_err(|_| ())?;

    let Some(device) = device else {
        return Err(());
    };

    if !device.enabled {
        return Err(());
    }

    match &device.password_hash {
        Some(stored_hash) if *stored_hash == sha256_hex(password) => Ok(device),
        _ => Err(()),
    }
}

/// Failed-attempt bookkeeping happens regardless of which authenticator
/// rejected the request, keyed by the presented username even when no user
/// could be resolved.
async fn record_and_reject(
    conn: &mut AsyncPgConnection,
    device_type: &DeviceType,
    username: String,
    rejection: AuthRejection,
) -> AuthRejection {
    use crate::db::schema::device_failed_login_attempt::dsl as attempt_dsl;

    info!(
        "Device authentication failed for user '{}' (device type '{}')",
        username, device_type.name
    );

    let attempt = NewDeviceFailedLoginAttempt {
        device_type: Some(device_type.id),
        username,
        created_at: Utc::now().naive_utc(),
    };

    if let Err(e) = diesel::insert_into(attempt_dsl::device_failed_login_attempt)
        .values(&attempt)
        .execute(conn)
        .await
    {
        warn!("Failed to record device failed login attempt: {e}");
    }

    rejection
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_authorization_parsing() {
        let mut headers = HeaderMap::new();
        assert!(parse_basic_authorization(&headers).is_none());

        let encoded = STANDARD.encode("router-1:pass:word");
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().expect("header value"),
        );

        let (username, password) = parse_basic_authorization(&headers).expect("credentials");
        assert_eq!(username, "router-1");
        assert_eq!(password, "pass:word");
    }

    #[test]
    fn digest_params_parsing_handles_quoted_and_plain_values() {
        let params = parse_digest_params(
            r#"username="router-1", realm="devices", nonce="abc", uri="/t/config", qop=auth, nc=00000001, cnonce="xyz", response="ffff", algorithm=SHA-256"#,
        );

        assert_eq!(params.get("username").map(String::as_str), Some("router-1"));
        assert_eq!(params.get("qop").map(String::as_str), Some("auth"));
        assert_eq!(params.get("nc").map(String::as_str), Some("00000001"));
        assert_eq!(params.get("algorithm").map(String::as_str), Some("SHA-256"));
    }

    #[test]
    fn nonce_round_trip_and_expiry() {
        let key = b"0123456789abcdef0123456789abcdef";
        let nonce = create_nonce(key, 1_000_000);

        assert!(validate_nonce(key, &nonce, 1_000_000));
        assert!(validate_nonce(key, &nonce, 1_000_000 + NONCE_MAX_AGE_SECONDS));
        assert!(!validate_nonce(key, &nonce, 1_000_000 + NONCE_MAX_AGE_SECONDS + 1));
        assert!(!validate_nonce(key, &nonce, 999_999));
        assert!(!validate_nonce(b"another-key-entirely-0123456789a", &nonce, 1_000_000));
        assert!(!validate_nonce(key, "not-base64!", 1_000_000));
    }

    #[test]
    fn digest_response_matches_known_computation() {
        // Hand-computed with the same SHA-256 composition.
        let ha1 = sha256_hex("user:devices:secret");
        let ha2 = sha256_hex("POST:/t/config");
        let expected = sha256_hex(&format!("{ha1}:nonce-1:01:cn:auth:{ha2}"));

        assert_eq!(
            digest_response(
                "user", "devices", "secret", "POST", "/t/config", "nonce-1", "01", "cn",
                Some("auth")
            ),
            expected
        );

        let without_qop = sha256_hex(&format!("{ha1}:nonce-1:{ha2}"));
        assert_eq!(
            digest_response("user", "devices", "secret", "POST", "/t/config", "nonce-1", "", "", None),
            without_qop
        );
    }

    #[test]
    fn secret_credentials_decision_table() {
        assert_eq!(
            evaluate_secret_credentials(None, "user", "pass"),
            SecretAuthOutcome::NoSecret
        );
        assert_eq!(
            evaluate_secret_credentials(Some(("user", "pass")), "user", "pass"),
            SecretAuthOutcome::Matched
        );
        assert_eq!(
            evaluate_secret_credentials(Some(("user", "pass")), "user", "wrong"),
            SecretAuthOutcome::Mismatch
        );
        assert_eq!(
            evaluate_secret_credentials(Some(("other", "pass")), "user", "pass"),
            SecretAuthOutcome::Mismatch
        );
    }
}
