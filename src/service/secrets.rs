use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use chrono::Utc;
use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use log::{error, info};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::db::models::{
    Device, DeviceSecret, DeviceTypeSecret, NewDeviceSecret, NewSecretLog, SecretLogAction,
};

const NONCE_LENGTH: usize = 12;
const SECRET_VALUE_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("invalid encryption key length")]
    Key,
    #[error("secret encryption failed")]
    Encryption,
    #[error("secret decryption failed")]
    Decryption,
    #[error("random generator unavailable")]
    Random,
}

/// Encrypts a secret value for storage. Stored layout: 12-byte nonce
/// followed by the AES-256-GCM ciphertext.
pub fn encrypt_secret_value(key: &[u8], plaintext: &str) -> Result<Vec<u8>, SecretError> {
    if key.len() != 32 {
        return Err(SecretError::Key);
    }

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    getrandom::fill(&mut nonce_bytes).map_err(|_| SecretError::Random)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| SecretError::Encryption)?;

    let mut stored = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    stored.extend_from_slice(&nonce_bytes);
    stored.extend_from_slice(&ciphertext);
    Ok(stored)
}

pub fn decrypt_secret_value(key: &[u8], stored: &[u8]) -> Result<Zeroizing<String>, SecretError> {
    if key.len() != 32 {
        return Err(SecretError::Key);
    }
    if stored.len() <= NONCE_LENGTH {
        return Err(SecretError::Decryption);
    }

    let (nonce_bytes, ciphertext) = stored.split_at(NONCE_LENGTH);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SecretError::Decryption)?;

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| SecretError::Decryption)
}

/// Generates a fresh secret value from an alphanumeric charset.
pub fn generate_secret_value() -> Result<Zeroizing<String>, SecretError> {
    const CHARSET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                              abcdefghijklmnopqrstuvwxyz\
                              0123456789";
    let mut buf = [0u8; SECRET_VALUE_LENGTH];
    getrandom::fill(&mut buf).map_err(|_| SecretError::Random)?;

    let value: String = buf
        .iter()
        .map(|&b| {
            let idx = (b as usize) % CHARSET.len();
            CHARSET[idx] as char
        })
        .collect();

    Ok(Zeroizing::new(value))
}

/// Decision for one secret during a device check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    Keep,
    Generate,
    Renew,
}

/// Pure renewal policy evaluation: generate when the value is missing and the
/// policy allows generation, renew when forced and the policy allows renewal.
pub fn renewal_decision(
    policy: crate::db::models::SecretRenewalPolicy,
    has_value: bool,
    force_renewal: bool,
) -> RenewalDecision {
    if !has_value && policy.allows_generate() {
        return RenewalDecision::Generate;
    }
    if has_value && force_renewal && policy.allows_renew() {
        return RenewalDecision::Renew;
    }
    RenewalDecision::Keep
}

/// Runs secret auto-generation/renewal for one device during check-in. Every
/// change is appended to the secret log.
pub async fn process_auto_generation_or_renew(
    conn: &mut AsyncPgConnection,
    checked_in_device: &Device,
    encryption_key: &[u8],
) -> Result<(), diesel::result::Error> {
    use crate::db::schema::device_secret::dsl as secret_dsl;
    use crate::db::schema::device_type_secret::dsl as dts_dsl;
    use crate::db::schema::secret_log::dsl as log_dsl;

    let definitions: Vec<DeviceTypeSecret> = dts_dsl::device_type_secret
        .filter(dts_dsl::device_type.eq(checked_in_device.device_type))
        .select(DeviceTypeSecret::as_select())
        .load(conn)
        .await?;

    for definition in definitions {
        let existing: Option<DeviceSecret> = secret_dsl::device_secret
            .filter(secret_dsl::device.eq(checked_in_device.id))
            .filter(secret_dsl::device_type_secret.eq(definition.id))
            .select(DeviceSecret::as_select())
            .first(conn)
            .await
            .optional()?;

        let (has_value, force_renewal) = match &existing {
            Some(secret) => (secret.value.is_some(), secret.force_renewal),
            None => (false, false),
        };

        let decision = renewal_decision(definition.renewal_policy, has_value, force_renewal);
        if RenewalDecision::Keep == decision {
            continue;
        }

        let value = match generate_secret_value() {
            Ok(value) => value,
            Err(e) => {
                error!(
                    "Failed to generate secret '{}' for device {}: {}",
                    definition.name, checked_in_device.id, e
                );
                continue;
            }
        };
        let encrypted = match encrypt_secret_value(encryption_key, &value) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                error!(
                    "Failed to encrypt secret '{}' for device {}: {}",
                    definition.name, checked_in_device.id, e
                );
                continue;
            }
        };

        let now = Utc::now().naive_utc();
        let secret_id = match existing {
            Some(secret) => {
                diesel::update(secret_dsl::device_secret.filter(secret_dsl::id.eq(secret.id)))
                    .set((
                        secret_dsl::value.eq(Some(encrypted)),
                        secret_dsl::force_renewal.eq(false),
                        secret_dsl::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                secret.id
            }
            None => {
                let new_secret = NewDeviceSecret {
                    device: checked_in_device.id,
                    device_type_secret: definition.id,
                    value: Some(encrypted),
                    force_renewal: false,
                    updated_at: now,
                };
                let inserted: DeviceSecret = diesel::insert_into(secret_dsl::device_secret)
                    .values(&new_secret)
                    .returning(DeviceSecret::as_returning())
                    .get_result(conn)
                    .await?;
                inserted.id
            }
        };

        let action = match decision {
            RenewalDecision::Generate => SecretLogAction::Generated,
            RenewalDecision::Renew => SecretLogAction::Renewed,
            RenewalDecision::Keep => unreachable!("keep decisions are skipped above"),
        };
        diesel::insert_into(log_dsl::secret_log)
            .values(&NewSecretLog {
                device_secret: secret_id,
                action,
                created_at: now,
            })
            .execute(conn)
            .await?;

        info!(
            "Secret '{}' {} for device {}",
            definition.name,
            match decision {
                RenewalDecision::Generate => "generated",
                RenewalDecision::Renew => "renewed",
                RenewalDecision::Keep => "kept",
            },
            checked_in_device.id
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::SecretRenewalPolicy;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let stored = encrypt_secret_value(&key, "s3cret-value").expect("encrypts");
        assert_ne!(&stored[NONCE_LENGTH..], b"s3cret-value");

        let decrypted = decrypt_secret_value(&key, &stored).expect("decrypts");
        assert_eq!(decrypted.as_str(), "s3cret-value");
    }

    #[test]
    fn decrypt_rejects_wrong_key_and_truncated_values() {
        let key = [7u8; 32];
        let other_key = [8u8; 32];
        let stored = encrypt_secret_value(&key, "value").expect("encrypts");

        assert!(decrypt_secret_value(&other_key, &stored).is_err());
        assert!(decrypt_secret_value(&key, &stored[..NONCE_LENGTH]).is_err());
        assert!(decrypt_secret_value(&[0u8; 16], &stored).is_err());
    }

    #[test]
    fn generated_values_are_alphanumeric_and_distinct() {
        let first = generate_secret_value().expect("generates");
        let second = generate_secret_value().expect("generates");

        assert_eq!(first.len(), SECRET_VALUE_LENGTH);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first.as_str(), second.as_str());
    }

    #[test]
    fn renewal_decisions_follow_policy() {
        let keep = RenewalDecision::Keep;

        assert_eq!(renewal_decision(SecretRenewalPolicy::None, false, false), keep);
        assert_eq!(
            renewal_decision(SecretRenewalPolicy::Generate, false, false),
            RenewalDecision::Generate
        );
        assert_eq!(renewal_decision(SecretRenewalPolicy::Generate, true, true), keep);
        assert_eq!(renewal_decision(SecretRenewalPolicy::Renew, false, false), keep);
        assert_eq!(
            renewal_decision(SecretRenewalPolicy::Renew, true, true),
            RenewalDecision::Renew
        );
        assert_eq!(
            renewal_decision(SecretRenewalPolicy::GenerateRenew, false, false),
            RenewalDecision::Generate
        );
        assert_eq!(
            renewal_decision(SecretRenewalPolicy::GenerateRenew, true, true),
            RenewalDecision::Renew
        );
        assert_eq!(
            renewal_decision(SecretRenewalPolicy::GenerateRenew, true, false),
            keep
        );
    }
}
