use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::Sha256;

use crate::{error::AppError, models::SecretSyncPolicy};

type HmacSha256 = Hmac<Sha256>;

const DERIVATION_VERSION: &str = "v1";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const DEFAULT_SECRET_DATA_KEY: &str = "value";

static IDEMPOTENCY_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:/-]+$").expect("idempotency key pattern is valid"));

/// Where one secret value lands: GitHub environment secret plus Kubernetes secret key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretCoordinates {
    pub project_id: String,
    pub repository: String,
    pub environment: String,
    pub github_secret_name: String,
    pub kubernetes_namespace: String,
    pub kubernetes_secret_name: String,
    pub kubernetes_secret_key: String,
}

impl SecretCoordinates {
    pub fn kubernetes_ref(&self) -> String {
        format!(
            "{}/{}#{}",
            self.kubernetes_namespace, self.kubernetes_secret_name, self.kubernetes_secret_key
        )
    }

    fn material(&self) -> Vec<&str> {
        vec![
            DERIVATION_VERSION,
            self.project_id.trim(),
            self.repository.trim(),
            self.environment.trim(),
            self.github_secret_name.trim(),
            self.kubernetes_namespace.trim(),
            self.kubernetes_secret_name.trim(),
            self.kubernetes_secret_key.trim(),
        ]
    }
}

/// An explicit value implies `provided`; without one the value is generated at random.
pub fn resolve_policy(
    requested: Option<SecretSyncPolicy>,
    has_value: bool,
) -> Result<SecretSyncPolicy, AppError> {
    match (requested, has_value) {
        (None, true) | (Some(SecretSyncPolicy::Provided), true) => Ok(SecretSyncPolicy::Provided),
        (None, false) => Ok(SecretSyncPolicy::Random),
        (Some(SecretSyncPolicy::Provided), false) => Err(AppError::BadRequest(
            "secret_value is required for policy provided".to_string(),
        )),
        (Some(policy), true) => Err(AppError::BadRequest(format!(
            "secret_value is not accepted for policy {}",
            policy.as_str()
        ))),
        (Some(policy), false) => Ok(policy),
    }
}

pub fn normalize_secret_data_key(value: &str) -> String {
    let key = value.trim();
    if key.is_empty() {
        DEFAULT_SECRET_DATA_KEY.to_string()
    } else {
        key.to_string()
    }
}

/// Empty input means "no explicit key".
pub fn normalize_idempotency_key(value: &str) -> Result<Option<String>, AppError> {
    let key = value.trim();
    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::BadRequest("idempotency_key is too long".to_string()));
    }
    if !IDEMPOTENCY_KEY_RE.is_match(key) {
        return Err(AppError::BadRequest(
            "idempotency_key contains invalid characters".to_string(),
        ));
    }
    Ok(Some(key.to_ascii_lowercase()))
}

pub fn derive_deterministic_secret_value(
    seed: &str,
    coords: &SecretCoordinates,
) -> Result<String, AppError> {
    let seed = seed.trim();
    if seed.is_empty() {
        return Err(AppError::internal("secret derivation seed is not configured"));
    }
    hmac_sha256_base64(seed, &coords.material().join("\n"))
}

/// Derived keys cover coordinates, policy and a fingerprint of the caller's value.
pub fn derive_idempotency_key(
    seed: &str,
    coords: &SecretCoordinates,
    policy: SecretSyncPolicy,
    provided_value: &str,
) -> Result<String, AppError> {
    let seed = seed.trim();
    if seed.is_empty() {
        return Err(AppError::internal("idempotency derivation seed is not configured"));
    }

    let fingerprint = if provided_value.trim().is_empty() {
        "generated".to_string()
    } else {
        hmac_sha256_base64(seed, &format!("secret:{provided_value}"))?
    };

    let mut material = coords.material();
    material.push(policy.as_str());
    material.push(&fingerprint);
    hmac_sha256_base64(seed, &material.join("\n"))
}

fn hmac_sha256_base64(key: &str, value: &str) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| AppError::internal(format!("hmac init failed: {e}")))?;
    mac.update(value.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}
