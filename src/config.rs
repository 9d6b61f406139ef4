use std::env;

use crate::error::AppError;

pub const DEFAULT_TOKEN_ISSUER: &str = "control-plane/mcp";
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const DEFAULT_TOKEN_MAX_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub server_name: String,
    pub token_signing_key: String,
    pub token_issuer: String,
    pub token_ttl_seconds: i64,
    pub token_min_ttl_seconds: i64,
    pub token_max_ttl_seconds: i64,
    pub database_lifecycle_allowed_envs: Vec<String>,
    pub approval_ttl_seconds: i64,
    pub delegated_auto_apply: bool,
    pub secret_derivation_seed: String,
    pub credential_encryption_key: String,
    pub internal_api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let token_signing_key = env::var("MCP_TOKEN_SIGNING_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::internal("MCP_TOKEN_SIGNING_KEY is required"))?;

        let credential_encryption_key = env::var("TOKEN_ENCRYPTION_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::internal("TOKEN_ENCRYPTION_KEY is required"))?;

        let secret_derivation_seed = env::var("MCP_SECRET_DERIVATION_SEED")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| token_signing_key.clone());

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8081".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/control-plane.db".to_string()),
            server_name: env::var("MCP_SERVER_NAME")
                .unwrap_or_else(|_| "control-plane-mcp".to_string()),
            token_signing_key,
            token_issuer: env::var("MCP_TOKEN_ISSUER")
                .unwrap_or_else(|_| DEFAULT_TOKEN_ISSUER.to_string()),
            token_ttl_seconds: env::var("MCP_TOKEN_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TOKEN_TTL_SECONDS),
            token_min_ttl_seconds: env::var("MCP_TOKEN_MIN_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TOKEN_TTL_SECONDS),
            token_max_ttl_seconds: env::var("MCP_TOKEN_MAX_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TOKEN_MAX_TTL_SECONDS),
            database_lifecycle_allowed_envs: parse_env_list(
                &env::var("MCP_DATABASE_LIFECYCLE_ALLOWED_ENVS").unwrap_or_default(),
            ),
            approval_ttl_seconds: env::var("MCP_APPROVAL_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(86_400),
            delegated_auto_apply: env::var("MCP_DELEGATED_AUTO_APPLY")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(false),
            secret_derivation_seed,
            credential_encryption_key,
            internal_api_token: env::var("MCP_INTERNAL_API_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }
}

/// Splits a comma separated environment list, falling back to `dev,staging,prod`.
pub fn parse_env_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.split(',') {
        let item = item.trim().to_lowercase();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    if out.is_empty() {
        return ["dev", "staging", "prod"].iter().map(|v| v.to_string()).collect();
    }
    out
}
