use std::sync::Arc;

use sqlx::SqlitePool;

use crate::{
    audit::{AuditTrail, SqliteAuditSink},
    clients::Clients,
    config::Config,
    crypto::TokenCrypt,
    error::AppError,
    policy::ToolCatalog,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: SqlitePool,
    pub catalog: Arc<ToolCatalog>,
    pub crypt: TokenCrypt,
    pub clients: Clients,
    pub audit: AuditTrail,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool, clients: Clients) -> Result<Self, AppError> {
        let crypt = TokenCrypt::from_hex_key(&config.credential_encryption_key)?;
        let audit = AuditTrail::new(
            Arc::new(SqliteAuditSink::new(db.clone())),
            config.server_name.clone(),
        );

        Ok(Self {
            catalog: Arc::new(ToolCatalog::default_catalog()),
            config,
            db,
            crypt,
            clients,
            audit,
        })
    }
}
