use anyhow::Result;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Be explicit about TLS when the DSN asks for it.
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // Prepared statements break under transaction-mode poolers
        // (PgBouncer et al.); opt back in with USE_PREPARED=1.
        if !env_flag("USE_PREPARED", false) {
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");

        // This crate owns the single table it writes, so migrations run by
        // default; AUTO_MIGRATE=0 skips them for restricted environments.
        if env_flag("AUTO_MIGRATE", true) {
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("migrations up-to-date");
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }

        Ok(Self { pool })
    }
}
