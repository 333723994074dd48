//! Database connection and migration handling.
//!
//! The pool is opened once at startup and threaded through the process as
//! an injected dependency (never a global singleton), per the redesign
//! notes on shared-module state.

use sqlx::postgres::{PgPoolOptions, PgSslMode};

use crate::config::DbConfig;
use crate::prelude::*;

pub mod models;

/// Open a connection pool and, if configured, apply embedded migrations.
pub async fn connect(config: &DbConfig) -> Result<sqlx::PgPool> {
    let ssl_mode = if config.ssl {
        PgSslMode::Require
    } else {
        PgSslMode::Prefer
    };
    let connect_options = sqlx::postgres::PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(ssl_mode);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect_with(connect_options)
        .await
        .context("failed to connect to the database")?;

    if config.synchronize {
        info!("running embedded migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
    }

    Ok(pool)
}
