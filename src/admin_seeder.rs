//! One-shot administrator bootstrap, run once at startup before the
//! tasker loop begins.

use bcrypt::{DEFAULT_COST, hash};

use crate::prelude::*;
use crate::repository::Repository;

/// Ensure an administrator user exists. If a user is already registered
/// under `login` or `email`, logs and returns without writing anything;
/// otherwise inserts a new admin user with a bcrypt-hashed password.
/// Idempotent across restarts.
#[instrument(level = "info", skip(repo, password), fields(login))]
pub async fn seed_admin(repo: &Repository, login: &str, email: &str, password: &str, salt_rounds: u32) -> Result<()> {
    if let Some(existing) = repo.find_user_by_login_or_email(login, email).await? {
        info!(
            "admin user already present (login={}, email={}), skipping seed",
            existing.login, existing.email
        );
        return Ok(());
    }

    let cost = if salt_rounds == 0 { DEFAULT_COST } else { salt_rounds };
    let password_hash = hash(password, cost).context("failed to hash admin password")?;
    repo.insert_admin_user(login, email, &password_hash).await?;
    info!("created admin user login={login}");
    Ok(())
}
