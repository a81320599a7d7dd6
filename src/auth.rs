//! Accounts, password hashing and bearer sessions.
//!
//! Tokens are opaque: the client gets 32 random bytes as hex, the database only
//! ever sees their SHA-256. A login hands out a short-lived access token and a
//! longer-lived refresh token that can be traded for fresh access tokens.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use chrono::{Duration, NaiveDateTime};
use log::{debug, info};
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::models::User;

pub static TOKEN_LIFETIME: Lazy<Duration> = Lazy::new(|| Duration::hours(24));
pub static REFRESH_TOKEN_LIFETIME: Lazy<Duration> = Lazy::new(|| Duration::days(7));

/// Tests hash with cheap parameters.
const INSECURE_HASHING: bool = cfg!(test);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not hash password")]
    HashPassword(#[source] argon2::password_hash::Error),

    #[error("Could not run password hashing")]
    HashingTask(#[source] tokio::task::JoinError),

    #[error("Username `{0}` is already taken")]
    UsernameTaken(String),

    #[error("Could not create user")]
    CreateUser(#[source] sqlx::Error),

    #[error("Could not query user")]
    QueryUser(#[source] sqlx::Error),

    #[error("Could not create session")]
    CreateSession(#[source] sqlx::Error),

    #[error("Could not query session")]
    QuerySession(#[source] sqlx::Error),

    #[error("Could not create refresh token")]
    CreateRefreshToken(#[source] sqlx::Error),

    #[error("Could not query refresh token")]
    QueryRefreshToken(#[source] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub access: String,
    pub expires_at: NaiveDateTime,
}

/// What a login returns: an access token plus the refresh token that renews it.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    #[serde(flatten)]
    pub access: IssuedToken,
    pub refresh: String,
    pub refresh_expires_at: NaiveDateTime,
}

fn hasher(insecure: bool) -> Argon2<'static> {
    if insecure {
        Params::new(1024, 1, 1, None)
            .map(|params| Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
            .unwrap_or_default()
    } else {
        Argon2::default()
    }
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher(INSECURE_HASHING).hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    hasher(INSECURE_HASHING)
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// [`hash_password`] on the blocking pool.
async fn hash_password_blocking(password: String) -> Result<String, Error> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(Error::HashingTask)?
        .map_err(Error::HashPassword)
}

/// [`verify_password`] on the blocking pool.
async fn verify_password_blocking(password: String, hash: String) -> Result<bool, Error> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(Error::HashingTask)
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

async fn find_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>, Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, email, password_hash, date_joined FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
    .map_err(Error::QueryUser)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

pub async fn register(
    pool: &SqlitePool,
    username: &str,
    email: &str,
    password: &str,
    now: NaiveDateTime,
) -> Result<User, Error> {
    if find_by_username(pool, username).await?.is_some() {
        return Err(Error::UsernameTaken(username.to_string()));
    }

    let password_hash = hash_password_blocking(password.to_string()).await?;

    let id = sqlx::query(
        "INSERT INTO users (username, email, password_hash, date_joined) VALUES (?, ?, ?, ?)",
    )
    .bind(username)
    .bind(email)
    .bind(&password_hash)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            Error::UsernameTaken(username.to_string())
        } else {
            Error::CreateUser(err)
        }
    })?
    .last_insert_rowid();

    info!("Registered user {username} ({id})");

    Ok(User {
        id,
        username: username.to_string(),
        email: email.to_string(),
        password_hash,
        date_joined: now,
    })
}

/// Checks a username/password pair.
pub async fn authenticate(
    pool: &SqlitePool,
    username: &str,
    password: &str,
) -> Result<Option<User>, Error> {
    let Some(user) = find_by_username(pool, username).await? else {
        return Ok(None);
    };

    let matches =
        verify_password_blocking(password.to_string(), user.password_hash.clone()).await?;

    Ok(matches.then_some(user))
}

pub async fn issue_token(
    pool: &SqlitePool,
    user_id: i64,
    now: NaiveDateTime,
) -> Result<IssuedToken, Error> {
    let access = generate_token();
    let expires_at = now + *TOKEN_LIFETIME;

    sqlx::query(
        "INSERT INTO sessions (user_id, token_hash, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(hash_token(&access))
    .bind(now)
    .bind(expires_at)
    .execute(pool)
    .await
    .map_err(Error::CreateSession)?;

    debug!("Issued token for user {user_id} valid until {expires_at}");

    Ok(IssuedToken { access, expires_at })
}

/// Issues an access token and a refresh token for `user_id`.
pub async fn issue_token_pair(
    pool: &SqlitePool,
    user_id: i64,
    now: NaiveDateTime,
) -> Result<TokenPair, Error> {
    let access = issue_token(pool, user_id, now).await?;

    let refresh = generate_token();
    let refresh_expires_at = now + *REFRESH_TOKEN_LIFETIME;

    sqlx::query(
        "INSERT INTO refresh_tokens (user_id, token_hash, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(hash_token(&refresh))
    .bind(now)
    .bind(refresh_expires_at)
    .execute(pool)
    .await
    .map_err(Error::CreateRefreshToken)?;

    debug!("Issued refresh token for user {user_id} valid until {refresh_expires_at}");

    Ok(TokenPair {
        access,
        refresh,
        refresh_expires_at,
    })
}

/// Trades a live refresh token for a new access token. The refresh token stays valid.
///
/// Returns `None` when `refresh` is unknown or expired at `now`.
pub async fn refresh_access_token(
    pool: &SqlitePool,
    refresh: &str,
    now: NaiveDateTime,
) -> Result<Option<IssuedToken>, Error> {
    let owner: Option<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM refresh_tokens WHERE token_hash = ? AND expires_at > ?",
    )
    .bind(hash_token(refresh))
    .bind(now)
    .fetch_optional(pool)
    .await
    .map_err(Error::QueryRefreshToken)?;

    match owner {
        Some((user_id,)) => issue_token(pool, user_id, now).await.map(Some),
        None => Ok(None),
    }
}

/// The owner of `token`, if the token is known and not expired at `now`.
pub async fn user_for_token(
    pool: &SqlitePool,
    token: &str,
    now: NaiveDateTime,
) -> Result<Option<User>, Error> {
    sqlx::query_as::<_, User>(
        "SELECT u.id, u.username, u.email, u.password_hash, u.date_joined \
         FROM sessions s JOIN users u ON u.id = s.user_id \
         WHERE s.token_hash = ? AND s.expires_at > ?",
    )
    .bind(hash_token(token))
    .bind(now)
    .fetch_optional(pool)
    .await
    .map_err(Error::QuerySession)
}
