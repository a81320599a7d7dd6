use std::{env, net::SocketAddr};

use secrecy::{ExposeSecret, Secret};

pub const DATABASE_URL: &str = "sqlite://aquaflux.db";
pub const BIND_ADDRESS: &str = "0.0.0.0:8000";
pub const GEMINI_MODEL: &str = "gemini-2.0-flash-lite";
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Environment variable {name} is not valid unicode")]
    NotUnicode { name: &'static str },

    #[error("Could not parse bind address `{value}`")]
    BindAddress {
        source: std::net::AddrParseError,
        value: String,
    },
}

/// Process configuration, read from the environment once at start-up.
///
/// The Gemini credential is not stored here. It is read on every call through
/// [`gemini_api_key`].
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind: SocketAddr,
    pub gemini: GeminiSettings,
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub model: String,
    pub api_base: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            model: GEMINI_MODEL.to_string(),
            api_base: GEMINI_API_BASE.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let bind = env_var_or("AQUAFLUX_BIND", BIND_ADDRESS)?;

        Ok(Self {
            database_url: env_var_or("DATABASE_URL", DATABASE_URL)?,
            bind: bind.parse().map_err(|source| Error::BindAddress {
                source,
                value: bind.clone(),
            })?,
            gemini: GeminiSettings {
                model: env_var_or("GEMINI_MODEL", GEMINI_MODEL)?,
                api_base: env_var_or("GEMINI_API_BASE", GEMINI_API_BASE)?,
            },
        })
    }
}

#[inline]
fn env_var_or(name: &'static str, default: &str) -> Result<String, Error> {
    match env::var(name) {
        Ok(value) => Ok(value),
        Err(env::VarError::NotPresent) => Ok(default.to_string()),
        Err(env::VarError::NotUnicode(_)) => Err(Error::NotUnicode { name }),
    }
}

/// Reads the Gemini API key. Empty values count as unset.
pub fn gemini_api_key() -> Option<Secret<String>> {
    env::var(GEMINI_API_KEY_VAR)
        .ok()
        .map(Secret::new)
        .filter(|key| !key.expose_secret().trim().is_empty())
}
