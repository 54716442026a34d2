//! Database connection credentials
//!
//! Credentials come exclusively from the environment; they are never
//! read from configuration files and never appear in logs or `Debug`
//! output.

use crate::validate::ValidationError;
use std::env;
use std::fmt;

/// Connection credentials for a remote multi-model store.
///
/// `Debug` redacts the password.
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    password: String,
    pub database: String,
}

impl Credentials {
    /// Read credentials from `DB_HOST`, `DB_PORT`, `DB_USERNAME`,
    /// `DB_PASSWORD`, and `DB_DATABASE`.
    ///
    /// A missing `DB_PASSWORD` aborts startup unless the caller opts in
    /// to the development default (empty password on localhost).
    pub fn from_env(allow_dev_default: bool) -> Result<Self, ValidationError> {
        let password = match env::var("DB_PASSWORD") {
            Ok(p) => p,
            Err(_) if allow_dev_default => String::new(),
            Err(_) => {
                return Err(ValidationError::Config(
                    "DB_PASSWORD is not set and the development default was not requested".into(),
                ))
            }
        };
        let port = match env::var("DB_PORT") {
            Ok(p) => p
                .parse()
                .map_err(|_| ValidationError::Config(format!("DB_PORT is not a port: {p:?}")))?,
            Err(_) => 8529,
        };
        Ok(Self {
            host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port,
            username: env::var("DB_USERNAME").unwrap_or_else(|_| "root".to_string()),
            password,
            database: env::var("DB_DATABASE").unwrap_or_else(|_| "_system".to_string()),
        })
    }

    /// The password, for handing to a database driver.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let creds = Credentials {
            host: "localhost".into(),
            port: 8529,
            username: "root".into(),
            password: "s3cret".into(),
            database: "er".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
