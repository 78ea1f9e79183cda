//! Transfer credentials
//!
//! Parsed from strings such as `"mode=basic,user=joe,secret=abc123"`.

use crate::cskv;
use crate::error::ConfigError;
use crate::sink::Sink;
use crate::types::{
    CURLAUTH_BASIC, CURLAUTH_BEARER, CURLAUTH_DIGEST, CURLOPT_PASSWORD, CURLOPT_USERNAME,
    CURLOPT_XOAUTH2_BEARER, setopt_httpauth, setopt_str,
};
use curl::easy::Easy2;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    Basic,
    Digest,
    /// OAuth 2.0 bearer token taken from the secret
    Bearer,
}

impl FromStr for AuthMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "basic" => Ok(Self::Basic),
            "digest" => Ok(Self::Digest),
            "bearer" => Ok(Self::Bearer),
            _ => Err(()),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct Authentication {
    pub mode: AuthMode,
    pub user: String,
    /// Password, or the token in bearer mode
    pub secret: String,
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentication")
            .field("mode", &self.mode)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Authentication {
    /// Merge a CSKV string into these credentials.
    ///
    /// Either every entry applies or none does.
    pub fn set(&mut self, cskv: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        cskv::parse(cskv, |key, value| {
            match key {
                "mode" => {
                    next.mode = value
                        .parse()
                        .map_err(|()| ConfigError::invalid(key, value))?
                }
                "user" => next.user = value.to_string(),
                "secret" => next.secret = value.to_string(),
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
            Ok(())
        })?;
        *self = next;
        Ok(())
    }

    pub(crate) fn apply(&self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        // The easy handle is reused across transfers, so every mode clears
        // what the others set.
        match self.mode {
            AuthMode::None => {
                setopt_httpauth(easy, CURLAUTH_BASIC)?;
                setopt_str(easy, CURLOPT_USERNAME, None)?;
                setopt_str(easy, CURLOPT_PASSWORD, None)?;
                setopt_str(easy, CURLOPT_XOAUTH2_BEARER, None)
            }
            AuthMode::Basic | AuthMode::Digest => {
                let scheme = if self.mode == AuthMode::Basic {
                    CURLAUTH_BASIC
                } else {
                    CURLAUTH_DIGEST
                };
                setopt_httpauth(easy, scheme)?;
                setopt_str(easy, CURLOPT_USERNAME, Some(&self.user))?;
                setopt_str(easy, CURLOPT_PASSWORD, Some(&self.secret))?;
                setopt_str(easy, CURLOPT_XOAUTH2_BEARER, None)
            }
            AuthMode::Bearer => {
                setopt_httpauth(easy, CURLAUTH_BEARER)?;
                setopt_str(easy, CURLOPT_USERNAME, None)?;
                setopt_str(easy, CURLOPT_PASSWORD, None)?;
                setopt_str(easy, CURLOPT_XOAUTH2_BEARER, Some(&self.secret))
            }
        }
    }
}
