//! Client certificates and trust stores
//!
//! Parsed from strings such as `"sslcert=client.pem,sslkey=client.key"`.
//! Every `ssl*`, `keypasswd` and `ca*` key also exists with a `proxy_`
//! prefix for the TLS session with an HTTPS proxy.

use crate::cskv;
use crate::error::ConfigError;
use crate::sink::Sink;
use crate::types::*;
use curl::easy::Easy2;
use curl_sys::CURLoption;
use std::fmt;

/// TLS material for one side of a connection
#[derive(Clone, PartialEq, Eq, Default)]
pub struct TlsFiles {
    pub cert: String,
    pub cert_type: String,
    pub key: String,
    pub key_type: String,
    pub key_password: String,
    pub ca_info: String,
    pub ca_path: String,
}

impl fmt::Debug for TlsFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsFiles")
            .field("cert", &self.cert)
            .field("cert_type", &self.cert_type)
            .field("key", &self.key)
            .field("key_type", &self.key_type)
            .field("ca_info", &self.ca_info)
            .field("ca_path", &self.ca_path)
            .finish_non_exhaustive()
    }
}

impl TlsFiles {
    fn field_mut(&mut self, key: &str) -> Option<&mut String> {
        Some(match key {
            "sslcert" => &mut self.cert,
            "sslcerttype" => &mut self.cert_type,
            "sslkey" => &mut self.key,
            "sslkeytype" => &mut self.key_type,
            "keypasswd" => &mut self.key_password,
            "cainfo" => &mut self.ca_info,
            "capath" => &mut self.ca_path,
            _ => return None,
        })
    }
}

struct TlsOptions {
    cert: CURLoption,
    cert_type: CURLoption,
    key: CURLoption,
    key_type: CURLoption,
    key_password: CURLoption,
    ca_info: CURLoption,
    ca_path: CURLoption,
}

const PEER: TlsOptions = TlsOptions {
    cert: CURLOPT_SSLCERT,
    cert_type: CURLOPT_SSLCERTTYPE,
    key: CURLOPT_SSLKEY,
    key_type: CURLOPT_SSLKEYTYPE,
    key_password: CURLOPT_KEYPASSWD,
    ca_info: CURLOPT_CAINFO,
    ca_path: CURLOPT_CAPATH,
};

const PROXY: TlsOptions = TlsOptions {
    cert: CURLOPT_PROXY_SSLCERT,
    cert_type: CURLOPT_PROXY_SSLCERTTYPE,
    key: CURLOPT_PROXY_SSLKEY,
    key_type: CURLOPT_PROXY_SSLKEYTYPE,
    key_password: CURLOPT_PROXY_KEYPASSWD,
    ca_info: CURLOPT_PROXY_CAINFO,
    ca_path: CURLOPT_PROXY_CAPATH,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Certificates {
    pub peer: TlsFiles,
    pub proxy: TlsFiles,
    /// OpenSSL engine identifier
    pub engine: String,
    default_ca_info: String,
    default_ca_path: String,
}

impl Certificates {
    /// Empty settings whose CA locations fall back to the given defaults.
    pub(crate) fn with_default_ca(ca_info: &str, ca_path: &str) -> Self {
        Self {
            default_ca_info: ca_info.to_string(),
            default_ca_path: ca_path.to_string(),
            ..Self::default()
        }
    }

    /// Trust store libcurl used when the engine started.
    #[must_use]
    pub fn default_ca_info(&self) -> &str {
        &self.default_ca_info
    }

    #[must_use]
    pub fn default_ca_path(&self) -> &str {
        &self.default_ca_path
    }

    /// Merge a CSKV string into these settings. An empty value resets the
    /// entry to its default.
    ///
    /// Either every entry applies or none does.
    pub fn set(&mut self, cskv: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        cskv::parse(cskv, |key, value| {
            let field = match key.strip_prefix("proxy_") {
                Some(rest) => next.proxy.field_mut(rest),
                None if key == "engine" => Some(&mut next.engine),
                None => next.peer.field_mut(key),
            };
            let field = field.ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
            *field = value.to_string();
            Ok(())
        })?;
        *self = next;
        Ok(())
    }

    pub(crate) fn apply(&self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        setopt_str_or_reset(easy, CURLOPT_SSLENGINE, &self.engine)?;
        self.apply_side(easy, &self.peer, &PEER)?;
        self.apply_side(easy, &self.proxy, &PROXY)
    }

    fn apply_side(
        &self,
        easy: &mut Easy2<Sink>,
        files: &TlsFiles,
        options: &TlsOptions,
    ) -> Result<(), curl::Error> {
        setopt_str_or_reset(easy, options.cert, &files.cert)?;
        setopt_str_or_reset(easy, options.cert_type, &files.cert_type)?;
        setopt_str_or_reset(easy, options.key, &files.key)?;
        setopt_str_or_reset(easy, options.key_type, &files.key_type)?;
        setopt_str_or_reset(easy, options.key_password, &files.key_password)?;
        set_ca(easy, options.ca_info, &files.ca_info, &self.default_ca_info)?;
        set_ca(easy, options.ca_path, &files.ca_path, &self.default_ca_path)
    }
}

// NULL does not restore libcurl's built-in CA location, so an empty value
// restores the location captured at startup, or leaves the option alone if
// none was captured.
fn set_ca(
    easy: &mut Easy2<Sink>,
    option: CURLoption,
    value: &str,
    default: &str,
) -> Result<(), curl::Error> {
    let value = if value.is_empty() { default } else { value };
    if value.is_empty() {
        return Ok(());
    }
    setopt_str(easy, option, Some(value))
}
