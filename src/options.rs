//! Transfer options
//!
//! Parsed from strings such as `"timeout=5000,follow_location=1,insecure=0"`.

use crate::cskv;
use crate::error::ConfigError;
use crate::sink::Sink;
use crate::types::{
    CURLOPT_ACCEPT_ENCODING, CURLOPT_COOKIEFILE, CURLOPT_FOLLOWLOCATION,
    CURLOPT_MAIL_RCPT_ALLOWFAILS, CURLOPT_PROXY, setopt_long, setopt_str, setopt_str_or_reset,
};
use curl::easy::Easy2;
use std::time::Duration;

/// Default transfer and connect timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default redirect limit.
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Advertise every encoding libcurl can decode
    pub accept_compression: bool,
    pub connect_timeout: Duration,
    /// Enable the handle's own cookie engine
    pub cookies: bool,
    /// `CURLOPT_FOLLOWLOCATION` value: 0 never, 1 always, 2 and 3 keep the method
    pub follow_location: u8,
    /// Skip peer and host verification
    pub insecure: bool,
    pub max_redirects: u32,
    /// SOCKS or HTTP proxy URL, empty for none
    pub proxy: String,
    /// Let an SMTP send proceed when some recipients are refused
    pub rcpt_allow_fails: bool,
    pub timeout: Duration,
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            accept_compression: true,
            connect_timeout: DEFAULT_TIMEOUT,
            cookies: false,
            follow_location: 0,
            insecure: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            proxy: String::new(),
            rcpt_allow_fails: false,
            timeout: DEFAULT_TIMEOUT,
            verbose: false,
        }
    }
}

impl Options {
    /// Merge a CSKV string into these options.
    ///
    /// Either every entry applies or none does.
    pub fn set(&mut self, cskv: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        cskv::parse(cskv, |key, value| {
            match key {
                "accept_compression" => next.accept_compression = cskv::boolean(key, value)?,
                "connect_timeout" => {
                    next.connect_timeout = Duration::from_millis(cskv::number(key, value)?)
                }
                "cookies" => next.cookies = cskv::boolean(key, value)?,
                "follow_location" => {
                    next.follow_location = cskv::number(key, value)
                        .ok()
                        .filter(|mode| *mode <= 3)
                        .ok_or_else(|| ConfigError::invalid(key, value))?
                }
                "insecure" => next.insecure = cskv::boolean(key, value)?,
                "maxredirs" => next.max_redirects = cskv::number(key, value)?,
                "proxy" => next.proxy = value.to_string(),
                "rcpt_allow_fails" => next.rcpt_allow_fails = cskv::boolean(key, value)?,
                "timeout" => next.timeout = Duration::from_millis(cskv::number(key, value)?),
                "verbose" => next.verbose = cskv::boolean(key, value)?,
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
            Ok(())
        })?;
        *self = next;
        Ok(())
    }

    pub(crate) fn apply(&self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        setopt_str(
            easy,
            CURLOPT_ACCEPT_ENCODING,
            self.accept_compression.then_some(""),
        )?;
        easy.connect_timeout(self.connect_timeout)?;
        setopt_str(easy, CURLOPT_COOKIEFILE, self.cookies.then_some(""))?;
        setopt_long(easy, CURLOPT_FOLLOWLOCATION, self.follow_location.into())?;
        easy.ssl_verify_host(!self.insecure)?;
        easy.ssl_verify_peer(!self.insecure)?;
        easy.max_redirections(self.max_redirects)?;
        setopt_str_or_reset(easy, CURLOPT_PROXY, &self.proxy)?;
        easy.timeout(self.timeout)?;
        easy.verbose(self.verbose)?;
        Ok(())
    }

    /// SMTP-only switch, applied by the SMTP protocol.
    pub(crate) fn apply_smtp(&self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        let result = setopt_long(
            easy,
            CURLOPT_MAIL_RCPT_ALLOWFAILS,
            self.rcpt_allow_fails.into(),
        );
        // Libraries older than 7.69 lack the option; only a request to enable
        // it has to succeed.
        if self.rcpt_allow_fails { result } else { Ok(()) }
    }
}
