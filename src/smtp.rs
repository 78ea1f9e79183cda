//! SMTP over the engine
//!
//! ```no_run
//! use curlev::{Engine, Smtp};
//!
//! let engine = Engine::new();
//! engine.start()?;
//!
//! let smtp = Smtp::create(&engine)?;
//! smtp.send_text(
//!     "smtp://mail.example.org",
//!     "Mary Smith <mary@example.org>",
//!     ["jdoe@example.org"],
//!     "Saying hello",
//!     "This is a message just to say hello.",
//! )
//! .authentication("mode=basic,user=mary,secret=hunter2")
//! .exec();
//! assert!(smtp.code().is_success());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::code::{Code, Internal};
use crate::cskv::trim;
use crate::headers::KeyValues;
use crate::mime::{Mime, Part};
use crate::options::Options;
use crate::sink::Sink;
use crate::types::{CURLOPT_MAIL_FROM, CURLOPT_MAIL_RCPT, StringList, setopt_ptr, setopt_str};
use crate::wrapper::{Handle, Protocol};
use curl::easy::{Easy2, List};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// A handle speaking SMTP.
pub type Smtp = Handle<SmtpProtocol>;

/// A mailbox, with or without a display name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// `jdoe@example.org`
    pub address_spec: String,
    /// `John Doe`
    pub display_name: String,
}

impl Address {
    /// Parse `Mary Smith <mary@x.test>`, `"Mary Smith" <mary@x.test>`,
    /// `<mary@x.test>` or a bare `mary@x.test`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let strip = |value: &str| {
            value
                .trim_matches(|c: char| c.is_ascii_whitespace() || c == '"')
                .to_string()
        };
        match (text.find('<'), text.find('>')) {
            (Some(start), Some(end)) if end > start => Self {
                address_spec: strip(&text[start + 1..end]),
                display_name: strip(&text[..start]),
            },
            _ => Self {
                address_spec: trim(text).to_string(),
                display_name: String::new(),
            },
        }
    }

    /// `"Mary Smith" <mary@x.test>`, or `<mary@x.test>` without a name.
    #[must_use]
    pub fn name_addr(&self) -> String {
        if self.display_name.is_empty() {
            self.addr_spec()
        } else {
            format!("\"{}\" <{}>", self.display_name, self.address_spec)
        }
    }

    /// `<mary@x.test>`
    #[must_use]
    pub fn addr_spec(&self) -> String {
        format!("<{}>", self.address_spec)
    }
}

impl FromStr for Address {
    type Err = Infallible;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(text))
    }
}

impl From<&str> for Address {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

impl From<String> for Address {
    fn from(text: String) -> Self {
        Self::parse(&text)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name_addr())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Message {
    /// A complete RFC 5322 message
    Raw(Vec<u8>),
    /// A plain text body; headers are composed at send time
    Text { subject: String, text: String },
    /// A MIME body; libcurl writes it after the composed headers
    Mime { subject: String, parts: Vec<Part> },
}

impl Default for Message {
    fn default() -> Self {
        Self::Raw(Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct SmtpProtocol {
    url: String,
    from: Address,
    to: Vec<Address>,
    headers: KeyValues,
    message: Message,
    // libcurl reads both while the transfer runs.
    recipients: StringList,
    mime: Option<Mime>,
}

const COMPOSED_HEADERS: [&str; 5] = ["Date", "From", "To", "Subject", "Content-Type"];

impl SmtpProtocol {
    /// `Date`, `From`, `To` and `Subject`, an optional `Content-Type`, then
    /// the extra headers that do not collide with those.
    fn header_lines(&self, date: &str, subject: &str, content_type: Option<&str>) -> Vec<String> {
        let to = self
            .to
            .iter()
            .map(Address::name_addr)
            .collect::<Vec<_>>()
            .join(", ");

        let mut lines = vec![
            format!("Date: {date}"),
            format!("From: {}", self.from.name_addr()),
            format!("To: {to}"),
            format!("Subject: {subject}"),
        ];
        if let Some(content_type) = content_type {
            lines.push(format!("Content-Type: {content_type}"));
        }
        for (key, value) in &self.headers {
            if COMPOSED_HEADERS
                .iter()
                .any(|composed| composed.eq_ignore_ascii_case(key))
            {
                continue;
            }
            lines.push(format!("{key}: {value}"));
        }
        lines
    }

    fn compose(&self, date: &str, subject: &str, text: &str) -> Vec<u8> {
        let mut message = String::with_capacity(text.len() + 256);
        for line in self.header_lines(date, subject, Some("text/plain; charset=utf-8")) {
            message.push_str(&line);
            message.push_str("\r\n");
        }
        message.push_str("\r\n");

        for line in text.lines() {
            message.push_str(line);
            message.push_str("\r\n");
        }
        message.into_bytes()
    }

    fn set_envelope(&mut self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        easy.url(&self.url)?;
        setopt_str(easy, CURLOPT_MAIL_FROM, Some(&self.from.addr_spec()))?;
        let recipients = StringList::new(self.to.iter().map(Address::addr_spec))?;
        setopt_ptr(easy, CURLOPT_MAIL_RCPT, recipients.as_raw().cast())?;
        // libcurl points at the new list now, so the old one may go.
        self.recipients = recipients;
        Ok(())
    }

    /// Upload the message as is, or with composed headers for text.
    fn set_message(&mut self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        let date = chrono::Utc::now().to_rfc2822();
        let payload = match &self.message {
            Message::Raw(bytes) => bytes.clone(),
            Message::Text { subject, text } => self.compose(&date, subject, text),
            Message::Mime { .. } => Vec::new(),
        };
        Mime::detach(easy)?;
        self.mime = None;
        easy.http_headers(List::new())?;

        let size = payload.len() as u64;
        easy.get_mut().set_upload(payload);
        easy.upload(true)?;
        easy.in_filesize(size)
    }

    /// Headers go through `CURLOPT_HTTPHEADER`, the body through
    /// `CURLOPT_MIMEPOST`, which must be set last.
    fn set_mime(
        &self,
        easy: &mut Easy2<Sink>,
        subject: &str,
        parts: &[Part],
    ) -> Result<Mime, curl::Error> {
        let date = chrono::Utc::now().to_rfc2822();
        let mut headers = List::new();
        for line in self.header_lines(&date, subject, None) {
            headers.append(&line)?;
        }
        easy.get_mut().set_upload(Vec::new());
        easy.upload(false)?;
        easy.http_headers(headers)?;

        let mime = Mime::build(easy, parts)?;
        mime.attach(easy)?;
        Ok(mime)
    }
}

impl Protocol for SmtpProtocol {
    type Response = ();

    fn prepare_protocol(&mut self, easy: &mut Easy2<Sink>, options: &Options) -> Result<(), Code> {
        if self.to.is_empty() {
            warn!("no recipients");
            return Err(Internal::Prepare.into());
        }
        self.set_envelope(easy).map_err(|err| {
            warn!(%err, "failed to set envelope");
            Internal::Prepare
        })?;
        options.apply_smtp(easy).map_err(|err| {
            warn!(%err, "failed to apply SMTP options");
            Internal::Options
        })?;

        if let Message::Mime { subject, parts } = &self.message {
            let mime = self.set_mime(easy, subject, parts).map_err(|err| {
                warn!(%err, "failed to build MIME message");
                Internal::Mime
            })?;
            self.mime = Some(mime);
            return Ok(());
        }
        self.set_message(easy).map_err(|err| {
            warn!(%err, "failed to set message");
            Code::Internal(Internal::Prepare)
        })
    }

    fn finalize_protocol(&mut self, easy: &mut Easy2<Sink>) {
        let sink = easy.get_mut();
        sink.set_upload(Vec::new());
        sink.take_body();
    }

    fn clear_protocol(&mut self) {
        *self = Self::default();
    }

    fn take_response(&mut self) {}
}

impl Handle<SmtpProtocol> {
    fn envelope<A>(
        &self,
        url: &str,
        from: impl Into<Address>,
        to: impl IntoIterator<Item = A>,
        message: Message,
    ) -> &Self
    where
        A: Into<Address>,
    {
        let from = from.into();
        let to: Vec<Address> = to.into_iter().map(Into::into).collect();
        self.clear();
        self.do_if_idle(|inner| {
            inner.protocol.url = url.to_string();
            inner.protocol.from = from;
            inner.protocol.to = to;
            inner.protocol.message = message;
        });
        self
    }

    /// Send `message`, a complete RFC 5322 message, as is.
    pub fn send<A>(
        &self,
        url: &str,
        from: impl Into<Address>,
        to: impl IntoIterator<Item = A>,
        message: impl Into<Vec<u8>>,
    ) -> &Self
    where
        A: Into<Address>,
    {
        self.envelope(url, from, to, Message::Raw(message.into()))
    }

    /// Send a plain text message. `Date`, `From`, `To`, `Subject` and
    /// `Content-Type` are composed when the transfer starts.
    pub fn send_text<A>(
        &self,
        url: &str,
        from: impl Into<Address>,
        to: impl IntoIterator<Item = A>,
        subject: &str,
        text: &str,
    ) -> &Self
    where
        A: Into<Address>,
    {
        let message = Message::Text {
            subject: subject.to_string(),
            text: text.to_string(),
        };
        self.envelope(url, from, to, message)
    }

    /// Send a MIME message built from `parts`, such as text and HTML
    /// alternatives plus attachments. `Date`, `From`, `To` and `Subject`
    /// are composed when the transfer starts.
    pub fn send_mime<A>(
        &self,
        url: &str,
        from: impl Into<Address>,
        to: impl IntoIterator<Item = A>,
        subject: &str,
        parts: impl IntoIterator<Item = Part>,
    ) -> &Self
    where
        A: Into<Address>,
    {
        let message = Message::Mime {
            subject: subject.to_string(),
            parts: parts.into_iter().collect(),
        };
        self.envelope(url, from, to, message)
    }

    /// Extra headers for composed messages.
    pub fn add_headers<K, V>(&self, headers: impl IntoIterator<Item = (K, V)>) -> &Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.do_if_idle(|inner| {
            inner
                .protocol
                .headers
                .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        });
        self
    }
}
