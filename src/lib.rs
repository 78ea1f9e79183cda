//! # curlev
//!
//! Non-blocking HTTP and SMTP transfers from synchronous-looking call sites.
//!
//! One [`Engine`] runs a single event loop thread that multiplexes every
//! socket of every transfer through libcurl's multi interface, with a
//! shared DNS, TLS session and connection cache. Handles ([`Http`],
//! [`Smtp`]) are configured with plain setters, then started, joined,
//! aborted or awaited. Outcomes are [`Code`] values, never panics.
//!
//! ## Quick Start
//!
//! ```no_run
//! use curlev::{Engine, Http};
//! use std::time::Duration;
//!
//! let engine = Engine::new();
//! engine.start()?;
//!
//! let http = Http::create(&engine)?;
//! http.get("https://httpbin.org/get")
//!     .add_query_parameters([("q", "rust curl")])
//!     .options("timeout=5000")
//!     .set_retries(3, Duration::from_millis(200))
//!     .exec();
//! println!("{} {}", http.code(), http.text());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Callbacks
//!
//! ```no_run
//! # let engine = curlev::Engine::new();
//! # engine.start()?;
//! let http = curlev::Http::create(&engine)?;
//! http.get("https://httpbin.org/uuid").start_with(|http| {
//!     println!("done: {}", http.code());
//! });
//! http.join();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Async (runtime-agnostic)
//!
//! ```no_run
//! # async fn demo(engine: &curlev::Engine) -> Result<(), curlev::Error> {
//! let http = curlev::Http::create(engine)?;
//! if let Some(outcome) = http.get("https://httpbin.org/get").launch().await {
//!     println!("{} {}", outcome.code, outcome.response.text());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration strings
//!
//! Options, credentials and certificates are set from comma-separated
//! `key=value` strings, on the engine for every new handle or on one handle:
//! `"timeout=5000,follow_location=1"`, `"mode=basic,user=joe,secret=x"`,
//! `"cainfo=/etc/ssl/ca.pem,proxy_cainfo="`. Unknown keys are rejected.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `json`  | No | JSON request bodies and response decoding via `serde_json`. |

mod authentication;
mod callback;
mod certificates;
mod code;
pub mod cskv;
mod engine;
mod error;
mod handle;
mod headers;
mod http;
mod launch;
pub mod mime;
mod options;
mod reactor;
mod share;
mod sink;
mod smtp;
mod sync;
mod types;
pub mod url;
mod wrapper;

pub use authentication::{AuthMode, Authentication};
pub use certificates::{Certificates, TlsFiles};
pub use code::{Code, Internal};
pub use engine::{Engine, EngineConfig};
pub use error::{ConfigError, Error, Result};
pub use headers::{Headers, KeyValues};
pub use http::{Http, HttpProtocol, Method, Response as HttpResponse};
pub use launch::{Outcome, ResponseFuture};
pub use options::{DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT, Options};
pub use sink::{DEFAULT_MAX_RESPONSE_SIZE, Sink};
pub use smtp::{Address, Smtp, SmtpProtocol};
pub use sync::SharedMutex;
pub use wrapper::{Handle, Protocol};
