//! Re-broadcasts a remote media stream as one continuous MPEG-TS byte stream.
//!
//! A run goes through a fixed set of decisions before any media is produced:
//! keys, proxy route, stream format, variant selection and variant kind.
//! [`Relay::prepare`] makes them all, [`Relay::run`] executes the result.
//!
//! Network access goes through the [`HttpTransport`] trait. [`HttpSession`]
//! is the reqwest implementation and [`testing::RecordingTransport`] a
//! scripted one.

pub mod bypass;
pub mod config;
pub mod cookies;
pub mod detect;
pub mod error;
pub mod glob;
pub mod http;
pub mod keys;
pub mod manifest;
pub mod mux;
pub mod pipeline;
pub mod proxy;
pub mod pump;
pub mod selector;
pub mod synthetic;
pub mod testing;

pub use bypass::{BypassList, BypassResolver, ProxyDecision};
pub use config::RelayConfig;
pub use cookies::CookieJar;
pub use detect::{StreamDescriptor, VariantDetector, VariantKind};
pub use error::{Error, ErrorKind, Result};
pub use http::{HttpSession, HttpSettings, HttpTransport, RequestContext, Route, install_rustls_provider};
pub use keys::{ClearKeySource, ClearKeyTable, KeySet};
pub use manifest::{Manifest, PeriodSelector};
pub use pipeline::{PreparedRelay, Relay, RelaySource, StreamFormat};
pub use proxy::{ProxyConfig, ProxyType};
pub use pump::{PumpOutcome, PumpReport};
pub use selector::{BEST, WORST};
pub use synthetic::{SyntheticKind, VariantOverrides};
