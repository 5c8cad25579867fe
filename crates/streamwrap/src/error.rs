use reqwest::StatusCode;

/// Coarse classification of engine failures.
///
/// Every variant aborts the run before any media byte is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ManifestParse,
    PeriodNotFound,
    DrmKeyRequired,
    InvalidKeyFormat,
    Configuration,
    Setup,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManifestParse => "manifest-parse",
            Self::PeriodNotFound => "period-not-found",
            Self::DrmKeyRequired => "drm-key-required",
            Self::InvalidKeyFormat => "invalid-key-format",
            Self::Configuration => "configuration",
            Self::Setup => "setup",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse manifest: {reason}")]
    ManifestParse { reason: String },

    #[error("period {requested} not found, available periods: {available}")]
    PeriodNotFound { requested: String, available: String },

    #[error("{manifest} is protected by DRM but no decryption key was given")]
    DrmKeyRequired { manifest: String },

    #[error("invalid decryption key `{entry}`: {reason}")]
    InvalidKeyFormat { entry: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("stream setup failed: {reason}")]
    Setup { reason: String },

    #[error("variant `{requested}` not found, available variants: {available}")]
    VariantNotFound { requested: String, available: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("process error: {reason}")]
    Process { reason: String },
}

impl Error {
    pub fn manifest_parse(reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            reason: reason.into(),
        }
    }

    pub fn invalid_key(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKeyFormat {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn setup(reason: impl Into<String>) -> Self {
        Self::Setup {
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn process(reason: impl Into<String>) -> Self {
        Self::Process {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestParse { .. } => ErrorKind::ManifestParse,
            Self::PeriodNotFound { .. } => ErrorKind::PeriodNotFound,
            Self::DrmKeyRequired { .. } => ErrorKind::DrmKeyRequired,
            Self::InvalidKeyFormat { .. } => ErrorKind::InvalidKeyFormat,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Setup { .. }
            | Self::VariantNotFound { .. }
            | Self::InvalidUrl { .. }
            | Self::HttpStatus { .. }
            | Self::Network { .. }
            | Self::Io { .. }
            | Self::Process { .. } => ErrorKind::Setup,
        }
    }

    /// Whether the run ends in failure. A consumer hanging up mid-write is
    /// a normal end of the relay.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io { source } => !matches!(
                source.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ),
            _ => true,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_classify_as_setup() {
        let err = Error::http_status(StatusCode::NOT_FOUND, "http://a/x.mpd", "manifest fetch");
        assert_eq!(err.kind(), ErrorKind::Setup);
        assert!(err.to_string().contains("404"));

        let err: Error = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Setup);
        assert!(err.is_fatal());
    }

    #[test]
    fn consumer_hangup_is_not_fatal() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(!err.is_fatal());
        assert!(Error::configuration("x").is_fatal());
    }

    #[test]
    fn key_errors_name_the_entry() {
        let err = Error::invalid_key("kid:zz", "not hex");
        assert_eq!(err.kind(), ErrorKind::InvalidKeyFormat);
        assert!(err.to_string().contains("kid:zz"));
    }
}
