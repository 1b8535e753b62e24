use crate::config::ConfigError;
use crate::parser::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("URL is not on the allow-list: {0}")]
    UnauthorizedUrl(String),
    #[error("Request timed out: {url}")]
    RequestTimeout { url: String },
    #[error("Network error for {url}: {source}")]
    NetworkError {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Authentication required for {url} (challenge: {challenge})")]
    AuthenticationRequired { challenge: String, url: String },
    #[error("HTTP {code}: {message}")]
    HttpError { code: u16, message: String },
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ParseError),
    #[error("Failed to read upload file {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ScrapeError {
    pub(crate) fn from_transport(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScrapeError::RequestTimeout {
                url: url.to_string(),
            }
        } else {
            ScrapeError::NetworkError {
                url: url.to_string(),
                source: err,
            }
        }
    }
}
