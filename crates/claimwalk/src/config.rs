use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use json_comments::StripComments;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid method '{0}'. Accepted values: 'GET', 'POST'")]
pub struct MethodParseError(String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    #[default]
    Post,
}

impl FromStr for Method {
    type Err = MethodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            _ => Err(MethodParseError(s.to_string())),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// File names and parameter keys of the listing and detail endpoints,
/// relative to the directory of the starting URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Listing file used for pages after the first. Empty means "reuse the
    /// starting URL's file".
    pub listing_file: String,
    pub detail_file: String,
    pub detail_param: String,
    pub page_param: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            listing_file: String::new(),
            detail_file: "creditor_details.php".to_string(),
            detail_param: "id".to_string(),
            page_param: "page".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub allowed_prefixes: Vec<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Cap applied by the normalizer to decoded text. Falls back to
    /// `max_response_bytes` when absent.
    #[serde(default)]
    pub max_text_bytes: Option<usize>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,

    #[serde(default)]
    pub default_method: Method,

    #[serde(default)]
    pub default_post_params: BTreeMap<String, String>,

    /// Hard ceiling on pagination depth, whatever the caller asks for.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_max_links_per_page")]
    pub max_links_per_page: usize,

    /// Verbatim `Authorization` header value, e.g. `Basic dXNlcjpwYXNz`.
    #[serde(default)]
    pub authorization: Option<String>,

    #[serde(default)]
    pub endpoints: Endpoints,
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_max_response_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_depth() -> u32 {
    50
}

fn default_max_links_per_page() -> usize {
    100
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            allowed_prefixes: Vec::new(),
            user_agent: default_user_agent(),
            max_response_bytes: default_max_response_bytes(),
            max_text_bytes: None,
            request_timeout_secs: default_request_timeout_secs(),
            custom_headers: BTreeMap::new(),
            default_method: Method::default(),
            default_post_params: BTreeMap::new(),
            max_depth: default_max_depth(),
            max_links_per_page: default_max_links_per_page(),
            authorization: None,
            endpoints: Endpoints::default(),
        }
    }
}

impl AgentConfig {
    pub fn with_allowed_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_prefixes: prefixes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Loads a JSON document that may carry `//` and `/* */` comments.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_reader(StripComments::new(reader))?;
        config.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.allowed_prefixes.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "allowed_prefixes must contain at least one URL prefix".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_response_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn text_cap(&self) -> usize {
        self.max_text_bytes.unwrap_or(self.max_response_bytes)
    }
}
