use std::fmt::Display;

use serde::Serialize;

use crate::config::AgentConfig;
use crate::error::ScrapeError;

/// A URL broken into the pieces the scraper reasons about.
///
/// `domain` is the host plus every directory up to and including the last
/// `/`, so `protocol + domain` is the base that the allow-list is matched
/// against. `file` and `extension` together form the last path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeTarget {
    protocol: String,
    domain: String,
    path: String,
    file: String,
    extension: String,
    query: Option<String>,
    query_params: Vec<(String, String)>,
}

impl ScrapeTarget {
    pub fn parse(raw: &str) -> Result<Self, ScrapeError> {
        let raw = raw.trim();
        let unauthorized = || ScrapeError::UnauthorizedUrl(raw.to_string());

        let scheme_end = raw.find("://").ok_or_else(unauthorized)?;
        let (protocol, rest) = raw.split_at(scheme_end + 3);
        if scheme_end == 0 || rest.is_empty() {
            return Err(unauthorized());
        }

        let rest = rest.split('#').next().unwrap_or(rest);
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (domain, file) = match location.rfind('/') {
            Some(idx) => (location[..=idx].to_string(), &location[idx + 1..]),
            None => (format!("{location}/"), ""),
        };
        if domain.starts_with('/') {
            return Err(unauthorized());
        }

        // An embedded URL in the path leaves no usable file name.
        let file = if domain.contains("://") || file.contains("://") {
            ""
        } else {
            file
        };
        let (file, extension) = split_extension(file);

        let query = query.filter(|q| !q.is_empty()).map(str::to_string);
        let query_params = query
            .as_deref()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Ok(Self {
            protocol: protocol.to_string(),
            path: normalized_path(&domain),
            domain,
            file,
            extension,
            query,
            query_params,
        })
    }

    /// Parses `raw` and checks it against the configured allow-list.
    pub fn resolve(raw: &str, config: &AgentConfig) -> Result<Self, ScrapeError> {
        let target = Self::parse(raw)?;
        target.authorize(config)?;
        Ok(target)
    }

    pub fn authorize(&self, config: &AgentConfig) -> Result<(), ScrapeError> {
        if self.is_allowed(&config.allowed_prefixes) {
            Ok(())
        } else {
            log::warn!("Rejected URL outside the allow-list: {}", self);
            Err(ScrapeError::UnauthorizedUrl(self.to_string()))
        }
    }

    pub fn is_allowed(&self, prefixes: &[String]) -> bool {
        let base = self.base();
        prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .any(|p| base == *p || base.starts_with(p.as_str()))
    }

    /// A target naming `file` in the same directory, without a query.
    pub fn sibling(&self, file: &str) -> Self {
        let (file, extension) = split_extension(file.trim_start_matches('/'));
        Self {
            protocol: self.protocol.clone(),
            domain: self.domain.clone(),
            path: self.path.clone(),
            file,
            extension,
            query: None,
            query_params: Vec::new(),
        }
    }

    /// The same resource with `key=value` appended to its query string.
    pub fn with_query_param(&self, key: &str, value: &str) -> Self {
        let mut query_params = self.query_params.clone();
        query_params.push((key.to_string(), value.to_string()));
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&query_params)
            .finish();
        Self {
            query: Some(query),
            query_params,
            ..self.clone()
        }
    }

    /// The same resource with its query string dropped.
    pub fn without_query(&self) -> Self {
        Self {
            query: None,
            query_params: Vec::new(),
            ..self.clone()
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn host(&self) -> &str {
        self.domain.split('/').next().unwrap_or(&self.domain)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    pub fn base(&self) -> String {
        format!("{}{}", self.protocol, self.domain)
    }

    pub fn canonical_url(&self) -> String {
        format!(
            "{}{}{}{}",
            self.protocol, self.domain, self.file, self.extension
        )
    }

    pub fn directories(&self) -> Vec<&str> {
        self.path.split('/').filter(|d| !d.is_empty()).collect()
    }
}

impl Display for ScrapeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_url())?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

fn split_extension(file: &str) -> (String, String) {
    match file.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < file.len() => {
            (file[..idx].to_string(), file[idx..].to_string())
        }
        _ => (file.to_string(), String::new()),
    }
}

fn normalized_path(domain: &str) -> String {
    let mut remaining = domain.trim_end_matches('/');
    let mut directories = Vec::new();
    while let Some(idx) = remaining.rfind('/') {
        let segment = &remaining[idx + 1..];
        if !segment.is_empty() {
            directories.push(segment);
        }
        remaining = &remaining[..idx];
    }
    directories.reverse();

    if directories.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", directories.join("/"))
    }
}
