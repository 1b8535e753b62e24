use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, PRAGMA, WWW_AUTHENTICATE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, redirect};

use crate::config::{AgentConfig, Method};
use crate::error::ScrapeError;
use crate::target::ScrapeTarget;

/// Parameters whose key starts with this prefix steer the scraper itself and
/// are never sent to the remote site.
pub const CONTROL_PARAM_PREFIX: &str = "__";

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub target: ScrapeTarget,
    /// `None` falls back to the configured default method.
    pub method: Option<Method>,
    pub body_params: Vec<(String, String)>,
    pub upload_file: Option<PathBuf>,
    pub authorization: Option<String>,
}

impl FetchRequest {
    pub fn new(target: ScrapeTarget) -> Self {
        Self {
            target,
            method: None,
            body_params: Vec::new(),
            upload_file: None,
            authorization: None,
        }
    }

    pub fn get(target: ScrapeTarget) -> Self {
        Self::new(target).with_method(Method::Get)
    }

    pub fn post(target: ScrapeTarget) -> Self {
        Self::new(target).with_method(Method::Post)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.body_params.push((key.into(), value.into()));
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.body_params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_upload(mut self, path: impl Into<PathBuf>) -> Self {
        self.upload_file = Some(path.into());
        self
    }

    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    fn wire_params(&self) -> Vec<(&str, &str)> {
        self.body_params
            .iter()
            .filter(|(k, _)| !k.starts_with(CONTROL_PARAM_PREFIX))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    /// Final location when redirects were followed.
    pub redirected_to: Option<String>,
    pub body_truncated: bool,
    /// Bytes announced or received, whichever is larger.
    pub byte_length: usize,
}

impl FetchResult {
    pub fn final_url(&self) -> &str {
        self.redirected_to.as_deref().unwrap_or(&self.url)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Classifies the status. The body stays available either way, so error
    /// pages can still be inspected.
    pub fn check_status(&self) -> Result<(), ScrapeError> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ScrapeError::AuthenticationRequired {
                challenge: self
                    .header(WWW_AUTHENTICATE.as_str())
                    .unwrap_or_default()
                    .to_string(),
                url: self.final_url().to_string(),
            });
        }
        Err(ScrapeError::HttpError {
            code: self.status,
            message: status
                .canonical_reason()
                .unwrap_or("Unknown status")
                .to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    config: AgentConfig,
}

impl Fetcher {
    pub fn new(config: &AgentConfig) -> Result<Self, ScrapeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .redirect(allow_listed_redirects(config.allowed_prefixes.clone()))
            .build()
            .map_err(ScrapeError::Client)?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Performs one logical request. Redirects are followed, nothing is
    /// retried, and the body is cut at `max_response_bytes`.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, ScrapeError> {
        request.target.authorize(&self.config)?;

        let url = request.target.to_string();
        let method = request.method.unwrap_or(self.config.default_method);
        let params = request.wire_params();

        let mut builder = match method {
            Method::Get => {
                let builder = self.client.get(&url);
                if request.target.query().is_none() && !params.is_empty() {
                    builder.query(&params)
                } else {
                    builder
                }
            }
            Method::Post => {
                let builder = self.client.post(&url);
                match &request.upload_file {
                    Some(path) => builder.multipart(upload_form(path, &params).await?),
                    None => builder.form(&params),
                }
            }
        };

        for (name, value) in &self.config.custom_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = request
            .authorization
            .as_ref()
            .or(self.config.authorization.as_ref())
        {
            builder = builder.header(AUTHORIZATION, auth.as_str());
        }
        builder = builder
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache");

        let http_request = builder
            .build()
            .map_err(|e| ScrapeError::from_transport(&url, e))?;
        let requested = http_request.url().clone();
        log::debug!("{} {}", method, requested);

        let mut response = self
            .client
            .execute(http_request)
            .await
            .inspect_err(|e| log::error!("HTTP error: {e:?}"))
            .map_err(|e| ScrapeError::from_transport(&url, e))?;

        let status = response.status().as_u16();
        let redirected_to = (response.url() != &requested).then(|| response.url().to_string());
        if let Some(location) = &redirected_to {
            log::debug!("Redirected to {}", location);
        }
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let announced = response.content_length().unwrap_or(0) as usize;

        let max = self.config.max_response_bytes;
        let mut body = Vec::new();
        let mut received = 0;
        let mut body_truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .inspect_err(|e| log::error!("Body read error: {e:?}"))
            .map_err(|e| ScrapeError::from_transport(&url, e))?
        {
            received += chunk.len();
            let room = max.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                body_truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }
        if body_truncated {
            log::warn!("Response from {} truncated at {} bytes", url, max);
        }

        Ok(FetchResult {
            url,
            status,
            content_type,
            body,
            headers,
            redirected_to,
            body_truncated,
            byte_length: received.max(announced),
        })
    }
}

/// Follows redirects only while they stay on the allow-list. A redirect
/// elsewhere is not followed and comes back as the 3xx response itself.
fn allow_listed_redirects(allowed_prefixes: Vec<String>) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let allowed = ScrapeTarget::parse(attempt.url().as_str())
            .is_ok_and(|target| target.is_allowed(&allowed_prefixes));
        if allowed {
            attempt.follow()
        } else {
            log::warn!("Not following redirect outside the allow-list: {}", attempt.url());
            attempt.stop()
        }
    })
}

async fn upload_form(path: &Path, params: &[(&str, &str)]) -> Result<Form, ScrapeError> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|source| ScrapeError::Upload {
            path: path.display().to_string(),
            source,
        })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let form = params.iter().fold(Form::new(), |form, (k, v)| {
        form.text(k.to_string(), v.to_string())
    });
    Ok(form.part("file", Part::bytes(contents).file_name(file_name)))
}
