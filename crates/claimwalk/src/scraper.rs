use std::sync::Arc;
use std::time::Instant;

use cpu_time::ProcessTime;

use crate::config::AgentConfig;
use crate::encoding::Normalizer;
use crate::error::ScrapeError;
use crate::fetch::{FetchRequest, FetchResult, Fetcher};
use crate::parser::{ContentKind, ParseError, parse_amounts, parse_listing};
use crate::target::ScrapeTarget;
use crate::types::{
    AmountRecord, ClaimRecord, PageFailure, ScrapeBudget, ScrapeReport, ScrapeRequest,
};

/// Results of one level of the walk plus everything below it.
#[derive(Debug, Default)]
struct Harvest {
    claims: Vec<ClaimRecord>,
    failures: Vec<PageFailure>,
    pages_fetched: u32,
    detail_fetches: u32,
}

impl Harvest {
    fn absorb(&mut self, deeper: Harvest) {
        self.claims.extend(deeper.claims);
        self.failures.extend(deeper.failures);
        self.pages_fetched += deeper.pages_fetched;
        self.detail_fetches += deeper.detail_fetches;
    }

    fn fail(&mut self, level: u32, url: impl Into<String>, error: ScrapeError) {
        let url = url.into();
        log::warn!("Level {} failed for {}: {}", level, url, error);
        self.failures.push(PageFailure { level, url, error });
    }
}

#[derive(Debug, Clone)]
pub struct WebScraper {
    fetcher: Fetcher,
    normalizer: Arc<Normalizer>,
    authorization: Option<String>,
}

impl WebScraper {
    pub fn new(config: &AgentConfig) -> Result<Self, ScrapeError> {
        Ok(Self {
            fetcher: Fetcher::new(config)?,
            normalizer: Arc::new(Normalizer::new(config.text_cap())),
            authorization: None,
        })
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    /// Sends `value` as the `Authorization` header, typically after a run
    /// came back with an authentication challenge.
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn config(&self) -> &AgentConfig {
        self.fetcher.config()
    }

    pub async fn scrape(&self, request: &ScrapeRequest) -> Result<ScrapeReport, ScrapeError> {
        let started = Instant::now();
        let cpu_started = ProcessTime::try_now()
            .inspect_err(|e| log::debug!("Process CPU time unavailable: {e}"))
            .ok();
        let config = self.config();
        let start = ScrapeTarget::resolve(&request.url, config)?;
        let budget = ScrapeBudget::new(request.depth, config.max_depth, config.max_links_per_page);

        log::info!(
            "Scraping {} (depth {}, capped at {})",
            start,
            request.depth,
            budget.max_level
        );

        let harvest = self.walk(&start, budget, 1).await;

        log::info!(
            "Collected {} claim(s) from {} page(s) in {:.2}s",
            harvest.claims.len(),
            harvest.pages_fetched,
            started.elapsed().as_secs_f64()
        );

        Ok(ScrapeReport {
            claim_count: harvest.claims.len(),
            claims: harvest.claims,
            failures: harvest.failures,
            pages_fetched: harvest.pages_fetched,
            detail_fetches: harvest.detail_fetches,
            elapsed: started.elapsed(),
            cpu_time: cpu_started.and_then(|cpu| cpu.try_elapsed().ok()),
        })
    }

    /// Walks one listing page and, budget permitting, the pages after it.
    /// `known_total` is the page count reported by the level above, used when
    /// this level fails before it can report its own.
    async fn walk(&self, start: &ScrapeTarget, budget: ScrapeBudget, known_total: u32) -> Harvest {
        let mut harvest = Harvest::default();
        let level = budget.current_level;

        if budget.is_exhausted() {
            log::info!(
                "Recursion budget exhausted at level {} (max {})",
                level,
                budget.max_level
            );
            return harvest;
        }

        let request = self.page_request(start, level);
        let url = request.target.to_string();
        log::info!("Fetching listing page {}: {}", level, url);

        let (total_pages, next_start) = match self.scrape_page(&request, budget, &mut harvest).await
        {
            Ok((total, base)) => (total, base),
            Err(error) => {
                harvest.fail(level, url, error);
                (known_total, start.clone())
            }
        };

        if budget.can_descend(total_pages) {
            let deeper = Box::pin(self.walk(&next_start, budget.descend(), total_pages)).await;
            harvest.absorb(deeper);
        } else {
            log::info!(
                "Stopping after level {} ({} page(s) reported)",
                level,
                total_pages
            );
        }

        harvest
    }

    /// Fetches and extracts one listing page, running detail sub-fetches in
    /// row order. Returns the page count it reports and the target that
    /// later pages should be derived from.
    async fn scrape_page(
        &self,
        request: &FetchRequest,
        budget: ScrapeBudget,
        harvest: &mut Harvest,
    ) -> Result<(u32, ScrapeTarget), ScrapeError> {
        let result = self.fetcher.fetch(request).await?;
        harvest.pages_fetched += 1;
        self.check_response(&result)?;

        let base = self.redirect_base(&result, &request.target);
        let text = self.normalizer.normalize(&result.body);
        if text.is_opaque() {
            return Err(ParseError::UnsupportedContent(text.encoding.to_string()).into());
        }
        let kind = ContentKind::classify(result.content_type.as_deref(), &text.text)?;
        let page = parse_listing(&text.text, kind)?;
        log::debug!(
            "Level {}: {} row(s), {} page(s) reported",
            budget.current_level,
            page.rows.len(),
            page.total_pages
        );

        let mut links = 0;
        for row in page.rows {
            let mut record = ClaimRecord::new(row.fields);

            if let Some(claim_id) = row.detail_id {
                if links < budget.max_links_per_page {
                    links += 1;
                    harvest.detail_fetches += 1;
                    match self.fetch_amounts(&base, &claim_id).await {
                        Ok(amounts) => record.amounts = amounts,
                        Err(error) => harvest.fail(
                            budget.current_level,
                            self.detail_target(&base, &claim_id).to_string(),
                            error,
                        ),
                    }
                } else {
                    log::debug!("Link budget spent, skipping details of claim {}", claim_id);
                }
            }

            if record.is_empty() {
                continue;
            }
            harvest.claims.push(record);
        }

        Ok((page.total_pages, base))
    }

    /// One detail fetch for `claim_id`. Never paginates.
    pub async fn fetch_amounts(
        &self,
        base: &ScrapeTarget,
        claim_id: &str,
    ) -> Result<Vec<AmountRecord>, ScrapeError> {
        let target = self.detail_target(base, claim_id);
        let request = self.request_for(target);
        log::debug!("Fetching details of claim {}", claim_id);

        let result = self.fetcher.fetch(&request).await?;
        self.check_response(&result)?;

        let text = self.normalizer.normalize(&result.body);
        if text.is_opaque() {
            return Err(ParseError::UnsupportedContent(text.encoding.to_string()).into());
        }
        let kind = ContentKind::classify(result.content_type.as_deref(), &text.text)?;
        Ok(parse_amounts(&text.text, kind)?)
    }

    /// The claim id always travels in the query string, whatever the method.
    fn detail_target(&self, base: &ScrapeTarget, claim_id: &str) -> ScrapeTarget {
        let endpoints = &self.config().endpoints;
        base.sibling(&endpoints.detail_file)
            .with_query_param(&endpoints.detail_param, claim_id)
    }

    fn request_for(&self, target: ScrapeTarget) -> FetchRequest {
        let request = FetchRequest::new(target).with_params(
            self.config()
                .default_post_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        match &self.authorization {
            Some(auth) => request.with_authorization(auth.as_str()),
            None => request,
        }
    }

    /// The first page is the starting URL as given. Later pages go to the
    /// listing endpoint with the original query carried over and the page
    /// number added.
    fn page_request(&self, start: &ScrapeTarget, level: u32) -> FetchRequest {
        if level == 1 {
            return self.request_for(start.clone());
        }

        let endpoints = &self.config().endpoints;
        let target = if endpoints.listing_file.is_empty() {
            start.without_query()
        } else {
            start.sibling(&endpoints.listing_file)
        };
        let carried: Vec<(String, String)> = start
            .query_params()
            .iter()
            .filter(|(k, _)| *k != endpoints.page_param)
            .cloned()
            .collect();

        self.request_for(target)
            .with_params(carried)
            .with_param(endpoints.page_param.as_str(), level.to_string())
    }

    /// Later pages and detail links follow the page to where it was
    /// redirected, as long as that stays on the allow-list.
    fn redirect_base(&self, result: &FetchResult, requested: &ScrapeTarget) -> ScrapeTarget {
        result
            .redirected_to
            .as_deref()
            .and_then(|location| ScrapeTarget::resolve(location, self.config()).ok())
            .unwrap_or_else(|| requested.clone())
    }

    fn check_response(&self, result: &FetchResult) -> Result<(), ScrapeError> {
        result.check_status().inspect_err(|e| {
            if let ScrapeError::HttpError { .. } = e {
                let text = self.normalizer.normalize(&result.body);
                let snippet = text
                    .text
                    .split_whitespace()
                    .take(40)
                    .collect::<Vec<_>>()
                    .join(" ");
                log::debug!("Error page from {}: {}", result.final_url(), snippet);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Method;
    use std::fs;
    use wiremock::matchers::{
        body_string_contains, header, method, path, query_param, query_param_is_missing,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, method: Method) -> AgentConfig {
        AgentConfig {
            default_method: method,
            ..AgentConfig::with_allowed_prefixes([format!("{}/claims/", server.uri())])
        }
    }

    fn html(body: String) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/html; charset=utf-8")
    }

    fn fixture(name: &str) -> ResponseTemplate {
        html(fs::read_to_string(format!("fixtures/{name}")).expect("Failed to read fixture"))
    }

    fn listing(total: u32, creditors: &[&str]) -> String {
        let rows: String = creditors
            .iter()
            .map(|c| {
                format!(
                    "<tr><td><span class=\"label\">Creditor</span>\
                     <span class=\"content\">{c}</span></td></tr>"
                )
            })
            .collect();
        format!(
            "<html><body><div data-total-pages=\"{total}\"></div>\
             <table class=\"results\">{rows}</table></body></html>"
        )
    }

    fn list_url(server: &MockServer) -> String {
        format!("{}/claims/list.php", server.uri())
    }

    #[tokio::test]
    async fn test_two_pages_then_stop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/claims/list.php"))
            .and(query_param("page", "2"))
            .respond_with(fixture("listing_page_2.html"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/claims/list.php"))
            .and(query_param_is_missing("page"))
            .respond_with(fixture("listing_page_1.html"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/claims/creditor_details.php"))
            .and(query_param("id", "1001"))
            .respond_with(fixture("creditor_details.html"))
            .expect(1)
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 5))
            .await
            .unwrap();

        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.detail_fetches, 1);
        assert_eq!(report.claim_count, 3);
        assert!(report.failures.is_empty());

        let creditors: Vec<_> = report
            .claims
            .iter()
            .map(|c| c.get("Creditor").unwrap())
            .collect();
        assert_eq!(
            creditors,
            vec!["Nordbank AG", "Müller & Söhne GmbH", "Stadtwerke Nord"]
        );
        assert_eq!(report.claims[0].amounts.len(), 2);
        assert!(report.claims[1].amounts.is_empty());
        assert!(report.cpu_time.is_some());
    }

    #[tokio::test]
    async fn test_zero_depth_fetches_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(html(listing(2, &["A"])))
            .expect(0)
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 0))
            .await
            .unwrap();

        assert!(report.claims.is_empty());
        assert_eq!(report.pages_fetched, 0);
    }

    #[tokio::test]
    async fn test_depth_is_capped_by_configured_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(html(listing(10, &["A"])))
            .expect(2)
            .mount(&server)
            .await;

        let mut config = config_for(&server, Method::Get);
        config.max_depth = 2;
        let scraper = WebScraper::new(&config).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 5))
            .await
            .unwrap();

        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.claim_count, 2);
    }

    #[tokio::test]
    async fn test_requested_depth_bounds_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(html(listing(10, &["A"])))
            .expect(3)
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 3))
            .await
            .unwrap();

        assert_eq!(report.pages_fetched, 3);
    }

    #[tokio::test]
    async fn test_post_pagination_and_detail_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/claims/list.php"))
            .and(body_string_contains("page=2"))
            .respond_with(fixture("listing_page_2.html"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/claims/list.php"))
            .and(body_string_contains("lang=de"))
            .respond_with(fixture("listing_page_1.html"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/claims/creditor_details.php"))
            .and(query_param("id", "1001"))
            .and(body_string_contains("lang=de"))
            .respond_with(fixture("creditor_details.html"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config_for(&server, Method::Post);
        config
            .default_post_params
            .insert("lang".to_string(), "de".to_string());
        let scraper = WebScraper::new(&config).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 2))
            .await
            .unwrap();

        assert_eq!(report.claim_count, 3);
        assert_eq!(report.claims[0].amounts.len(), 2);

        let requests = server.received_requests().await.unwrap();
        let detail = requests
            .iter()
            .find(|r| r.url.path() == "/claims/creditor_details.php")
            .unwrap();
        assert_eq!(detail.url.query(), Some("id=1001"));
        assert!(!String::from_utf8_lossy(&detail.body).contains("id="));
    }

    #[tokio::test]
    async fn test_detail_pages_never_paginate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/claims/list.php"))
            .respond_with(fixture("listing_page_1.html"))
            .expect(1)
            .mount(&server)
            .await;
        let detail = "<html><body><div data-total-pages=\"9\"></div><table class=\"results\">\
            <tr><td><span class=\"label\">Amount</span><span class=\"content\">1,00</span></td></tr>\
            </table></body></html>";
        Mock::given(method("GET"))
            .and(path("/claims/creditor_details.php"))
            .respond_with(html(detail.to_string()))
            .expect(1)
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 1))
            .await
            .unwrap();

        assert_eq!(report.pages_fetched, 1);
        assert_eq!(report.detail_fetches, 1);
        assert_eq!(report.claims[0].amounts.len(), 1);
    }

    #[tokio::test]
    async fn test_link_budget_limits_detail_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/claims/list.php"))
            .respond_with(fixture("listing_page_1.html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/claims/creditor_details.php"))
            .respond_with(fixture("creditor_details.html"))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = config_for(&server, Method::Get);
        config.max_links_per_page = 0;
        let scraper = WebScraper::new(&config).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 1))
            .await
            .unwrap();

        assert_eq!(report.detail_fetches, 0);
        assert_eq!(report.claims[0].get("claim_id"), Some("1001"));
        assert!(report.claims[0].amounts.is_empty());
    }

    #[tokio::test]
    async fn test_authentication_challenge_then_resubmit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(html(listing(1, &["Secret Creditor"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", "Basic realm=\"Insolvency register\"")
                    .set_body_raw(listing(1, &["Leaked"]).into_bytes(), "text/html"),
            )
            .mount(&server)
            .await;

        let config = config_for(&server, Method::Get);
        let scraper = WebScraper::new(&config).unwrap();
        let request = ScrapeRequest::new(list_url(&server), 3);
        let report = scraper.scrape(&request).await.unwrap();

        assert!(report.claims.is_empty(), "no extraction on a 401 page");
        assert_eq!(report.pages_fetched, 1);
        assert_eq!(
            report.authentication_challenge(),
            Some("Basic realm=\"Insolvency register\"")
        );
        assert!(matches!(
            report.failures[0].error,
            ScrapeError::AuthenticationRequired { .. }
        ));

        let retry = WebScraper::new(&config)
            .unwrap()
            .with_authorization("Basic dXNlcjpwYXNz");
        let report = retry.scrape(&request).await.unwrap();
        assert_eq!(report.claims[0].get("Creditor"), Some("Secret Creditor"));
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failed_page_keeps_earlier_results_and_continues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "3"))
            .respond_with(html(listing(3, &["Third"])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param_is_missing("page"))
            .respond_with(html(listing(3, &["First"])))
            .expect(1)
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 5))
            .await
            .unwrap();

        assert_eq!(report.pages_fetched, 3);
        let creditors: Vec<_> = report
            .claims
            .iter()
            .map(|c| c.get("Creditor").unwrap())
            .collect();
        assert_eq!(creditors, vec!["First", "Third"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].level, 2);
        assert!(matches!(
            report.failures[0].error,
            ScrapeError::HttpError { code: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_unparsable_content_is_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"%PDF-1.7\n\x00\x01".to_vec(), "application/pdf"),
            )
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 1))
            .await
            .unwrap();

        assert!(report.claims.is_empty());
        assert!(matches!(
            report.failures[0].error,
            ScrapeError::Extraction(ParseError::UnsupportedContent(_))
        ));
    }

    #[tokio::test]
    async fn test_json_listing() {
        let server = MockServer::start().await;
        let body = fs::read_to_string("fixtures/listing.json").expect("Failed to read fixture");
        Mock::given(method("GET"))
            .and(path("/claims/list.php"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "application/json"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/claims/creditor_details.php"))
            .and(query_param("id", "2001"))
            .respond_with(fixture("creditor_details.html"))
            .expect(1)
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 1))
            .await
            .unwrap();

        assert_eq!(report.claim_count, 2);
        assert_eq!(report.claims[0].get("court"), Some("Amtsgericht Köln"));
        assert_eq!(report.claims[1].get("court"), Some("Amtsgericht Köln"));
        assert_eq!(report.claims[0].amounts.len(), 2);
    }

    #[tokio::test]
    async fn test_redirect_moves_detail_base() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/claims/list.php"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/claims/v2/list.php", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/claims/v2/list.php"))
            .respond_with(fixture("listing_page_1.html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/claims/v2/creditor_details.php"))
            .respond_with(fixture("creditor_details.html"))
            .expect(1)
            .mount(&server)
            .await;

        let scraper = WebScraper::new(&config_for(&server, Method::Get)).unwrap();
        let report = scraper
            .scrape(&ScrapeRequest::new(list_url(&server), 1))
            .await
            .unwrap();

        assert_eq!(report.claims[0].amounts.len(), 2);
    }

    #[tokio::test]
    async fn test_unlisted_start_url_is_fatal() {
        let config = AgentConfig::with_allowed_prefixes(["https://register.example.org/claims/"]);
        let scraper = WebScraper::new(&config).unwrap();

        let err = scraper
            .scrape(&ScrapeRequest::new("https://elsewhere.example/list.php", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::UnauthorizedUrl(_)));
    }
}
