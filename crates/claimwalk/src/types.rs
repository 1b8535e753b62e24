use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::ScrapeError;

pub const AMOUNTS_KEY: &str = "amounts";

/// Insertion-ordered string map. Field names come from whatever labels the
/// source page exposes, so there is no fixed schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap(Vec<(String, String)>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a field. A repeated label fills an empty earlier value, or is
    /// stored under `label_2`, `label_3`, ... so no cell is lost.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        match self.0.iter().position(|(k, _)| *k == key) {
            Some(idx) if self.0[idx].1.is_empty() => self.0[idx].1 = value,
            Some(_) => {
                let mut n = 2;
                while self.contains_key(&format!("{key}_{n}")) {
                    n += 1;
                }
                self.0.push((format!("{key}_{n}"), value));
            }
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when at least one field carries a non-blank value.
    pub fn has_content(&self) -> bool {
        self.0.iter().any(|(_, v)| !v.trim().is_empty())
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl Display for FieldMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in self.iter().filter(|(_, v)| !v.is_empty()) {
            if !first {
                write!(f, " · ")?;
            }
            write!(f, "{}: {}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AmountRecord(pub FieldMap);

impl AmountRecord {
    pub fn fields(&self) -> &FieldMap {
        &self.0
    }
}

impl From<FieldMap> for AmountRecord {
    fn from(fields: FieldMap) -> Self {
        Self(fields)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimRecord {
    #[serde(flatten)]
    fields: FieldMap,
    pub amounts: Vec<AmountRecord>,
}

impl ClaimRecord {
    pub fn new(fields: FieldMap) -> Self {
        let mut record = Self::default();
        for (k, v) in fields.0 {
            record.insert(k, v);
        }
        record
    }

    /// A label literally named `amounts` never shadows the amounts list.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if key == AMOUNTS_KEY {
            self.fields.insert(format!("{key}_2"), value);
        } else {
            self.fields.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        !self.fields.has_content() && self.amounts.is_empty()
    }
}

impl Display for ClaimRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "▸ {}", self.fields)?;
        for amount in &self.amounts {
            writeln!(f, "    {}", amount.0)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid output format '{0}'. Accepted values: 'text', 'json'")]
pub struct OutputFormatParseError(String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = OutputFormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(OutputFormatParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub url: String,
    pub depth: u32,
    pub output_format: OutputFormat,
}

impl ScrapeRequest {
    pub fn new(url: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            depth,
            output_format: OutputFormat::default(),
        }
    }

    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }
}

/// Recursion bounds, copied into every level of the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeBudget {
    pub current_level: u32,
    pub max_level: u32,
    pub max_links_per_page: usize,
}

impl ScrapeBudget {
    pub fn new(requested_depth: u32, ceiling: u32, max_links_per_page: usize) -> Self {
        Self {
            current_level: 1,
            max_level: requested_depth.min(ceiling),
            max_links_per_page,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_level > self.max_level
    }

    pub fn can_descend(&self, total_pages: u32) -> bool {
        self.current_level < total_pages && self.current_level < self.max_level
    }

    pub fn descend(self) -> Self {
        Self {
            current_level: self.current_level + 1,
            ..self
        }
    }
}

/// A page-level failure kept alongside the records that did come back.
#[derive(Debug, Serialize)]
pub struct PageFailure {
    pub level: u32,
    pub url: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: ScrapeError,
}

impl Display for PageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[level {}] {}: {}", self.level, self.url, self.error)
    }
}

#[derive(Debug, Serialize)]
pub struct ScrapeReport {
    pub claims: Vec<ClaimRecord>,
    pub failures: Vec<PageFailure>,
    pub claim_count: usize,
    pub pages_fetched: u32,
    pub detail_fetches: u32,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Process CPU time spent during the scrape, when the platform reports it.
    #[serde(serialize_with = "serialize_opt_secs")]
    pub cpu_time: Option<Duration>,
}

impl ScrapeReport {
    /// The first `WWW-Authenticate` challenge hit during the walk, if any.
    pub fn authentication_challenge(&self) -> Option<&str> {
        self.failures.iter().find_map(|failure| match &failure.error {
            ScrapeError::AuthenticationRequired { challenge, .. } => Some(challenge.as_str()),
            _ => None,
        })
    }
}

impl Display for ScrapeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, claim) in self.claims.iter().enumerate() {
            write!(f, "{:>3}. {}", i + 1, claim)?;
        }
        writeln!(f, "\nStatistics:")?;
        writeln!(f, "  Claims:         {}", self.claim_count)?;
        writeln!(f, "  Pages fetched:  {}", self.pages_fetched)?;
        writeln!(f, "  Detail fetches: {}", self.detail_fetches)?;
        writeln!(f, "  Elapsed:        {:.2}s", self.elapsed.as_secs_f64())?;
        match self.cpu_time {
            Some(cpu) => writeln!(f, "  CPU time:       {:.2}s", cpu.as_secs_f64())?,
            None => writeln!(f, "  CPU time:       n/a")?,
        }
        if !self.failures.is_empty() {
            writeln!(f, "  Failures:")?;
            for failure in &self.failures {
                writeln!(f, "    {}", failure)?;
            }
        }
        Ok(())
    }
}

fn serialize_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn serialize_opt_secs<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_map_keeps_insertion_order_and_duplicates() {
        let mut fields = FieldMap::new();
        fields.insert("Creditor", "ACME");
        fields.insert("Amount", "");
        fields.insert("Amount", "12,00");
        fields.insert("Creditor", "Beta");
        fields.insert("Creditor", "Gamma");

        let pairs: Vec<_> = fields.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("Creditor", "ACME"),
                ("Amount", "12,00"),
                ("Creditor_2", "Beta"),
                ("Creditor_3", "Gamma"),
            ]
        );
    }

    #[test]
    fn test_claim_record_reserves_amounts_key() {
        let mut record = ClaimRecord::default();
        record.insert("amounts", "3");
        record.amounts.push(AmountRecord::default());

        assert_eq!(record.get("amounts"), None);
        assert_eq!(record.get("amounts_2"), Some("3"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["amounts_2"], "3");
        assert!(json["amounts"].is_array());
    }

    #[test]
    fn test_claim_record_serializes_flat_in_order() {
        let mut fields = FieldMap::new();
        fields.insert("Creditor", "ACME");
        fields.insert("Claim", "show claims");
        let record = ClaimRecord::new(fields);

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"Creditor":"ACME","Claim":"show claims","amounts":[]}"#
        );
    }

    #[test]
    fn test_empty_record_detection() {
        let mut fields = FieldMap::new();
        fields.insert("Creditor", "  ");
        assert!(ClaimRecord::new(fields).is_empty());

        let mut fields = FieldMap::new();
        fields.insert("Creditor", "ACME");
        assert!(!ClaimRecord::new(fields).is_empty());
    }

    #[test]
    fn test_budget_caps_requested_depth() {
        let budget = ScrapeBudget::new(10, 3, 5);
        assert_eq!(budget.max_level, 3);
        assert_eq!(budget.current_level, 1);
        assert!(!budget.is_exhausted());

        let deeper = budget.descend().descend().descend();
        assert_eq!(budget.current_level, 1);
        assert!(deeper.is_exhausted());
    }

    #[test]
    fn test_budget_zero_depth_is_exhausted() {
        assert!(ScrapeBudget::new(0, 50, 5).is_exhausted());
    }

    #[test]
    fn test_budget_can_descend() {
        let budget = ScrapeBudget::new(5, 50, 5);
        assert!(budget.can_descend(2));
        assert!(!budget.descend().can_descend(2));
        assert!(!ScrapeBudget::new(1, 50, 5).can_descend(10));
    }

    fn report(cpu_time: Option<Duration>) -> ScrapeReport {
        let mut fields = FieldMap::new();
        fields.insert("Creditor", "ACME");
        ScrapeReport {
            claims: vec![ClaimRecord::new(fields)],
            failures: Vec::new(),
            claim_count: 1,
            pages_fetched: 1,
            detail_fetches: 0,
            elapsed: Duration::from_millis(1500),
            cpu_time,
        }
    }

    #[test]
    fn test_report_carries_wall_and_cpu_time() {
        let report = report(Some(Duration::from_millis(250)));

        let text = report.to_string();
        assert!(text.contains("Elapsed:        1.50s"), "got {text}");
        assert!(text.contains("CPU time:       0.25s"), "got {text}");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed"], 1.5);
        assert_eq!(json["cpu_time"], 0.25);
        assert_eq!(json["claim_count"], 1);
    }

    #[test]
    fn test_report_without_cpu_time() {
        let report = report(None);

        assert!(report.to_string().contains("CPU time:       n/a"));
        assert!(serde_json::to_value(&report).unwrap()["cpu_time"].is_null());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("pdf".parse::<OutputFormat>().is_err());

        let request = ScrapeRequest::new("https://register.example.org/claims/list.php", 2)
            .with_output_format("json".parse().unwrap());
        assert_eq!(request.output_format, OutputFormat::Json);
        assert_eq!(request.depth, 2);
    }
}
