use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use crate::encoding::clean_text;
use crate::types::{AmountRecord, FieldMap};

pub const CLAIM_ID_FIELD: &str = "claim_id";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unsupported content type: {0}")]
    UnsupportedContent(String),
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unexpected JSON shape: {0}")]
    Shape(String),
}

static RE_SHOW_CLAIMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)show_?claims\s*\(\s*['"]?([\w\-]+)"#).expect("invalid regex: show claims")
});

static RE_PAGE_OF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)page\s+(\d+)\s+of\s+(\d+)").expect("invalid regex: page of")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Markup,
    Json,
}

impl ContentKind {
    pub fn classify(content_type: Option<&str>, text: &str) -> Result<Self, ParseError> {
        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
        let trimmed = text.trim_start();

        if content_type.contains("json") || trimmed.starts_with('{') || trimmed.starts_with('[')
        {
            return Ok(ContentKind::Json);
        }
        if content_type.contains("html")
            || content_type.contains("xml")
            || content_type.starts_with("text/")
            || (content_type.is_empty() && trimmed.starts_with('<'))
        {
            return Ok(ContentKind::Markup);
        }

        Err(ParseError::UnsupportedContent(if content_type.is_empty() {
            "unknown".to_string()
        } else {
            content_type
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRow {
    pub fields: FieldMap,
    /// Claim identifier of a "show claims" handler, if the row carries one.
    pub detail_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub rows: Vec<ExtractedRow>,
    pub total_pages: u32,
}

struct Cell {
    label: String,
    value: String,
    detail_id: Option<String>,
}

fn elem_text(element: ElementRef) -> String {
    element.text().collect::<String>()
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse_listing(text: &str, kind: ContentKind) -> Result<ListingPage, ParseError> {
    match kind {
        ContentKind::Markup => Ok(parse_listing_markup(text)),
        ContentKind::Json => parse_listing_json(text),
    }
}

/// Line items of a creditor-details page.
pub fn parse_amounts(text: &str, kind: ContentKind) -> Result<Vec<AmountRecord>, ParseError> {
    let page = parse_listing(text, kind)?;
    Ok(page
        .rows
        .into_iter()
        .map(|row| AmountRecord::from(row.fields))
        .collect())
}

pub fn parse_listing_markup(html: &str) -> ListingPage {
    let document = Html::parse_document(html);

    let rows = results_table(&document)
        .map(parse_table_rows)
        .unwrap_or_default();

    ListingPage {
        rows,
        total_pages: parse_page_count(&document).unwrap_or(1),
    }
}

fn results_table(document: &Html) -> Option<ElementRef<'_>> {
    let container_sel = Selector::parse("table.results, [data-role=\"results\"]").unwrap();
    let table_sel = Selector::parse("table").unwrap();

    let container = document.select(&container_sel).next()?;
    if container.value().name() == "table" {
        Some(container)
    } else {
        container.select(&table_sel).next()
    }
}

fn enclosing_table(element: ElementRef) -> Option<ElementRef> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "table")
}

fn parse_table_rows(table: ElementRef) -> Vec<ExtractedRow> {
    let row_sel = Selector::parse("tr").unwrap();

    table
        .select(&row_sel)
        // rows of tables nested inside a cell belong to that cell
        .filter(|row| enclosing_table(*row).is_some_and(|t| t == table))
        .filter_map(parse_row)
        .collect()
}

fn parse_row(row: ElementRef) -> Option<ExtractedRow> {
    let mut fields = FieldMap::new();
    let mut detail_id = None;

    let cells = row
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "td" | "th"));

    for cell in cells {
        let Some(cell) = parse_cell(cell) else {
            continue;
        };
        fields.insert(cell.label, cell.value);
        if detail_id.is_none()
            && let Some(id) = cell.detail_id
        {
            fields.insert(CLAIM_ID_FIELD, id.as_str());
            detail_id = Some(id);
        }
    }

    fields
        .has_content()
        .then_some(ExtractedRow { fields, detail_id })
}

fn parse_cell(cell: ElementRef) -> Option<Cell> {
    let label_sel = Selector::parse(".label").unwrap();
    let content_sel = Selector::parse(".content").unwrap();

    let label = cell
        .select(&label_sel)
        .find(|e| belongs_to(*e, cell))
        .map(|e| {
            normalize_whitespace(&elem_text(e))
                .trim_end_matches(':')
                .trim()
                .to_string()
        })
        .filter(|l| !l.is_empty())?;

    let content = cell.select(&content_sel).find(|e| belongs_to(*e, cell));
    let value = content
        .map(|e| normalize_whitespace(&elem_text(e)))
        .unwrap_or_default();
    let detail_id = content.and_then(find_detail_id);

    Some(Cell {
        label,
        value,
        detail_id,
    })
}

/// Whether `element` sits directly in `cell` rather than in a cell of some
/// table nested inside it.
fn belongs_to(element: ElementRef, cell: ElementRef) -> bool {
    let owner = element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| matches!(a.value().name(), "td" | "th"));
    match owner {
        Some(owner) => owner == cell,
        None => !matches!(cell.value().name(), "td" | "th"),
    }
}

fn find_detail_id(element: ElementRef) -> Option<String> {
    element
        .descendants()
        .filter_map(ElementRef::wrap)
        .flat_map(|e| {
            ["onclick", "href"]
                .into_iter()
                .filter_map(move |attr| e.value().attr(attr))
        })
        .find_map(|handler| {
            RE_SHOW_CLAIMS
                .captures(handler)
                .map(|caps| caps[1].to_string())
        })
}

fn parse_page_count(document: &Html) -> Option<u32> {
    let marker_sel = Selector::parse("[data-total-pages]").unwrap();

    document
        .select(&marker_sel)
        .find_map(|e| e.value().attr("data-total-pages")?.trim().parse::<u32>().ok())
        .or_else(|| {
            let text = normalize_whitespace(&elem_text(document.root_element()));
            RE_PAGE_OF.captures(&text)?[2].parse::<u32>().ok()
        })
        .filter(|&n| n > 0)
}

pub fn parse_listing_json(text: &str) -> Result<ListingPage, ParseError> {
    let payload: Value = serde_json::from_str(text)?;

    let (rows, total) = match &payload {
        Value::Array(rows) => (rows, None),
        Value::Object(map) => {
            let rows = map
                .get("rows")
                .or_else(|| map.get("data"))
                .and_then(Value::as_array)
                .ok_or_else(|| ParseError::Shape("expected a `rows` or `data` array".into()))?;
            (rows, map.get("total"))
        }
        _ => {
            return Err(ParseError::Shape(
                "expected an object or an array of rows".into(),
            ));
        }
    };

    let total_pages = total
        .and_then(|t| match t {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        })
        .filter(|&n| n > 0)
        .unwrap_or(1);

    let rows = rows
        .iter()
        .filter_map(Value::as_object)
        .filter_map(parse_json_row)
        .collect();

    Ok(ListingPage { rows, total_pages })
}

fn parse_json_row(row: &Map<String, Value>) -> Option<ExtractedRow> {
    let mut fields = FieldMap::new();
    let mut detail_id = None;

    for (column, value) in row {
        let raw = match value {
            Value::String(s) => clean_text(s),
            Value::Null => String::new(),
            other => other.to_string(),
        };

        if raw.contains('<') {
            let fragment = Html::parse_fragment(&raw);
            if let Some(cell) = parse_cell(fragment.root_element()) {
                fields.insert(cell.label, cell.value);
                if detail_id.is_none()
                    && let Some(id) = cell.detail_id
                {
                    fields.insert(CLAIM_ID_FIELD, id.as_str());
                    detail_id = Some(id);
                }
                continue;
            }
        }
        fields.insert(column.as_str(), raw);
    }

    fields
        .has_content()
        .then_some(ExtractedRow { fields, detail_id })
}
