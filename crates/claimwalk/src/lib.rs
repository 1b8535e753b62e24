pub mod config;
pub mod encoding;
pub mod error;
pub mod fetch;
pub mod parser;
pub mod scraper;
pub mod target;
pub mod types;

pub use config::AgentConfig;
pub use error::ScrapeError;
pub use scraper::WebScraper;
pub use target::ScrapeTarget;
