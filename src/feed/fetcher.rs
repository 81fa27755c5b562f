use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use feed_rs::parser;
use reqwest::Client;

use crate::config::Config;
use crate::error::Result;
use crate::models::RawPaper;

const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";
const PAGE_SIZE: usize = 100;
/// arXiv asks API clients to wait 3 seconds between consecutive calls.
const ARXIV_PAGE_DELAY: Duration = Duration::from_secs(3);

/// Inclusive range of submission dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn last_days(now: DateTime<Utc>, days: u32) -> Self {
        let end = now.date_naive();
        let start = end - ChronoDuration::days(i64::from(days));
        Self { start, end }
    }

    /// `cat:<category> AND submittedDate:[YYYYMMDD0000 TO YYYYMMDD2359]`
    pub fn search_query(&self, category: &str) -> String {
        format!(
            "cat:{} AND submittedDate:[{}0000 TO {}2359]",
            category,
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }
}

pub struct ArxivFetcher {
    client: Client,
    base_url: String,
    category: String,
    fetch_days: u32,
    recent_days: u32,
    max_results: usize,
}

impl ArxivFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("arxiv-feed-bot/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: ARXIV_API_URL.to_string(),
            category: config.arxiv_category.clone(),
            fetch_days: config.fetch_days,
            recent_days: config.recent_days,
            max_results: config.max_results,
        })
    }

    /// Fetches the configured window and keeps papers published within the
    /// last `recent_days`. The wider window absorbs arXiv indexing delays.
    pub async fn fetch_recent(&self, now: DateTime<Utc>) -> Result<Vec<RawPaper>> {
        let range = DateRange::last_days(now, self.fetch_days);
        tracing::info!(
            "Fetching {} papers submitted {} to {}",
            self.category,
            range.start,
            range.end
        );

        let papers = self.fetch_range(&self.category, range, self.max_results).await?;
        let fetched = papers.len();
        let recent = keep_recent(papers, now, self.recent_days);

        tracing::info!(
            "Fetched {} papers, {} published in the last {} days",
            fetched,
            recent.len(),
            self.recent_days
        );
        Ok(recent)
    }

    /// Single-entry query over the configured window, for `--check`.
    pub async fn check_window(&self, now: DateTime<Utc>) -> Result<usize> {
        let range = DateRange::last_days(now, self.fetch_days);
        Ok(self.fetch_range(&self.category, range, 1).await?.len())
    }

    pub async fn fetch_range(
        &self,
        category: &str,
        range: DateRange,
        max_results: usize,
    ) -> Result<Vec<RawPaper>> {
        let query = range.search_query(category);
        let mut seen = HashSet::new();
        let mut papers = Vec::new();
        let mut start = 0;

        while let Some(page_size) = next_page_size(start, max_results) {
            if start > 0 {
                tokio::time::sleep(ARXIV_PAGE_DELAY).await;
            }

            let page = self.fetch_page(&query, start, page_size).await?;
            tracing::debug!("arXiv page at offset {} returned {} entries", start, page.len());

            if !merge_page(&mut seen, &mut papers, page, page_size) {
                break;
            }
            start += page_size;
        }

        Ok(papers)
    }

    async fn fetch_page(&self, query: &str, start: usize, page_size: usize) -> Result<Vec<RawPaper>> {
        let url = format!(
            "{}?search_query={}&start={}&max_results={}&sortBy=submittedDate&sortOrder=descending",
            self.base_url,
            urlencoding::encode(query),
            start,
            page_size
        );

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("arXiv query failed: HTTP {}", response.status()).into());
        }

        let bytes = response.bytes().await?;
        parse_entries(&bytes[..])
    }
}

/// Size of the page starting at `start`, or `None` once `max_results`
/// entries have been requested.
fn next_page_size(start: usize, max_results: usize) -> Option<usize> {
    (start < max_results).then(|| PAGE_SIZE.min(max_results - start))
}

/// Appends entries not seen on an earlier page. A page shorter than
/// requested is the last one, so the return value says whether to go on.
fn merge_page(
    seen: &mut HashSet<String>,
    papers: &mut Vec<RawPaper>,
    page: Vec<RawPaper>,
    page_size: usize,
) -> bool {
    let received = page.len();
    for paper in page {
        if seen.insert(paper.arxiv_id.clone()) {
            papers.push(paper);
        }
    }
    received >= page_size
}

fn keep_recent(papers: Vec<RawPaper>, now: DateTime<Utc>, recent_days: u32) -> Vec<RawPaper> {
    let cutoff = now - ChronoDuration::days(i64::from(recent_days));
    papers
        .into_iter()
        .filter(|p| p.published_at >= cutoff)
        .collect()
}

/// Converts an arXiv Atom response into raw papers. Entries without an
/// `/abs/` identifier (the API reports errors this way) or without a
/// publication date are skipped.
pub fn parse_entries(bytes: &[u8]) -> Result<Vec<RawPaper>> {
    let feed = parser::parse(bytes)?;

    let papers = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let Some(arxiv_id) = arxiv_id_from_entry_id(&entry.id) else {
                let message = entry.title.as_ref().map(|t| t.content.clone()).unwrap_or_default();
                tracing::warn!("Skipping non-paper entry {}: {}", entry.id, message);
                return None;
            };

            let Some(published_at) = entry.published.or(entry.updated) else {
                tracing::warn!("Skipping {}: no publication date", arxiv_id);
                return None;
            };

            Some(RawPaper {
                url: format!("https://arxiv.org/abs/{}", arxiv_id),
                title: entry
                    .title
                    .map(|t| collapse_whitespace(&t.content))
                    .unwrap_or_else(|| "Untitled".to_string()),
                abstract_text: entry
                    .summary
                    .map(|s| collapse_whitespace(&s.content))
                    .unwrap_or_default(),
                authors: entry.authors.into_iter().map(|a| a.name).collect(),
                categories: entry.categories.into_iter().map(|c| c.term).collect(),
                published_at,
                arxiv_id,
            })
        })
        .collect();

    Ok(papers)
}

/// `http://arxiv.org/abs/2401.01234v2` -> `2401.01234`
pub fn arxiv_id_from_entry_id(entry_id: &str) -> Option<String> {
    let (_, id) = entry_id.rsplit_once("/abs/")?;
    let id = id.trim();
    let without_digits = id.trim_end_matches(|c: char| c.is_ascii_digit());
    let id = match without_digits.strip_suffix('v') {
        Some(base) if without_digits.len() < id.len() => base,
        _ => id,
    };
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
