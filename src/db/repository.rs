use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{
    EnrichedPaper, Embedding, FeedStats, ImpactScore, MatchKind, Paper, PostRecord, SearchHit,
    Tag, UpsertOutcome,
};

use super::schema::SCHEMA;

const PAPER_COLUMNS: &str = "p.id, p.arxiv_id, p.title, p.abstract, p.authors, p.published_at, p.url, \
     p.impact_score, p.summary, p.tags, p.embedding, p.posted, p.last_posted_at, p.created_at, p.updated_at";

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Writer

    /// Inserts a paper, or refreshes the enrichment of an existing one.
    /// An update never touches the posted flag or post timestamp; an insert
    /// takes them from the post log, so a pruned paper fetched again is not
    /// posted a second time.
    pub async fn upsert_paper(&self, paper: &EnrichedPaper) -> Result<UpsertOutcome> {
        let arxiv_id = paper.raw.arxiv_id.clone();
        let title = paper.raw.title.clone();
        let abstract_text = paper.raw.abstract_text.clone();
        let authors = serde_json::to_string(&paper.raw.authors)?;
        let published_at = format_datetime(&paper.raw.published_at);
        let url = paper.raw.url.clone();
        let score = i64::from(paper.enrichment.score.get());
        let summary = paper.enrichment.summary.clone();
        let tags = serde_json::to_string(&paper.enrichment.tags)?;
        let embedding = paper.embedding.to_bytes();

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existed = tx
                    .query_row(
                        "SELECT 1 FROM papers WHERE arxiv_id = ?1",
                        params![arxiv_id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();

                tx.execute(
                    r#"INSERT INTO papers (arxiv_id, title, abstract, authors, published_at, url,
                                           impact_score, summary, tags, embedding,
                                           posted, last_posted_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                               EXISTS (SELECT 1 FROM post_log WHERE arxiv_id = ?1),
                               (SELECT posted_at FROM post_log WHERE arxiv_id = ?1))
                       ON CONFLICT(arxiv_id) DO UPDATE SET
                           title = excluded.title,
                           abstract = excluded.abstract,
                           authors = excluded.authors,
                           published_at = excluded.published_at,
                           url = excluded.url,
                           impact_score = excluded.impact_score,
                           summary = excluded.summary,
                           tags = excluded.tags,
                           embedding = excluded.embedding,
                           updated_at = datetime('now')"#,
                    params![
                        arxiv_id,
                        title,
                        abstract_text,
                        authors,
                        published_at,
                        url,
                        score,
                        summary,
                        tags,
                        embedding,
                    ],
                )?;
                tx.commit()?;

                Ok(if existed {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Inserted
                })
            })
            .await?;
        Ok(outcome)
    }

    pub async fn exists(&self, arxiv_id: &str) -> Result<bool> {
        let arxiv_id = arxiv_id.to_string();
        let exists = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM papers WHERE arxiv_id = ?1",
                    params![arxiv_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await?;
        Ok(exists)
    }

    #[allow(dead_code)]
    pub async fn get_paper(&self, arxiv_id: &str) -> Result<Option<Paper>> {
        let arxiv_id = arxiv_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM papers p WHERE p.arxiv_id = ?1",
                    PAPER_COLUMNS
                ))?;
                let row = stmt
                    .query_row(params![arxiv_id], paper_row)
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(Paper::try_from).transpose()
    }

    pub async fn count(&self) -> Result<u64> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    // Feed

    /// Papers the feed has not sent yet whose score meets the threshold,
    /// best first.
    pub async fn unposted_above(&self, threshold: ImpactScore, limit: usize) -> Result<Vec<Paper>> {
        let threshold = i64::from(threshold.get());
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {} FROM papers p
                       WHERE p.posted = 0 AND p.impact_score >= ?1
                       ORDER BY p.impact_score DESC, p.published_at DESC
                       LIMIT ?2"#,
                    PAPER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![threshold, limit], paper_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(Paper::try_from).collect()
    }

    /// Flips `posted` from false to true and appends to the post log.
    /// Returns false if the paper was already posted or does not exist.
    pub async fn mark_posted(&self, arxiv_id: &str, channel_id: u64, message_id: &str) -> Result<bool> {
        let arxiv_id = arxiv_id.to_string();
        let message_id = message_id.to_string();
        let posted_at = format_datetime(&Utc::now());

        let transitioned = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE papers SET posted = 1, last_posted_at = ?1 WHERE arxiv_id = ?2 AND posted = 0",
                    params![posted_at, arxiv_id],
                )?;
                if changed == 1 {
                    tx.execute(
                        "INSERT OR IGNORE INTO post_log (arxiv_id, channel_id, message_id, posted_at) VALUES (?1, ?2, ?3, ?4)",
                        params![arxiv_id, channel_id.to_string(), message_id, posted_at],
                    )?;
                }
                tx.commit()?;
                Ok(changed == 1)
            })
            .await?;
        Ok(transitioned)
    }

    #[allow(dead_code)]
    pub async fn post_record(&self, arxiv_id: &str) -> Result<Option<PostRecord>> {
        let arxiv_id = arxiv_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT arxiv_id, channel_id, message_id, posted_at FROM post_log WHERE arxiv_id = ?1",
                        params![arxiv_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(|(arxiv_id, channel_id, message_id, posted_at)| {
            Ok(PostRecord {
                arxiv_id,
                channel_id: channel_id
                    .parse()
                    .map_err(|_| AppError::InvalidInput(format!("bad channel id {:?}", channel_id)))?,
                message_id,
                posted_at: parse_datetime(&posted_at).unwrap_or_else(Utc::now),
            })
        })
        .transpose()
    }

    // Queries

    /// Nearest neighbours by cosine similarity, keeping only hits at or
    /// above `floor`.
    pub async fn match_papers(&self, query: &Embedding, floor: f32, limit: usize) -> Result<Vec<SearchHit>> {
        let vectors = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, embedding FROM papers")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut scored = Vec::new();
        for (id, bytes) in vectors {
            let similarity = Embedding::from_bytes(&bytes)?.cosine_similarity(query);
            if similarity >= floor {
                scored.push((id, similarity));
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);

        let mut hits = Vec::with_capacity(scored.len());
        for (id, similarity) in scored {
            if let Some(paper) = self.get_paper_by_id(id).await? {
                hits.push(SearchHit {
                    paper,
                    score: similarity,
                    kind: MatchKind::Semantic,
                });
            }
        }
        Ok(hits)
    }

    /// Full-text search over title and abstract, ranked by bm25.
    pub async fn search_fulltext(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let limit = limit as i64;

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {}, bm25(papers_fts) AS rank
                       FROM papers_fts
                       JOIN papers p ON p.id = papers_fts.rowid
                       WHERE papers_fts MATCH ?1
                       ORDER BY rank
                       LIMIT ?2"#,
                    PAPER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![fts_query, limit], |row| {
                        Ok((paper_row(row)?, row.get::<_, f64>(15)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(row, rank)| {
                Ok(SearchHit {
                    paper: Paper::try_from(row)?,
                    score: -rank as f32,
                    kind: MatchKind::FullText,
                })
            })
            .collect()
    }

    pub async fn latest(&self, limit: usize) -> Result<Vec<Paper>> {
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM papers p ORDER BY p.published_at DESC, p.id DESC LIMIT ?1",
                    PAPER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit], paper_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(Paper::try_from).collect()
    }

    pub async fn stats(&self, threshold: ImpactScore) -> Result<FeedStats> {
        let threshold = i64::from(threshold.get());
        let (totals, tag_rows) = self
            .conn
            .call(move |conn| {
                let totals = conn.query_row(
                    r#"SELECT COUNT(*),
                              COALESCE(SUM(posted), 0),
                              COALESCE(SUM(CASE WHEN posted = 0 AND impact_score >= ?1 THEN 1 ELSE 0 END), 0),
                              AVG(impact_score),
                              MAX(published_at)
                       FROM papers"#,
                    params![threshold],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<f64>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )?;

                let mut stmt = conn.prepare(
                    r#"SELECT tag.value, COUNT(*) AS n
                       FROM papers, json_each(papers.tags) AS tag
                       GROUP BY tag.value
                       ORDER BY n DESC, tag.value
                       LIMIT 5"#,
                )?;
                let tag_rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok((totals, tag_rows))
            })
            .await?;

        let (total, posted, pending, average, newest) = totals;
        Ok(FeedStats {
            total: total.max(0) as u64,
            posted: posted.max(0) as u64,
            unposted: (total - posted).max(0) as u64,
            pending_above_threshold: pending.max(0) as u64,
            average_score: average,
            newest_published: newest.and_then(|s| parse_datetime(&s)),
            top_tags: tag_rows
                .into_iter()
                .filter_map(|(tag, n)| tag.parse::<Tag>().ok().map(|t| (t, n.max(0) as u64)))
                .collect(),
        })
    }

    /// Operator retention: drops papers published before `cutoff`.
    /// The post log is left intact.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_datetime(&cutoff);
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted = conn.execute("DELETE FROM papers WHERE published_at < ?1", params![cutoff])?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted)
    }

    async fn get_paper_by_id(&self, id: i64) -> Result<Option<Paper>> {
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT {} FROM papers p WHERE p.id = ?1", PAPER_COLUMNS))?;
                let row = stmt.query_row(params![id], paper_row).optional()?;
                Ok(row)
            })
            .await?;
        row.map(Paper::try_from).transpose()
    }
}

/// Column values as stored; decoded into a `Paper` outside the connection thread.
struct PaperRow {
    id: i64,
    arxiv_id: String,
    title: String,
    abstract_text: String,
    authors: String,
    published_at: String,
    url: String,
    impact_score: i64,
    summary: String,
    tags: String,
    embedding: Vec<u8>,
    posted: bool,
    last_posted_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn paper_row(row: &Row) -> rusqlite::Result<PaperRow> {
    Ok(PaperRow {
        id: row.get(0)?,
        arxiv_id: row.get(1)?,
        title: row.get(2)?,
        abstract_text: row.get(3)?,
        authors: row.get(4)?,
        published_at: row.get(5)?,
        url: row.get(6)?,
        impact_score: row.get(7)?,
        summary: row.get(8)?,
        tags: row.get(9)?,
        embedding: row.get(10)?,
        posted: row.get(11)?,
        last_posted_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl TryFrom<PaperRow> for Paper {
    type Error = AppError;

    fn try_from(row: PaperRow) -> Result<Self> {
        let published_at = parse_datetime(&row.published_at).ok_or_else(|| {
            AppError::InvalidInput(format!("bad published_at for {}: {}", row.arxiv_id, row.published_at))
        })?;

        Ok(Paper {
            id: row.id,
            authors: serde_json::from_str(&row.authors)?,
            published_at,
            impact_score: ImpactScore::new(row.impact_score)?,
            tags: serde_json::from_str(&row.tags)?,
            embedding: Embedding::from_bytes(&row.embedding)?,
            posted: row.posted,
            last_posted_at: row.last_posted_at.and_then(|s| parse_datetime(&s)),
            created_at: parse_datetime(&row.created_at).unwrap_or_else(Utc::now),
            updated_at: parse_datetime(&row.updated_at).unwrap_or_else(Utc::now),
            arxiv_id: row.arxiv_id,
            title: row.title,
            abstract_text: row.abstract_text,
            url: row.url,
            summary: row.summary,
        })
    }
}

/// Turns free text into an FTS5 expression of quoted terms, so user input
/// can never be read as query syntax. All terms must match.
fn fts_query(input: &str) -> Option<String> {
    let terms: Vec<String> = input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}
