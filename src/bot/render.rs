use chrono::SecondsFormat;

use crate::discord::{Embed, EmbedField, EmbedFooter};
use crate::models::{FeedStats, ImpactScore, MatchKind, Paper, SearchHit};

// Discord embed limits
const TITLE_LIMIT: usize = 256;
const DESCRIPTION_LIMIT: usize = 4096;
const FIELD_LIMIT: usize = 1024;

/// Longest query echoed back in a reply header.
pub const QUERY_ECHO_LIMIT: usize = 200;

const MAX_LISTED_AUTHORS: usize = 3;

pub const COLOR_EXCEPTIONAL: u32 = 0x2ECC71;
pub const COLOR_STRONG: u32 = 0x3498DB;
pub const COLOR_SOLID: u32 = 0xF39C12;
pub const COLOR_MINOR: u32 = 0x95A5A6;

pub fn score_color(score: ImpactScore) -> u32 {
    match score.get() {
        9..=10 => COLOR_EXCEPTIONAL,
        7..=8 => COLOR_STRONG,
        5..=6 => COLOR_SOLID,
        _ => COLOR_MINOR,
    }
}

/// Full feed card for a single paper.
pub fn paper_card(paper: &Paper) -> Embed {
    Embed {
        title: Some(truncate(&paper.title, TITLE_LIMIT)),
        url: Some(paper.url.clone()),
        description: Some(truncate(&paper.summary, DESCRIPTION_LIMIT)),
        color: Some(score_color(paper.impact_score)),
        fields: vec![
            field("Impact", format!("★ {}", paper.impact_score), true),
            field("Tags", tag_list(paper), true),
            field("Authors", author_list(&paper.authors), false),
            field("Published", paper.published_at.format("%Y-%m-%d").to_string(), true),
        ],
        footer: Some(EmbedFooter {
            text: format!("arXiv:{}", paper.arxiv_id),
        }),
        timestamp: Some(paper.published_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}

/// One compact embed per hit.
pub fn search_results(hits: &[SearchHit]) -> Vec<Embed> {
    hits.iter()
        .enumerate()
        .map(|(rank, hit)| {
            let annotation = match hit.kind {
                MatchKind::Semantic => format!("similarity {:.0}%", hit.score * 100.0),
                MatchKind::FullText => format!("text rank {:.2}", hit.score),
            };
            Embed {
                title: Some(truncate(&format!("{}. {}", rank + 1, hit.paper.title), TITLE_LIMIT)),
                url: Some(hit.paper.url.clone()),
                description: Some(truncate(&hit.paper.summary, DESCRIPTION_LIMIT)),
                color: Some(score_color(hit.paper.impact_score)),
                footer: Some(EmbedFooter {
                    text: format!("★ {} · {} · {}", hit.paper.impact_score, tag_list(&hit.paper), annotation),
                }),
                ..Default::default()
            }
        })
        .collect()
}

pub fn search_header(query: &str, hits: &[SearchHit]) -> String {
    let query = truncate(query, QUERY_ECHO_LIMIT);
    match hits.first().map(|h| h.kind) {
        None => format!("No papers found for \"{}\".", query),
        Some(MatchKind::Semantic) => format!("Top {} papers for \"{}\":", hits.len(), query),
        Some(MatchKind::FullText) => format!(
            "No close semantic matches for \"{}\"; {} keyword matches:",
            query,
            hits.len()
        ),
    }
}

pub fn latest_list(papers: &[Paper]) -> Vec<Embed> {
    papers
        .iter()
        .map(|paper| Embed {
            title: Some(truncate(&paper.title, TITLE_LIMIT)),
            url: Some(paper.url.clone()),
            description: Some(truncate(&paper.summary, DESCRIPTION_LIMIT)),
            color: Some(score_color(paper.impact_score)),
            footer: Some(EmbedFooter {
                text: format!(
                    "★ {} · {} · {}",
                    paper.impact_score,
                    tag_list(paper),
                    paper.published_at.format("%Y-%m-%d")
                ),
            }),
            ..Default::default()
        })
        .collect()
}

pub fn stats_embed(stats: &FeedStats, threshold: ImpactScore) -> Embed {
    let average = stats
        .average_score
        .map(|a| format!("{:.1}", a))
        .unwrap_or_else(|| "–".to_string());
    let newest = stats
        .newest_published
        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "–".to_string());
    let tags = if stats.top_tags.is_empty() {
        "–".to_string()
    } else {
        stats
            .top_tags
            .iter()
            .map(|(tag, n)| format!("{} ({})", tag, n))
            .collect::<Vec<_>>()
            .join(", ")
    };

    Embed {
        title: Some("arXiv feed statistics".to_string()),
        color: Some(COLOR_STRONG),
        fields: vec![
            field("Papers", stats.total.to_string(), true),
            field("Posted", stats.posted.to_string(), true),
            field("Unposted", stats.unposted.to_string(), true),
            field(
                &format!("Queued (score ≥ {})", threshold.get()),
                stats.pending_above_threshold.to_string(),
                true,
            ),
            field("Average score", average, true),
            field("Newest paper", newest, true),
            field("Top tags", tags, false),
        ],
        ..Default::default()
    }
}

fn field(name: &str, value: String, inline: bool) -> EmbedField {
    EmbedField {
        name: name.to_string(),
        value: truncate(&value, FIELD_LIMIT),
        inline,
    }
}

fn tag_list(paper: &Paper) -> String {
    if paper.tags.is_empty() {
        return "–".to_string();
    }
    paper
        .tags
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn author_list(authors: &[String]) -> String {
    match authors.len() {
        0 => "Unknown".to_string(),
        n if n <= MAX_LISTED_AUTHORS => authors.join(", "),
        _ => format!("{} et al.", authors[..MAX_LISTED_AUTHORS].join(", ")),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max - 1).collect();
    truncated.push('…');
    truncated
}
