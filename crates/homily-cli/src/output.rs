//! Terminal and JSON rendering of search results and sermons.

use std::fmt::Write;

use anyhow::Result;
use serde::Serialize;

use homily_index::{BlockNode, PageInfo, SearchData, SearchResponse, SermonOutline};

/// Maximum characters of text shown per result.
const SNIPPET_MAX_LEN: usize = 200;

pub fn format_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn format_search(query: &str, response: &SearchResponse) -> String {
    let mut out = String::new();
    if response.data.is_empty() {
        let _ = writeln!(out, "No results for \"{query}\"");
        out.push_str(&format_pagination(&response.pagination));
        return out;
    }

    match &response.data {
        SearchData::Fused(rows) => {
            for (i, row) in rows.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}. {} {} [{}] score {:.4}",
                    i + 1,
                    row.sermon_title,
                    date_label(row.sermon_date.as_deref()),
                    row.uid,
                    row.score
                );
                let _ = writeln!(out, "   {}", truncate_text(&row.text, SNIPPET_MAX_LEN));
            }
        }
        SearchData::Lexical(hits) => {
            for (i, hit) in hits.iter().enumerate() {
                let location = hit.block_uid.as_deref().unwrap_or(&hit.paragraph_uid);
                let _ = writeln!(
                    out,
                    "{}. {} {} [{}]",
                    i + 1,
                    hit.sermon_title,
                    date_label(hit.sermon_date.as_deref()),
                    location
                );
                let _ = writeln!(out, "   {}", truncate_text(&hit.text, SNIPPET_MAX_LEN));
            }
        }
        SearchData::Semantic(hits) => {
            for (i, hit) in hits.iter().enumerate() {
                let record = &hit.record;
                let _ = writeln!(
                    out,
                    "{}. {} {} [{}] similarity {:.3}",
                    i + 1,
                    record.sermon_title,
                    date_label(record.sermon_date.as_deref()),
                    record.block_uid,
                    hit.similarity
                );
                let _ = writeln!(out, "   {}", truncate_text(&record.paragraph_text, SNIPPET_MAX_LEN));
            }
        }
    }
    out.push_str(&format_pagination(&response.pagination));
    out
}

fn format_pagination(info: &PageInfo) -> String {
    if info.page_size < 0 {
        return format!("{} result(s)", info.total.unwrap_or(0));
    }
    match (info.total, info.total_pages) {
        (Some(total), Some(pages)) => format!("Page {} of {} ({} results)", info.page, pages.max(1), total),
        _ if info.has_next => format!("Page {} (more available)", info.page),
        _ => format!("Page {}", info.page),
    }
}

fn date_label(date: Option<&str>) -> String {
    date.map(|d| format!("({d})")).unwrap_or_default()
}

pub fn format_sermon(outline: &SermonOutline) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} [{}]",
        outline.sermon.title,
        date_label(outline.sermon.date.as_deref()),
        outline.sermon.uid
    );
    for section in &outline.sections {
        out.push('\n');
        match section.number {
            Some(n) => {
                let _ = writeln!(out, "§{n}");
            }
            None => {
                let _ = writeln!(out, "§ {}", section.uid);
            }
        }
        for paragraph in outline.paragraphs_of(section) {
            let text = join_blocks(outline.blocks_of(paragraph));
            let _ = writeln!(out, "  [{}] {}", paragraph.uid, text);
        }
    }
    out
}

pub fn format_paragraph(uid: &str, blocks: &[BlockNode]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[{uid}]");
    for block in blocks {
        let indent = if block.indented { "    " } else { "  " };
        let _ = writeln!(out, "{indent}{}", block.text);
    }
    out
}

fn join_blocks(blocks: &[BlockNode]) -> String {
    blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate at a character boundary, appending an ellipsis when cut.
fn truncate_text(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
