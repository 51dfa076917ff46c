//! Conversation CSV rows and thread-aware chunking for the vector index.
//!
//! Rows are grouped by thread (parent timestamp, else own timestamp), groups
//! are packed into chunks of roughly [`TARGET_CHUNK_TOKENS`], and a gap of
//! more than [`TIME_WINDOW_MINUTES`] between groups starts a new chunk.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TARGET_CHUNK_TOKENS: usize = 1000;
pub const TIME_WINDOW_MINUTES: i64 = 5;

/// Column order used for every CSV this service writes.
pub const CSV_HEADERS: [&str; 7] = [
    "Timestamp",
    "User ID",
    "User Name",
    "Channel",
    "Message",
    "Attachments",
    "Parent Message Timestamp",
];

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV writer error: {0}")]
    Writer(String),
}

/// One message line of a conversation export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "User ID", default)]
    pub user_id: String,
    #[serde(rename = "User Name", default)]
    pub user_name: String,
    #[serde(rename = "Channel", default)]
    pub channel: String,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Attachments", default)]
    pub attachments: String,
    #[serde(rename = "Parent Message Timestamp", default)]
    pub parent_timestamp: String,
}

/// Reads rows from CSV bytes with a header line. A UTF-8 BOM is ignored.
pub fn parse_csv(data: &[u8]) -> Result<Vec<ConversationRow>, ChunkError> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(data);
    reader
        .deserialize()
        .collect::<Result<Vec<ConversationRow>, _>>()
        .map_err(ChunkError::from)
}

/// Writes rows as CSV with [`CSV_HEADERS`].
pub fn write_csv(rows: &[ConversationRow]) -> Result<Vec<u8>, ChunkError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(CSV_HEADERS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| ChunkError::Writer(e.to_string()))
}

/// Parses the timestamp formats found in exports. Naive values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    for format in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Approximate token count: one per non-ASCII char, one per four ASCII bytes.
pub fn estimate_tokens(text: &str) -> usize {
    let (ascii, other) = text.chars().fold((0usize, 0usize), |(a, o), c| {
        if c.is_ascii() { (a + 1, o) } else { (a, o + 1) }
    });
    other + ascii.div_ceil(4)
}

struct ParsedRow<'a> {
    ts: Option<DateTime<Utc>>,
    thread: DateTime<Utc>,
    row: &'a ConversationRow,
}

fn render_line(ts: Option<DateTime<Utc>>, row: &ConversationRow) -> String {
    let timestamp = ts
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| row.timestamp.clone());
    [
        timestamp.as_str(),
        &row.user_id,
        &row.user_name,
        &row.channel,
        &row.message,
        &row.attachments,
    ]
    .join(" ")
}

fn flush(lines: &mut Vec<String>, chunks: &mut Vec<String>) {
    if !lines.is_empty() {
        chunks.push(lines.join("\n"));
    }
    lines.clear();
}

/// Splits conversation rows into text chunks ready for embedding.
///
/// Rows with neither a parsable timestamp nor a parent timestamp have no
/// thread and are dropped. Empty chunks are never returned.
pub fn chunk_conversation(rows: &[ConversationRow]) -> Vec<String> {
    let mut parsed: Vec<ParsedRow<'_>> = rows
        .iter()
        .filter_map(|row| {
            let ts = parse_timestamp(&row.timestamp);
            let thread = parse_timestamp(&row.parent_timestamp).or(ts)?;
            Some(ParsedRow { ts, thread, row })
        })
        .collect();
    // Stable sort keeps file order for equal timestamps.
    parsed.sort_by_key(|p| p.ts);

    let mut groups: Vec<(DateTime<Utc>, Vec<&ParsedRow<'_>>)> = Vec::new();
    let mut order: Vec<&ParsedRow<'_>> = parsed.iter().collect();
    order.sort_by_key(|p| p.thread);
    for p in order {
        match groups.last_mut() {
            Some((key, members)) if *key == p.thread => members.push(p),
            _ => groups.push((p.thread, vec![p])),
        }
    }

    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;
    let mut last_ts: Option<DateTime<Utc>> = None;

    for (_, members) in groups {
        let first_ts = members[0].ts;
        let lines: Vec<String> = members.iter().map(|p| render_line(p.ts, p.row)).collect();
        let group_tokens = estimate_tokens(&lines.join("\n"));

        if !current.is_empty() && current_tokens + group_tokens > TARGET_CHUNK_TOKENS {
            flush(&mut current, &mut chunks);
            current_tokens = 0;
            last_ts = None;
        }

        if group_tokens > TARGET_CHUNK_TOKENS {
            let mut piece: Vec<String> = Vec::new();
            let mut piece_tokens = 0usize;
            for line in lines {
                let line_tokens = estimate_tokens(&line);
                if piece_tokens + line_tokens > TARGET_CHUNK_TOKENS {
                    flush(&mut piece, &mut chunks);
                    piece_tokens = 0;
                }
                piece.push(line);
                piece_tokens += line_tokens;
            }
            flush(&mut piece, &mut chunks);
            continue;
        }

        if let (Some(last), Some(first)) = (last_ts, first_ts) {
            if first - last > Duration::minutes(TIME_WINDOW_MINUTES) {
                flush(&mut current, &mut chunks);
                current_tokens = 0;
            }
        }

        current.extend(lines);
        current_tokens += group_tokens;
        if let Some(group_max) = members.iter().filter_map(|p| p.ts).max() {
            last_ts = Some(last_ts.map_or(group_max, |last| last.max(group_max)));
        }
    }
    flush(&mut current, &mut chunks);

    chunks
}
