//! Meeting transcripts (plain text) converted to conversation CSV.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use super::chunking::{ConversationRow, write_csv};
use super::company::upload_csv;
use crate::clients::BlobStore;
use crate::error::{ApiError, ErrorCode, invalid_request};
use crate::models::tenant::csv_file;

pub const SYSTEM_SPEAKER: &str = "システムメッセージ";
const DEFAULT_TITLE: &str = "会議";

static COLON_SPEAKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^：:]+)[：:](.+)$").expect("valid regex"));
static BRACKET_SPEAKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]\s+(.+)$").expect("valid regex"));
static MEETING_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})[-/](\d{1,2})[-/](\d{1,2})").expect("valid regex"));

/// Splits `名前：本文` or `[名前] 本文`; anything else is a system line.
pub fn extract_speaker(line: &str) -> (String, String) {
    let line = line.trim();
    for re in [&*COLON_SPEAKER, &*BRACKET_SPEAKER] {
        if let Some(caps) = re.captures(line) {
            return (caps[1].trim().to_string(), caps[2].trim().to_string());
        }
    }
    (SYSTEM_SPEAKER.to_string(), line.to_string())
}

/// First non-empty line as title and the first date found in the text.
pub fn meeting_info(text: &str, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
    let title = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(DEFAULT_TITLE)
        .to_string();

    let date = MEETING_DATE
        .captures(text)
        .and_then(|caps| {
            NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?)
        })
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now);
    (title, date)
}

/// One row per non-empty line, all in a single thread rooted at the first line.
pub fn transcript_rows(text: &str, now: DateTime<Utc>) -> Vec<ConversationRow> {
    let (title, date) = meeting_info(text, now);
    let root = date.format("%Y-%m-%d %H:%M:%S").to_string();

    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let (speaker, message) = extract_speaker(line);
            ConversationRow {
                timestamp: (date + Duration::seconds(i as i64))
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
                user_id: speaker.clone(),
                user_name: speaker,
                channel: title.clone(),
                message,
                attachments: String::new(),
                parent_timestamp: root.clone(),
            }
        })
        .collect()
}

/// Converts a `.txt` transcript and stores it through the CSV upload path.
pub async fn upload_transcript(
    blob: &dyn BlobStore,
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
    file_name: &str,
    data: &[u8],
) -> Result<(csv_file::Model, usize), ApiError> {
    let Some(stem) = file_name.strip_suffix(".txt") else {
        return Err(invalid_request("テキストファイル(.txt)をアップロードしてください"));
    };
    let text = std::str::from_utf8(data)
        .map_err(|_| invalid_request("テキストファイルはUTF-8である必要があります"))?;

    let rows = transcript_rows(text, Utc::now());
    let csv = write_csv(&rows).map_err(|e| {
        ApiError::new(
            ErrorCode::InternalServerError,
            "テキストファイルの変換とアップロード中にエラーが発生しました",
        )
        .with_details(serde_json::json!({ "error": e.to_string() }))
    })?;

    let file = upload_csv(
        blob,
        tenant_db,
        company_id,
        &format!("{}.csv", stem),
        Some("text/csv"),
        csv,
    )
    .await?;
    tracing::info!(%company_id, file_id = %file.id, rows = rows.len(), "Meeting transcript uploaded");
    Ok((file, rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn speakers_from_colon_and_brackets() {
        assert_eq!(
            extract_speaker("山田：こんにちは"),
            ("山田".to_string(), "こんにちは".to_string())
        );
        assert_eq!(
            extract_speaker("[佐藤]  よろしくお願いします"),
            ("佐藤".to_string(), "よろしくお願いします".to_string())
        );
        assert_eq!(
            extract_speaker("  録音を開始しました "),
            (SYSTEM_SPEAKER.to_string(), "録音を開始しました".to_string())
        );
    }

    #[test]
    fn title_and_date_are_detected() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap();
        let (title, date) = meeting_info("\n 週次定例 \n日付 2024-03-05\n", now);
        assert_eq!(title, "週次定例");
        assert_eq!(date, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());

        let (_, date) = meeting_info("週次定例\n開催 2024/3/5", now);
        assert_eq!(date, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());

        let (title, date) = meeting_info("", now);
        assert_eq!(title, DEFAULT_TITLE);
        assert_eq!(date, now);
    }

    #[test]
    fn rows_share_one_thread_with_increasing_seconds() {
        let now = Utc::now();
        let rows = transcript_rows("定例 2024/01/10\n\n山田：開始します\n[佐藤] 了解です\n", now);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].user_name, SYSTEM_SPEAKER);
        assert_eq!(rows[1].user_id, "山田");
        assert_eq!(rows[2].message, "了解です");
        assert_eq!(rows[2].timestamp, "2024-01-10 00:00:02");
        assert!(rows.iter().all(|r| r.parent_timestamp == "2024-01-10 00:00:00"));
        assert!(rows.iter().all(|r| r.channel == "定例 2024/01/10"));
    }
}
