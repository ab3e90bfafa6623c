//! Response-body writer for bulk export.

use std::io;

use async_trait::async_trait;
use chaosfeed_core::Event;
use chaosfeed_store::ExportSink;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::views::EventView;

pub const CSV_COLUMNS: [&str; 11] = [
    "id",
    "type",
    "github_user",
    "github_user_id",
    "pr_number",
    "issue_number",
    "discussion_number",
    "choice",
    "reaction_type",
    "occurred_at",
    "ingested_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Ndjson,
    Csv,
}

impl ExportFormat {
    /// Absent means NDJSON.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw.map(str::trim) {
            None | Some("") | Some("ndjson") => Some(ExportFormat::Ndjson),
            Some("csv") => Some(ExportFormat::Csv),
            Some(_) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Ndjson => "ndjson",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Ndjson => "application/x-ndjson; charset=utf-8",
            ExportFormat::Csv => "text/csv; charset=utf-8",
        }
    }

    pub fn content_disposition(self) -> &'static str {
        match self {
            ExportFormat::Ndjson => "attachment; filename=chaosfeed-export.ndjson",
            ExportFormat::Csv => "attachment; filename=chaosfeed-export.csv",
        }
    }
}

/// Serializes pages into `out`, one line per event.
pub struct ExportWriter<W> {
    out: W,
    format: ExportFormat,
    buf: Vec<u8>,
}

impl<W> ExportWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W, format: ExportFormat) -> Self {
        Self {
            out,
            format,
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Writes the CSV header row. No-op for NDJSON.
    pub async fn start(&mut self) -> io::Result<()> {
        if self.format == ExportFormat::Csv {
            self.buf.clear();
            push_csv_record(&mut self.buf, CSV_COLUMNS.iter().copied());
            self.out.write_all(&self.buf).await?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W> ExportSink for ExportWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_events(&mut self, events: &[Event]) -> io::Result<()> {
        self.buf.clear();
        for event in events {
            match self.format {
                ExportFormat::Ndjson => {
                    serde_json::to_writer(&mut self.buf, &EventView::from(event))?;
                    self.buf.push(b'\n');
                }
                ExportFormat::Csv => push_csv_event(&mut self.buf, event),
            }
        }
        self.out.write_all(&self.buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.out.flush().await
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn push_csv_event(buf: &mut Vec<u8>, event: &Event) {
    let fields = [
        event.id.to_string(),
        event.event_type.as_str().to_string(),
        event.actor.login.clone(),
        event.actor.id.to_string(),
        optional(event.pr_number()),
        optional(event.issue_number()),
        optional(event.discussion_number()),
        optional(event.choice.map(|c| c.as_i16())),
        event.reaction_kind.clone().unwrap_or_default(),
        timestamp(event.occurred_at),
        timestamp(event.ingested_at),
    ];
    push_csv_record(buf, fields.iter().map(String::as_str));
}

/// RFC 4180 quoting: fields holding a delimiter, quote or line break are
/// wrapped in quotes with inner quotes doubled.
fn push_csv_record<'a>(buf: &mut Vec<u8>, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            buf.push(b'"');
            buf.extend_from_slice(field.replace('"', "\"\"").as_bytes());
            buf.push(b'"');
        } else {
            buf.extend_from_slice(field.as_bytes());
        }
    }
    buf.push(b'\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosfeed_core::{Actor, EventType, TargetRef, VoteChoice};
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    fn vote(login: &str) -> Event {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).unwrap();
        Event {
            id: Uuid::nil(),
            event_type: EventType::Reaction,
            actor: Actor::new(login, 2),
            target: Some(TargetRef::PullRequest(42)),
            comment_id: None,
            choice: Some(VoteChoice::Up),
            reaction_kind: Some("+1".into()),
            external_id: Some(700),
            payload: json!({"content": "+1"}),
            content_hash: "abc".into(),
            edit_history: Vec::new(),
            occurred_at: at,
            ingested_at: at,
        }
    }

    #[test]
    fn format_defaults_to_ndjson_and_rejects_others() {
        assert_eq!(ExportFormat::parse(None), Some(ExportFormat::Ndjson));
        assert_eq!(ExportFormat::parse(Some("csv")), Some(ExportFormat::Csv));
        assert_eq!(ExportFormat::parse(Some("xml")), None);
    }

    #[tokio::test]
    async fn csv_has_header_and_quotes_awkward_fields() {
        let mut writer = ExportWriter::new(Vec::new(), ExportFormat::Csv);
        writer.start().await.unwrap();
        writer
            .write_events(&[vote("bob"), vote("odd,\"name\"")])
            .await
            .unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], CSV_COLUMNS.join(","));
        assert_eq!(
            lines[1],
            "00000000-0000-0000-0000-000000000000,reaction,bob,2,42,,,1,+1,2026-02-24T12:00:00Z,2026-02-24T12:00:00Z"
        );
        assert!(lines[2].contains(",\"odd,\"\"name\"\"\","));
    }

    #[tokio::test]
    async fn ndjson_writes_one_object_per_line() {
        let mut writer = ExportWriter::new(Vec::new(), ExportFormat::Ndjson);
        writer.start().await.unwrap();
        writer.write_events(&[vote("a"), vote("b")]).await.unwrap();
        writer.flush().await.unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();

        let logins: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["githubUser"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(logins, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn closed_reader_surfaces_as_write_error() {
        let (tx, rx) = tokio::io::duplex(16);
        drop(rx);
        let mut writer = ExportWriter::new(tx, ExportFormat::Ndjson);
        assert!(writer.write_events(&[vote("a")]).await.is_err());
    }
}
