//! Bulk export over the cursor pagination.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chaosfeed_core::Event;
use tokio::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::{ListFilters, PgEventStore, SortOrder, StoreError};

/// Destination for exported pages, typically a response body.
#[async_trait]
pub trait ExportSink: Send {
    async fn write_events(&mut self, events: &[Event]) -> std::io::Result<()>;

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub page_size: usize,
    pub max_rows: usize,
    pub deadline: Duration,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_rows: 100_000,
            deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStop {
    Exhausted,
    RowCap,
    Deadline,
    /// The sink refused a write, usually a disconnected client.
    SinkClosed,
    QueryFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: usize,
    pub stop: ExportStop,
}

impl PgEventStore {
    /// Streams every matching event into `sink`. Never fails: the summary
    /// says how far it got and why it stopped.
    pub async fn export<S>(
        &self,
        filters: &ListFilters,
        sort: SortOrder,
        options: &ExportOptions,
        sink: &mut S,
    ) -> ExportSummary
    where
        S: ExportSink + ?Sized,
    {
        drive(
            move |cursor, page_size| self.export_page(filters, sort, page_size, cursor),
            sink,
            options,
        )
        .await
    }
}

pub(crate) async fn drive<F, Fut, S>(
    mut fetch: F,
    sink: &mut S,
    options: &ExportOptions,
) -> ExportSummary
where
    F: FnMut(Option<Uuid>, i64) -> Fut,
    Fut: Future<Output = Result<Vec<Event>, StoreError>>,
    S: ExportSink + ?Sized,
{
    let deadline = Instant::now() + options.deadline;
    let mut cursor = None;
    let mut rows = 0usize;

    let stop = loop {
        if rows >= options.max_rows {
            break ExportStop::RowCap;
        }
        if Instant::now() >= deadline {
            break ExportStop::Deadline;
        }

        let requested = options.page_size.min(options.max_rows - rows).max(1);
        let page = match tokio::time::timeout_at(deadline, fetch(cursor, requested as i64)).await {
            Err(_) => break ExportStop::Deadline,
            Ok(Err(err)) => {
                error!(error = %err, exported = rows, "export query failed");
                break ExportStop::QueryFailed;
            }
            Ok(Ok(page)) => page,
        };
        if page.is_empty() {
            break ExportStop::Exhausted;
        }

        if let Err(err) = sink.write_events(&page).await {
            info!(error = %err, exported = rows, "export sink closed");
            break ExportStop::SinkClosed;
        }
        rows += page.len();
        cursor = page.last().map(|event| event.id);

        if let Err(err) = sink.flush().await {
            info!(error = %err, exported = rows, "export sink closed");
            break ExportStop::SinkClosed;
        }
        if page.len() < requested {
            break ExportStop::Exhausted;
        }
    };

    if stop == ExportStop::Deadline {
        info!(exported = rows, "export stopped at deadline");
    }
    ExportSummary { rows, stop }
}
