//! Cursor pagination shared by the buffered and streaming modes.
//!
//! Both modes run the same driver; they differ only in the [`PageSource`]
//! that turns one page request into a stream of rows.

use std::{fmt, mem, sync::Arc, time::Duration};

use chrono::{NaiveDate, NaiveDateTime};
use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    decode::{decode_rows, rows_from_slice, ItemPath, Row},
    error::BoxError,
    executor::Executor,
    RequestDescriptor, Result, StatError,
};

/// Path of the realization report endpoint.
pub const REPORT_DETAIL_BY_PERIOD_PATH: &str = "/api/v5/supplier/reportDetailByPeriod";

/// Lazily produced rows; ends after the first error.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// Per-row mapping applied before a row is handed to the caller.
pub type RowTransform = Arc<dyn Fn(Row) -> std::result::Result<Row, BoxError> + Send + Sync>;

/// Report aggregation period.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Weekly,
    Daily,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Daily => "daily",
        }
    }
}

/// Date bound of a report query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DateParam {
    /// Sent as `YYYY-MM-DD`.
    Date(NaiveDate),
    /// Sent as `YYYY-MM-DDTHH:MM:SS`.
    DateTime(NaiveDateTime),
    /// Sent unchanged.
    Raw(String),
}

impl DateParam {
    pub fn format(&self) -> String {
        match self {
            Self::Date(date) => date.format("%Y-%m-%d").to_string(),
            Self::DateTime(datetime) => datetime.format("%Y-%m-%dT%H:%M:%S").to_string(),
            Self::Raw(raw) => raw.clone(),
        }
    }
}

impl From<NaiveDate> for DateParam {
    fn from(date: NaiveDate) -> Self {
        Self::Date(date)
    }
}

impl From<NaiveDateTime> for DateParam {
    fn from(datetime: NaiveDateTime) -> Self {
        Self::DateTime(datetime)
    }
}

impl From<&str> for DateParam {
    fn from(raw: &str) -> Self {
        Self::Raw(raw.to_owned())
    }
}

impl From<String> for DateParam {
    fn from(raw: String) -> Self {
        Self::Raw(raw)
    }
}

/// Opaque pagination token taken from the last row of a page.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cursor {
    Int(i64),
    Text(String),
}

impl Default for Cursor {
    fn default() -> Self {
        Self::Int(0)
    }
}

impl Cursor {
    /// Reads a cursor from a row field; `None` for null, bool or containers.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => Some(
                number
                    .as_i64()
                    .map(Self::Int)
                    .unwrap_or_else(|| Self::Text(number.to_string())),
            ),
            Value::String(text) => Some(Self::Text(text.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Cursor {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A cursor-paginated endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagedEndpoint {
    pub path: String,
    /// Query parameter carrying the cursor.
    pub cursor_param: String,
    /// Row field holding the next cursor.
    pub cursor_field: String,
    /// Where the rows sit in the response body.
    pub item_path: ItemPath,
}

impl PagedEndpoint {
    pub fn new(
        path: impl Into<String>,
        cursor_param: impl Into<String>,
        cursor_field: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            cursor_param: cursor_param.into(),
            cursor_field: cursor_field.into(),
            item_path: ItemPath::root(),
        }
    }

    #[must_use]
    pub fn item_path(mut self, item_path: impl Into<ItemPath>) -> Self {
        self.item_path = item_path.into();
        self
    }

    /// `reportDetailByPeriod`: cursor parameter `rrdid`, row field `rrd_id`.
    pub fn report_detail_by_period() -> Self {
        Self::new(REPORT_DETAIL_BY_PERIOD_PATH, "rrdid", "rrd_id")
    }
}

/// Parameters of a paginated report fetch.
#[derive(Clone)]
pub struct ReportQuery {
    pub date_from: DateParam,
    pub date_to: DateParam,
    /// Rows per page.
    pub limit: u32,
    /// Starting cursor.
    pub cursor: Cursor,
    pub period: Period,
    /// Follow the cursor until the data is exhausted; otherwise fetch one page.
    pub fetch_all: bool,
    /// Per-page timeout, overriding the client default.
    pub timeout: Option<Duration>,
    transform: Option<RowTransform>,
}

impl fmt::Debug for ReportQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportQuery")
            .field("date_from", &self.date_from)
            .field("date_to", &self.date_to)
            .field("limit", &self.limit)
            .field("cursor", &self.cursor)
            .field("period", &self.period)
            .field("fetch_all", &self.fetch_all)
            .field("timeout", &self.timeout)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ReportQuery {
    pub fn new(date_from: impl Into<DateParam>, date_to: impl Into<DateParam>) -> Self {
        Self {
            date_from: date_from.into(),
            date_to: date_to.into(),
            limit: 100_000,
            cursor: Cursor::default(),
            period: Period::default(),
            fetch_all: false,
            timeout: None,
            transform: None,
        }
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn cursor(mut self, cursor: impl Into<Cursor>) -> Self {
        self.cursor = cursor.into();
        self
    }

    #[must_use]
    pub fn period(mut self, period: Period) -> Self {
        self.period = period;
        self
    }

    #[must_use]
    pub fn fetch_all(mut self, fetch_all: bool) -> Self {
        self.fetch_all = fetch_all;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Maps every row before it is returned.
    ///
    /// The cursor is read from the row before the mapping runs, so the
    /// mapping may drop the cursor field.
    #[must_use]
    pub fn transform<F>(self, transform: F) -> Self
    where
        F: Fn(Row) -> Row + Send + Sync + 'static,
    {
        self.try_transform(move |row| Ok::<_, BoxError>(transform(row)))
    }

    /// Like [`ReportQuery::transform`], but a failed mapping aborts the
    /// fetch with a [`StatError::Generic`] error.
    #[must_use]
    pub fn try_transform<F, E>(mut self, transform: F) -> Self
    where
        F: Fn(Row) -> std::result::Result<Row, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let transform: RowTransform =
            Arc::new(move |row: Row| -> std::result::Result<Row, BoxError> {
                transform(row).map_err(Into::into)
            });
        self.transform = Some(transform);
        self
    }

    pub(crate) fn page_request(&self, endpoint: &PagedEndpoint, cursor: &Cursor) -> RequestDescriptor {
        let request = RequestDescriptor::get(endpoint.path.clone())
            .query("dateFrom", self.date_from.format())
            .query("dateTo", self.date_to.format())
            .query("limit", self.limit)
            .query(endpoint.cursor_param.clone(), cursor)
            .query("period", self.period.as_str());
        match self.timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    fn apply(&self, row: Row) -> Result<Row> {
        match &self.transform {
            Some(transform) => transform(row).map_err(StatError::transform),
            None => Ok(row),
        }
    }
}

/// Termination bookkeeping for one paginated fetch.
#[derive(Clone, Debug)]
pub(crate) struct CursorState {
    current: Cursor,
    fetch_all: bool,
    field: String,
    rows_in_page: usize,
    last: Option<Cursor>,
}

impl CursorState {
    pub(crate) fn new(start: Cursor, fetch_all: bool, field: impl Into<String>) -> Self {
        Self {
            current: start,
            fetch_all,
            field: field.into(),
            rows_in_page: 0,
            last: None,
        }
    }

    pub(crate) fn current(&self) -> &Cursor {
        &self.current
    }

    /// Records a raw row of the current page.
    pub(crate) fn observe(&mut self, row: &Row) {
        self.rows_in_page += 1;
        self.last = row.get(&self.field).and_then(Cursor::from_value);
    }

    /// Closes the current page; returns whether another page must be fetched.
    pub(crate) fn finish_page(&mut self) -> bool {
        let rows = mem::take(&mut self.rows_in_page);
        let last = self.last.take();

        if rows == 0 || !self.fetch_all {
            return false;
        }
        match last {
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(field = %self.field, "last row has no cursor, stopping pagination");
                false
            }
            Some(next) if next == self.current => {
                #[cfg(feature = "tracing")]
                tracing::warn!(cursor = %next, "cursor did not advance, stopping pagination");
                false
            }
            Some(next) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(from = %self.current, to = %next, rows, "advancing to next page");
                self.current = next;
                true
            }
        }
    }
}

/// Turns one page request into a stream of raw rows.
pub(crate) trait PageSource: Send + Sync + 'static {
    fn open(&self, request: RequestDescriptor) -> BoxFuture<'static, Result<RowStream>>;
}

/// Reads each page body whole, then decodes it.
pub(crate) struct BufferedPages {
    pub(crate) executor: Executor,
    pub(crate) item_path: ItemPath,
}

impl PageSource for BufferedPages {
    fn open(&self, request: RequestDescriptor) -> BoxFuture<'static, Result<RowStream>> {
        let executor = self.executor.clone();
        let item_path = self.item_path.clone();
        async move {
            let reply = executor.execute(&request).await?;
            if reply.is_empty() {
                return Ok(stream::empty().boxed());
            }
            let body = reply.bytes().await?;
            let rows = rows_from_slice(&body, &item_path)?;
            Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
        }
        .boxed()
    }
}

/// Decodes each page incrementally while its body arrives.
pub(crate) struct StreamedPages {
    pub(crate) executor: Executor,
    pub(crate) item_path: ItemPath,
}

impl PageSource for StreamedPages {
    fn open(&self, request: RequestDescriptor) -> BoxFuture<'static, Result<RowStream>> {
        let executor = self.executor.clone();
        let item_path = self.item_path.clone();
        async move {
            let reply = executor.execute(&request).await?;
            if reply.is_empty() {
                return Ok(stream::empty().boxed());
            }
            Ok(decode_rows(reply.into_byte_stream(), item_path))
        }
        .boxed()
    }
}

/// Applies `transform` to every row; the first failure ends the stream.
pub(crate) fn map_rows(rows: RowStream, transform: RowTransform) -> RowStream {
    stream::try_unfold((rows, transform), map_next).boxed()
}

async fn map_next(
    (mut rows, transform): (RowStream, RowTransform),
) -> Result<Option<(Row, (RowStream, RowTransform))>> {
    match rows.next().await {
        Some(row) => {
            let row = transform(row?).map_err(StatError::transform)?;
            Ok(Some((row, (rows, transform))))
        }
        None => Ok(None),
    }
}

struct Drive<S> {
    source: S,
    endpoint: PagedEndpoint,
    query: ReportQuery,
    cursor: CursorState,
    page: Option<RowStream>,
}

/// Runs the cursor loop over `source`, one page at a time.
pub(crate) fn drive<S: PageSource>(source: S, endpoint: PagedEndpoint, query: ReportQuery) -> RowStream {
    let cursor = CursorState::new(query.cursor.clone(), query.fetch_all, endpoint.cursor_field.clone());
    let state = Drive {
        source,
        endpoint,
        query,
        cursor,
        page: None,
    };
    stream::try_unfold(state, Drive::pull).boxed()
}

impl<S: PageSource> Drive<S> {
    async fn pull(mut self) -> Result<Option<(Row, Self)>> {
        loop {
            if let Some(page) = self.page.as_mut() {
                match page.next().await {
                    Some(row) => {
                        let row = row?;
                        self.cursor.observe(&row);
                        let row = self.query.apply(row)?;
                        return Ok(Some((row, self)));
                    }
                    None => {
                        self.page = None;
                        if !self.cursor.finish_page() {
                            return Ok(None);
                        }
                    }
                }
            }

            let request = self.query.page_request(&self.endpoint, self.cursor.current());
            self.page = Some(self.source.open(request).await?);
        }
    }
}
