//! `wbstat-http` is an async client for the Wildberries seller statistics API.
//!
//! Every request runs under a per-client concurrency limit and a retry
//! policy with exponential backoff. Paginated reports can be fetched whole
//! or streamed row by row:
//! - [`StatClient::report_detail_by_period`]
//! - [`StatClient::stream_report_detail_by_period`]
//! - [`StatClient::ping`]

mod cache;
mod classify;
mod client;
mod decode;
mod error;
mod executor;
mod gate;
mod options;
mod paginate;
mod request;
mod retry;

pub use cache::ResponseCache;
pub use client::{StatClient, DEFAULT_BASE_URL, PING_PATH};
pub use decode::{decode_rows, Decoded, ItemPath, Row, RowDecoder};
pub use error::{BoxError, ErrorKind, StatError};
pub use gate::{ConcurrencyGate, GatePermit};
pub use options::ClientOptions;
pub use paginate::{
    Cursor, DateParam, PagedEndpoint, Period, ReportQuery, RowStream, RowTransform,
    REPORT_DETAIL_BY_PERIOD_PATH,
};
pub use request::RequestDescriptor;
pub use retry::{RetryObserver, RetryPolicy};

pub type Result<T> = std::result::Result<T, StatError>;
