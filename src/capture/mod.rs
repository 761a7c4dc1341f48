//! Capture sources that feed raw exchanges into a recording session
//!
//! A source is opened once per session and delivers completed
//! request/response pairs through a single-consumer channel. Body reads are
//! deferred: each exchange carries boxed futures the session awaits while
//! assembling the entry.

mod browser;
mod cdp;

use std::future::Future;

use futures_util::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc;

use crate::headers::Headers;
use crate::Result;

pub use browser::{find_browser, BrowserProcess};
pub use cdp::{CdpCaptureSource, CdpConnection, CdpEvent};

/// Buffer size of the exchange channel between a source and its session
pub const EXCHANGE_CHANNEL_SIZE: usize = 1024;

/// Deferred read of part of an exchange
pub type Deferred<T> = BoxFuture<'static, Result<T>>;

/// Something that can produce exchanges for one session
pub trait CaptureSource: Send {
    /// Start capturing and navigate to `url`
    ///
    /// # Errors
    ///
    /// Returns error if setup or the initial navigation fails
    fn open(
        &mut self,
        url: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<Exchange>>> + Send;

    /// Release everything `open` acquired
    ///
    /// # Errors
    ///
    /// Returns error if the underlying resource could not be released cleanly
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// One request/response pair observed by a capture source
pub struct Exchange {
    /// Request half
    pub request: CapturedRequest,
    /// Response half
    pub response: CapturedResponse,
    /// URL of the page that was active when the response arrived
    pub page_url: String,
    /// Timing reported by the source, if any
    pub timing: Option<Timing>,
}

/// Request as seen by the capture source
pub struct CapturedRequest {
    /// HTTP method
    pub method: String,
    /// Full URL including scheme and host
    pub url: String,
    /// Raw request headers
    pub headers: Headers,
    /// Post data, if any
    pub body: Deferred<Option<String>>,
}

/// Response as seen by the capture source
pub struct CapturedResponse {
    /// HTTP status code
    pub status: u16,
    /// HTTP status text
    pub status_text: String,
    /// Raw response headers
    pub headers: Headers,
    /// Response body text
    pub body: Deferred<String>,
}

/// Request timing in milliseconds on the source's own clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// When the request was sent
    pub request_start_ms: f64,
    /// When the last response byte arrived
    pub response_end_ms: f64,
}

/// Deferred value that is already available
pub fn ready<T: Send + 'static>(value: Result<T>) -> Deferred<T> {
    future::ready(value).boxed()
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("method", &self.request.method)
            .field("url", &self.request.url)
            .field("status", &self.response.status)
            .field("page_url", &self.page_url)
            .finish_non_exhaustive()
    }
}
