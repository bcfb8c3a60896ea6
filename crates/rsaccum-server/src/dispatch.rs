//! Outbound callback dispatcher.
//!
//! Serializes an ordered BodyItem sequence as a JSON array and POSTs it to
//! the producer-supplied callback URL. The timeout is long (5 minutes) to
//! accommodate slow downstream processors; retry policy belongs to the
//! callers that want one.

use std::time::Duration;

use tracing::debug;

use rsaccum_domain::BodyItem;

use crate::error::{ServerError, ServerResult};

/// Per-dispatch timeout.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Ceiling on how much of an error response body is carried in the error.
const MAX_ERROR_BODY_LEN: usize = 512;

/// Callback HTTP client. Cheap to clone; the underlying reqwest client pools
/// connections.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    client: reqwest::Client,
}

impl Dispatcher {
    /// Creates a dispatcher with a fresh connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// POSTs `items` as a JSON array to `url`.
    ///
    /// 2xx is success; any other status becomes `DispatchRejected` carrying
    /// the status and a truncated response body; transport failures and
    /// timeouts become `DispatchTransport`.
    pub async fn dispatch(&self, url: &str, items: &[BodyItem]) -> ServerResult<()> {
        let response = self
            .client
            .post(url)
            .timeout(DISPATCH_TIMEOUT)
            .json(items)
            .send()
            .await
            .map_err(ServerError::DispatchTransport)?;

        let status = response.status();
        if status.is_success() {
            debug!(%url, items = items.len(), "callback accepted payload");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ServerError::DispatchRejected {
            status: status.as_u16(),
            body: truncate_utf8(body, MAX_ERROR_BODY_LEN),
        })
    }
}

/// Truncates to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_utf8("short".to_string(), 512), "short");
        assert_eq!(truncate_utf8("abcdef".to_string(), 3), "abc");
        // Multi-byte character straddling the cut is dropped whole.
        assert_eq!(truncate_utf8("ab\u{00e9}cd".to_string(), 3), "ab");
    }
}
