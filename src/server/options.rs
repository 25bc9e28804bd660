use std::time::Duration;

use crate::MAX_HEAD_LENGTH;

/// The supervisor never ticks faster than this.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Configure the server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Time allowed to receive a whole request. Defaults to 60s.
    pub(crate) request_timeout: Option<Duration>,
    /// Time allowed between handing out a request and the first response
    /// byte. Defaults to 60s.
    pub(crate) response_timeout: Option<Duration>,
    /// Time an idle connection is kept open. Defaults to 5s.
    pub(crate) keep_alive_timeout: Option<Duration>,
    /// Whether connections may persist across requests. Defaults to true.
    pub(crate) keep_alive: bool,
    /// Largest accepted request body, in bytes.
    pub(crate) request_max_size: u64,
    /// Largest accepted request head, in bytes.
    pub(crate) max_head_length: usize,
    /// Chunks a streaming body may buffer before reads pause.
    pub(crate) stream_capacity: usize,
    /// Whether completed responses are logged.
    pub(crate) access_log: bool,
    /// Size of each transport read.
    pub(crate) read_buffer_size: usize,
    /// Overrides the derived supervisor tick.
    pub(crate) check_interval: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(60)),
            response_timeout: Some(Duration::from_secs(60)),
            keep_alive_timeout: Some(Duration::from_secs(5)),
            keep_alive: true,
            request_max_size: 100_000_000,
            max_head_length: MAX_HEAD_LENGTH,
            stream_capacity: 16,
            access_log: true,
            read_buffer_size: 8 * 1024,
            check_interval: None,
        }
    }
}

impl ServerOptions {
    /// Create options with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request receive timeout. `None` disables it.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the response produce timeout. `None` disables it.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the keep-alive idle timeout. `None` disables it.
    pub fn with_keep_alive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Allow or forbid persistent connections.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the largest accepted request body.
    pub fn with_request_max_size(mut self, bytes: u64) -> Self {
        self.request_max_size = bytes;
        self
    }

    /// Set the largest accepted request head.
    pub fn with_max_head_length(mut self, bytes: usize) -> Self {
        self.max_head_length = bytes;
        self
    }

    /// Set how many chunks a streaming body buffers. At least one.
    pub fn with_stream_capacity(mut self, chunks: usize) -> Self {
        self.stream_capacity = chunks.max(1);
        self
    }

    /// Enable or disable the access log.
    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    /// Set the size of each transport read. At least one byte.
    pub fn with_read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes.max(1);
        self
    }

    /// Check deadlines at this interval instead of the derived one.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    /// How often armed deadlines are checked.
    ///
    /// A quarter of the shortest timeout, but no faster than every 50ms.
    pub fn check_interval(&self) -> Duration {
        if let Some(interval) = self.check_interval {
            return interval;
        }
        [
            self.request_timeout,
            self.response_timeout,
            self.keep_alive_timeout,
        ]
        .iter()
        .flatten()
        .min()
        .map(|shortest| (*shortest / 4).max(MIN_CHECK_INTERVAL))
        .unwrap_or(Duration::from_secs(1))
    }

    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub(crate) fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    pub(crate) fn keep_alive_timeout(&self) -> Option<Duration> {
        self.keep_alive_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ServerOptions::default();
        assert_eq!(opts.request_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(opts.keep_alive_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(opts.request_max_size, 100_000_000);
        assert_eq!(opts.check_interval(), Duration::from_millis(1250));
    }

    #[test]
    fn check_interval_is_bounded() {
        let opts = ServerOptions::new()
            .with_request_timeout(Some(Duration::from_millis(20)))
            .with_response_timeout(None);
        assert_eq!(opts.check_interval(), MIN_CHECK_INTERVAL);

        let opts = ServerOptions::new()
            .with_request_timeout(None)
            .with_response_timeout(None)
            .with_keep_alive_timeout(None);
        assert_eq!(opts.check_interval(), Duration::from_secs(1));

        let opts = opts.with_check_interval(Duration::from_millis(5));
        assert_eq!(opts.check_interval(), Duration::from_millis(5));
    }
}
