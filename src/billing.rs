//! Usage settlement.
//!
//! Quota and pricing arithmetic live outside the relay. The relay only hands
//! the final [`Usage`] of each request to a [`UsageSettler`], exactly once,
//! including for streams the client abandoned halfway.

use std::sync::Arc;

use tracing::debug;

use crate::error::RelayError;
use crate::logging::SharedLogger;
use crate::relay::RelayInfo;
use crate::translate::Usage;

/// Receives the usage of every relayed request.
pub trait UsageSettler: Send + Sync {
    /// `complete` is false when the response ended early (client disconnect,
    /// upstream error mid-stream).
    fn settle(&self, info: &RelayInfo, status: u16, usage: Usage, complete: bool);
}

/// Default settler: writes a relay record to the request log.
#[derive(Clone)]
pub struct LogSettler {
    logger: SharedLogger,
}

impl LogSettler {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }
}

impl UsageSettler for LogSettler {
    fn settle(&self, info: &RelayInfo, status: u16, usage: Usage, complete: bool) {
        self.logger.relay(&info.record(status, usage, complete));
    }
}

/// Settles on drop unless [`SettleGuard::settle`] ran first.
///
/// Lives inside the stream generator, so dropping the response body on
/// client disconnect still settles the partial usage.
pub struct SettleGuard {
    settler: Arc<dyn UsageSettler>,
    info: RelayInfo,
    status: u16,
    usage: Usage,
    settled: bool,
}

impl SettleGuard {
    pub fn new(settler: Arc<dyn UsageSettler>, info: RelayInfo) -> Self {
        Self {
            settler,
            info,
            status: 200,
            usage: Usage::default(),
            settled: false,
        }
    }

    pub fn info(&self) -> &RelayInfo {
        &self.info
    }

    /// Record the usage observed so far.
    pub fn update(&mut self, usage: Usage) {
        self.usage = usage;
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Record the error that ended the request.
    pub fn fail(&mut self, err: &RelayError) {
        self.status = err.status_code();
        self.info.retryable = err.is_retryable();
    }

    /// Settle the final usage of a completed response.
    pub fn settle(mut self, usage: Usage) {
        self.usage = usage;
        self.settled = true;
        self.settler
            .settle(&self.info, self.status, self.usage.finalized(), true);
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(request_id = %self.info.request_id, "Settling partial usage");
        self.settler
            .settle(&self.info, self.status, self.usage.finalized(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::CanonicalRequest;
    use crate::translate::RelayFormat;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Usage, bool)>>);

    impl UsageSettler for Recorder {
        fn settle(&self, _info: &RelayInfo, _status: u16, usage: Usage, complete: bool) {
            self.0.lock().unwrap().push((usage, complete));
        }
    }

    fn info() -> RelayInfo {
        let req = CanonicalRequest::default();
        RelayInfo {
            request_id: "req_test".to_string(),
            client_format: RelayFormat::Claude,
            upstream_format: RelayFormat::OpenAI,
            chain: crate::translate::ConversionChain::for_pair(RelayFormat::Claude, RelayFormat::OpenAI),
            client_model: req.model.clone(),
            upstream_model: req.model,
            stream: true,
            prompt_estimate: 0,
            started: Instant::now(),
            retryable: false,
        }
    }

    #[test]
    fn test_settle_runs_once() {
        let recorder = Arc::new(Recorder::default());
        let guard = SettleGuard::new(recorder.clone(), info());
        guard.settle(Usage {
            prompt_tokens: 4,
            completion_tokens: 2,
            ..Usage::default()
        });

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1);
        assert_eq!(calls[0].0.total_tokens, 6);
    }

    struct FailureRecorder(Mutex<Vec<(u16, bool)>>);

    impl UsageSettler for FailureRecorder {
        fn settle(&self, info: &RelayInfo, status: u16, _usage: Usage, _complete: bool) {
            self.0.lock().unwrap().push((status, info.record(status, Usage::default(), false).retryable));
        }
    }

    #[test]
    fn test_fail_records_status_and_retry_hint() {
        let recorder = Arc::new(FailureRecorder(Mutex::new(Vec::new())));
        {
            let mut guard = SettleGuard::new(recorder.clone(), info());
            guard.fail(&RelayError::bad_upstream("truncated chunk"));
        }
        {
            let mut guard = SettleGuard::new(recorder.clone(), info());
            guard.fail(&RelayError::upstream_protocol("overloaded_error", "busy"));
        }
        let calls = recorder.0.lock().unwrap();
        assert_eq!(*calls, [(502, true), (502, false)]);
    }

    #[test]
    fn test_drop_settles_partial_usage() {
        let recorder = Arc::new(Recorder::default());
        {
            let mut guard = SettleGuard::new(recorder.clone(), info());
            guard.update(Usage {
                prompt_tokens: 10,
                completion_tokens: 1,
                ..Usage::default()
            });
        }
        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].1);
        assert_eq!(calls[0].0.prompt_tokens, 10);
    }
}
