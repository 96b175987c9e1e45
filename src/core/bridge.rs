//! Streaming bridge between an incremental producer and an incremental consumer.
//!
//! ```text
//!   StreamSource ──write──▶ [duplex buffer, bounded] ──read──▶ StreamSink
//!        │                                                       │
//!        └──────── stop token (cancelled by the first failure) ──┘
//! ```
//!
//! Each stage runs in its own task and reports through its own `JoinHandle`.
//! A failing stage claims the first-failure latch, cancels the shared stop
//! token, and only then releases its end of the channel, so the peer always
//! wakes up: either on the stop token, on EOF, or on a broken pipe.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use super::{
    error::{BridgeError, PreconditionError, StreamError},
    traits::{StreamSink, StreamSource},
    types::CollectResult,
};
use crate::config::distribution::DistributionConfig;

/// Which end of the bridge a status belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSide {
    Source,
    Sink,
}

impl StageSide {
    fn code(self) -> u8 {
        match self {
            StageSide::Source => 1,
            StageSide::Sink => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StageSide::Source),
            2 => Some(StageSide::Sink),
            _ => None,
        }
    }
}

impl fmt::Display for StageSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageSide::Source => write!(f, "source"),
            StageSide::Sink => write!(f, "sink"),
        }
    }
}

/// Terminal status of one stage.
#[derive(Debug)]
enum StageStatus {
    Completed,
    Failed(StreamError),
    /// Stopped because the peer failed or the bridge was cancelled.
    Stopped,
}

impl StageStatus {
    fn from_join(joined: Result<StageStatus, JoinError>) -> Self {
        joined.unwrap_or_else(|err| StageStatus::Failed(StreamError::Panicked(err.to_string())))
    }

    fn is_stopped(&self) -> bool {
        matches!(self, StageStatus::Stopped)
    }

    fn into_error(self, side: StageSide) -> Option<BridgeError> {
        match (self, side) {
            (StageStatus::Failed(err), StageSide::Source) => Some(BridgeError::Source(err)),
            (StageStatus::Failed(err), StageSide::Sink) => Some(BridgeError::Sink(err)),
            _ => None,
        }
    }
}

/// Records which stage failed first.
#[derive(Debug, Default)]
struct FailureLatch(AtomicU8);

impl FailureLatch {
    /// Returns true if `side` is the first stage to fail.
    fn claim(&self, side: StageSide) -> bool {
        self.0
            .compare_exchange(0, side.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn first(&self) -> Option<StageSide> {
        StageSide::from_code(self.0.load(Ordering::Acquire))
    }
}

/// Cancels the stop token when dropped while armed, including on panic.
struct StageGuard<'a> {
    side: StageSide,
    stop: &'a CancellationToken,
    latch: &'a FailureLatch,
    armed: bool,
}

impl StageGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.latch.claim(self.side);
            self.stop.cancel();
        }
    }
}

/// Reconciled result of a bridge run.
///
/// `error()` is the first-observed failure. When both stages failed, the
/// other failure is kept in `secondary()` for diagnostics.
#[derive(Debug, Default)]
pub struct BridgeOutcome {
    primary: Option<BridgeError>,
    secondary: Option<BridgeError>,
}

impl BridgeOutcome {
    pub fn is_success(&self) -> bool {
        self.primary.is_none()
    }

    pub fn error(&self) -> Option<&BridgeError> {
        self.primary.as_ref()
    }

    pub fn secondary(&self) -> Option<&BridgeError> {
        self.secondary.as_ref()
    }

    /// Side of the first-observed failure, if a stage failed.
    pub fn failed_side(&self) -> Option<StageSide> {
        match self.primary {
            Some(BridgeError::Source(_)) => Some(StageSide::Source),
            Some(BridgeError::Sink(_)) => Some(StageSide::Sink),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<(), BridgeError> {
        match self.primary {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Connects a `StreamSource` to a `StreamSink` through a bounded in-memory
/// byte channel.
#[derive(Debug, Clone)]
pub struct StreamBridge {
    buffer_size: usize,
    cancel: CancellationToken,
}

impl StreamBridge {
    /// Creates a bridge whose channel buffers at most `buffer_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `PreconditionError::InvalidBufferSize` if `buffer_size` is zero.
    pub fn new(buffer_size: usize) -> CollectResult<Self> {
        if buffer_size == 0 {
            return Err(PreconditionError::InvalidBufferSize(buffer_size));
        }
        Ok(Self {
            buffer_size,
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_config(config: &DistributionConfig) -> CollectResult<Self> {
        Self::new(config.buffer_size)
    }

    /// Stops both stages when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Runs `source` and `sink` concurrently and waits for both to finish.
    pub async fn bridge<S, K>(&self, mut source: S, mut sink: K) -> BridgeOutcome
    where
        S: StreamSource,
        K: StreamSink,
    {
        let (mut writer, mut reader) = tokio::io::duplex(self.buffer_size);
        let stop = self.cancel.child_token();
        let latch = Arc::new(FailureLatch::default());

        let source_task = {
            let stop = stop.clone();
            let latch = latch.clone();
            tokio::spawn(
                async move {
                    let status =
                        drive(StageSide::Source, &stop, &latch, source.run(&mut writer)).await;
                    // Closing after the latch is claimed; the sink sees EOF.
                    drop(writer);
                    status
                }
                .in_current_span(),
            )
        };

        let sink_task = {
            let stop = stop.clone();
            let latch = latch.clone();
            tokio::spawn(
                async move {
                    let status =
                        drive(StageSide::Sink, &stop, &latch, sink.run(&mut reader)).await;
                    // Closing after the latch is claimed; pending writes fail with a broken pipe.
                    drop(reader);
                    status
                }
                .in_current_span(),
            )
        };

        let (source_joined, sink_joined) = tokio::join!(source_task, sink_task);
        let outcome = reconcile(
            StageStatus::from_join(source_joined),
            StageStatus::from_join(sink_joined),
            latch.first(),
            self.cancel.is_cancelled(),
        );

        debug!(
            "Stream bridge finished (success: {}, first failure: {:?})",
            outcome.is_success(),
            latch.first()
        );
        outcome
    }
}

/// Folds both stage statuses into one outcome. `first` is the side that
/// claimed the failure latch; `cancelled` is the state of the bridge's
/// external token.
fn reconcile(
    source_status: StageStatus,
    sink_status: StageStatus,
    first: Option<StageSide>,
    cancelled: bool,
) -> BridgeOutcome {
    let stopped = source_status.is_stopped() || sink_status.is_stopped();

    match (
        source_status.into_error(StageSide::Source),
        sink_status.into_error(StageSide::Sink),
    ) {
        (None, None) if stopped && cancelled => BridgeOutcome {
            primary: Some(BridgeError::Cancelled),
            secondary: None,
        },
        (None, None) => BridgeOutcome::default(),
        (Some(err), None) | (None, Some(err)) => BridgeOutcome {
            primary: Some(err),
            secondary: None,
        },
        (Some(source_err), Some(sink_err)) => {
            let (primary, secondary) = match first {
                Some(StageSide::Sink) => (sink_err, source_err),
                _ => (source_err, sink_err),
            };
            warn!("Both bridge stages failed; also observed: {}", secondary);
            BridgeOutcome {
                primary: Some(primary),
                secondary: Some(secondary),
            }
        }
    }
}

/// Runs one stage until it finishes or the stop token fires.
async fn drive<F>(
    side: StageSide,
    stop: &CancellationToken,
    latch: &FailureLatch,
    stage: F,
) -> StageStatus
where
    F: Future<Output = Result<(), StreamError>>,
{
    let guard = StageGuard {
        side,
        stop,
        latch,
        armed: true,
    };

    let status = tokio::select! {
        biased;
        _ = stop.cancelled() => StageStatus::Stopped,
        result = stage => match result {
            Ok(()) => StageStatus::Completed,
            Err(err) => StageStatus::Failed(err),
        },
    };

    match &status {
        StageStatus::Failed(err) => {
            warn!("Stream {} stage failed: {}", side, err);
            // Dropping the armed guard claims the latch and stops the peer.
            drop(guard);
        }
        StageStatus::Completed => {
            debug!("Stream {} stage completed", side);
            guard.disarm();
        }
        StageStatus::Stopped => {
            debug!("Stream {} stage stopped", side);
            guard.disarm();
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        time::{sleep, timeout},
    };
    use tracing_test::traced_test;

    use super::*;

    const DEADLINE: Duration = Duration::from_secs(5);

    /// Writes `total` bytes of a repeating pattern in `chunk`-sized writes,
    /// optionally failing after `fail_after` bytes. `total = None` never ends.
    struct PatternSource {
        total: Option<usize>,
        chunk: usize,
        fail_after: Option<usize>,
        written: Arc<AtomicUsize>,
        read: Arc<AtomicUsize>,
        max_ahead: Arc<AtomicUsize>,
    }

    impl PatternSource {
        fn new(total: Option<usize>, chunk: usize) -> Self {
            Self {
                total,
                chunk,
                fail_after: None,
                written: Arc::default(),
                read: Arc::default(),
                max_ahead: Arc::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamSource for PatternSource {
        async fn run(
            &mut self,
            out: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<(), StreamError> {
            let mut offset = 0usize;
            loop {
                if self.fail_after.is_some_and(|limit| offset >= limit) {
                    return Err(StreamError::Other("upstream store unreadable".into()));
                }
                let len = match self.total {
                    Some(total) if offset >= total => return Ok(()),
                    Some(total) => self.chunk.min(total - offset),
                    None => self.chunk,
                };
                let buf: Vec<u8> = (offset..offset + len).map(|i| (i % 251) as u8).collect();
                out.write_all(&buf).await?;
                offset += len;
                self.written.store(offset, Ordering::SeqCst);
                let ahead = offset.saturating_sub(self.read.load(Ordering::SeqCst));
                self.max_ahead.fetch_max(ahead, Ordering::SeqCst);
            }
        }
    }

    /// Reads in `chunk`-sized reads, checks the pattern order, and optionally
    /// fails after `fail_after` bytes.
    struct CheckingSink {
        chunk: usize,
        delay: Duration,
        fail_after: Option<usize>,
        read: Arc<AtomicUsize>,
    }

    impl CheckingSink {
        fn new(chunk: usize, read: Arc<AtomicUsize>) -> Self {
            Self {
                chunk,
                delay: Duration::ZERO,
                fail_after: None,
                read,
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamSink for CheckingSink {
        async fn run(
            &mut self,
            input: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<(), StreamError> {
            let mut buf = vec![0u8; self.chunk];
            let mut offset = 0usize;
            loop {
                if self.fail_after.is_some_and(|limit| offset >= limit) {
                    return Err(StreamError::Other("cannot decode record".into()));
                }
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                for (i, byte) in buf[..n].iter().enumerate() {
                    if *byte != ((offset + i) % 251) as u8 {
                        return Err(StreamError::Other(format!("out of order at {}", offset + i)));
                    }
                }
                offset += n;
                self.read.store(offset, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    sleep(self.delay).await;
                }
            }
        }
    }

    /// A sink that never reads and never returns on its own.
    struct StuckSink;

    #[async_trait::async_trait]
    impl StreamSink for StuckSink {
        async fn run(
            &mut self,
            _input: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<(), StreamError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl StreamSource for FailingSource {
        async fn run(
            &mut self,
            _out: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<(), StreamError> {
            Err(StreamError::Other("source broke".into()))
        }
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl StreamSink for FailingSink {
        async fn run(
            &mut self,
            _input: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<(), StreamError> {
            Err(StreamError::Other("sink broke".into()))
        }
    }

    struct PanickingSink;

    #[async_trait::async_trait]
    impl StreamSink for PanickingSink {
        async fn run(
            &mut self,
            _input: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<(), StreamError> {
            panic!("reducer bug");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_every_byte_in_order() {
        let source = PatternSource::new(Some(200_000), 1000);
        let read = Arc::new(AtomicUsize::new(0));
        let sink = CheckingSink::new(333, read.clone());
        let bridge = StreamBridge::new(1024).unwrap();

        let outcome = timeout(DEADLINE, bridge.bridge(source, sink)).await.unwrap();

        assert!(outcome.is_success(), "{:?}", outcome.error());
        assert_eq!(read.load(Ordering::SeqCst), 200_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_sink_throttles_the_source() {
        let read = Arc::new(AtomicUsize::new(0));
        let mut source = PatternSource::new(Some(4096), 32);
        source.read = read.clone();
        let max_ahead = source.max_ahead.clone();
        let mut sink = CheckingSink::new(16, read.clone());
        sink.delay = Duration::from_micros(500);
        let bridge = StreamBridge::new(64).unwrap();

        let outcome = timeout(DEADLINE, bridge.bridge(source, sink)).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(read.load(Ordering::SeqCst), 4096);
        // Channel capacity plus one unacknowledged sink read.
        let ahead = max_ahead.load(Ordering::SeqCst);
        assert!(ahead <= 64 + 16, "producer ran {} bytes ahead", ahead);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn source_failure_is_reported_and_sink_terminates() {
        let read = Arc::new(AtomicUsize::new(0));
        let mut source = PatternSource::new(None, 128);
        source.fail_after = Some(1024);
        let sink = CheckingSink::new(64, read);
        let bridge = StreamBridge::new(256).unwrap();

        let outcome = timeout(DEADLINE, bridge.bridge(source, sink)).await.unwrap();

        assert_eq!(outcome.failed_side(), Some(StageSide::Source));
        assert!(outcome.secondary().is_none());
        assert!(outcome
            .error()
            .unwrap()
            .to_string()
            .contains("upstream store unreadable"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn source_failure_stops_a_sink_that_never_reads() {
        let bridge = StreamBridge::new(16).unwrap();

        let outcome = timeout(DEADLINE, bridge.bridge(FailingSource, StuckSink))
            .await
            .unwrap();

        assert_eq!(outcome.failed_side(), Some(StageSide::Source));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sink_failure_unblocks_an_endless_source() {
        let read = Arc::new(AtomicUsize::new(0));
        let source = PatternSource::new(None, 64);
        let mut sink = CheckingSink::new(32, read);
        sink.fail_after = Some(512);
        let bridge = StreamBridge::new(128).unwrap();

        let outcome = timeout(DEADLINE, bridge.bridge(source, sink)).await.unwrap();

        assert_eq!(outcome.failed_side(), Some(StageSide::Sink));
        assert!(matches!(outcome.into_result(), Err(BridgeError::Sink(_))));
    }

    fn failed(reason: &str) -> StageStatus {
        StageStatus::Failed(StreamError::Other(reason.into()))
    }

    #[test]
    #[traced_test]
    fn both_failures_are_ordered_by_the_latch() {
        let outcome = reconcile(
            failed("write refused"),
            failed("bad record"),
            Some(StageSide::Sink),
            false,
        );

        assert_eq!(outcome.failed_side(), Some(StageSide::Sink));
        assert!(matches!(
            outcome.secondary(),
            Some(BridgeError::Source(StreamError::Other(reason))) if reason == "write refused"
        ));
        assert!(logs_contain(
            "Both bridge stages failed; also observed: Stream source failed: write refused"
        ));
    }

    #[test]
    fn source_is_primary_when_no_side_claimed_first() {
        let outcome = reconcile(failed("a"), failed("b"), None, false);

        assert_eq!(outcome.failed_side(), Some(StageSide::Source));
        assert!(matches!(outcome.secondary(), Some(BridgeError::Sink(_))));
    }

    #[test]
    fn stopped_stages_without_failure() {
        let outcome = reconcile(StageStatus::Completed, StageStatus::Stopped, None, true);
        assert!(matches!(outcome.error(), Some(BridgeError::Cancelled)));

        let outcome = reconcile(StageStatus::Completed, StageStatus::Completed, None, true);
        assert!(outcome.is_success());

        let outcome = reconcile(StageStatus::Stopped, failed("gone"), Some(StageSide::Sink), false);
        assert_eq!(outcome.failed_side(), Some(StageSide::Sink));
        assert!(outcome.secondary().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn both_failing_reports_at_least_one() {
        let bridge = StreamBridge::new(16).unwrap();

        let outcome = timeout(DEADLINE, bridge.bridge(FailingSource, FailingSink))
            .await
            .unwrap();

        let side = outcome.failed_side().expect("a failure must be reported");
        if let Some(secondary) = outcome.secondary() {
            let other = match secondary {
                BridgeError::Source(_) => StageSide::Source,
                BridgeError::Sink(_) => StageSide::Sink,
                BridgeError::Cancelled => panic!("unexpected cancellation"),
            };
            assert_ne!(side, other);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_sink_is_reported_as_sink_failure() {
        let source = PatternSource::new(None, 64);
        let bridge = StreamBridge::new(64).unwrap();

        let outcome = timeout(DEADLINE, bridge.bridge(source, PanickingSink))
            .await
            .unwrap();

        // The source may also observe the broken pipe before the stop token.
        let panicked = |err: Option<&BridgeError>| {
            matches!(err, Some(BridgeError::Sink(StreamError::Panicked(_))))
        };
        assert!(panicked(outcome.error()) || panicked(outcome.secondary()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_cancellation_stops_both_stages() {
        let cancel = CancellationToken::new();
        let source = PatternSource::new(None, 64);
        let bridge = StreamBridge::new(64)
            .unwrap()
            .with_cancellation(cancel.clone());

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let outcome = timeout(DEADLINE, bridge.bridge(source, StuckSink))
            .await
            .unwrap();

        assert!(matches!(outcome.error(), Some(BridgeError::Cancelled)));
    }

    #[test]
    fn zero_buffer_is_rejected() {
        assert!(matches!(
            StreamBridge::new(0),
            Err(PreconditionError::InvalidBufferSize(0))
        ));
    }

    #[test]
    fn latch_keeps_the_first_claim() {
        let latch = FailureLatch::default();
        assert_eq!(latch.first(), None);
        assert!(latch.claim(StageSide::Sink));
        assert!(!latch.claim(StageSide::Source));
        assert_eq!(latch.first(), Some(StageSide::Sink));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn stage_failures_are_logged() {
        let bridge = StreamBridge::new(16).unwrap();

        bridge.bridge(FailingSource, StuckSink).await;

        assert!(logs_contain("Stream source stage failed: source broke"));
    }
}
