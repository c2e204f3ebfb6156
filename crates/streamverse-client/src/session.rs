//! Sequential pay-per-chunk playback.
//!
//! A [`StreamSession`] walks an asset from chunk 0 to the last chunk. For
//! each chunk it asks unpaid, pays the challenge, asks again with the
//! proof, and hands the bytes to the sink. Only after the sink accepts a
//! chunk does `next_index` move, so a pause or stop at any point resumes
//! at the first chunk the viewer has not received.
//!
//! Pause and stop are delivered through [`SessionControl`]. Either one
//! aborts an in-flight request; the chunk is asked for again on resume.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use streamverse_core::{AssetInfo, PaymentProof, SettlementReceipt, StreamError};

use crate::sink::PlaybackSink;
use crate::source::{ChunkPayload, ChunkSource, FetchOutcome};
use crate::wallet::Wallet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    /// Request (and possibly payment) in progress.
    Pending,
    /// Handed to the sink.
    Delivered,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Completed,
    Cancelled,
    Failed(StreamError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    RequestingMetadata,
    Streaming { index: u32, phase: ChunkPhase },
    Paused { next_index: u32 },
    Stopped { next_index: u32, reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { chunks: u32 },
    Paused { next_index: u32 },
    Stopped { next_index: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per chunk after a retryable error.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on one chunk request.
    pub request_timeout: Duration,
    /// Refused proofs tolerated per chunk before giving up.
    pub max_payment_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
            max_payment_attempts: 2,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Play,
    Pause,
    Stop,
}

/// Handle for pausing, resuming and stopping a session from elsewhere.
#[derive(Debug, Clone)]
pub struct SessionControl {
    tx: Arc<watch::Sender<Command>>,
}

impl SessionControl {
    pub fn play(&self) {
        self.tx.send_replace(Command::Play);
    }

    pub fn pause(&self) {
        self.tx.send_replace(Command::Pause);
    }

    pub fn stop(&self) {
        self.tx.send_replace(Command::Stop);
    }
}

enum Raced<T> {
    Done(T),
    Interrupted(Command),
}

/// Drive `fut` unless a pause or stop arrives first.
async fn race<T>(cmd: &mut watch::Receiver<Command>, fut: impl Future<Output = T>) -> Raced<T> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            changed = cmd.changed() => {
                if changed.is_err() {
                    return Raced::Done(fut.await);
                }
                let c = *cmd.borrow_and_update();
                if c != Command::Play {
                    return Raced::Interrupted(c);
                }
            }
            out = &mut fut => return Raced::Done(out),
        }
    }
}

/// A chunk that made it through, with what it cost.
struct Fetched {
    payload: ChunkPayload,
    paid: u64,
}

pub struct StreamSession<S, W, K> {
    asset: String,
    source: S,
    wallet: W,
    sink: K,
    policy: RetryPolicy,
    info: Option<AssetInfo>,
    next_index: u32,
    receipts: Vec<(u32, SettlementReceipt)>,
    total_paid: u64,
    state: watch::Sender<SessionState>,
    control: Arc<watch::Sender<Command>>,
}

impl<S, W, K> StreamSession<S, W, K>
where
    S: ChunkSource,
    W: Wallet,
    K: PlaybackSink,
{
    pub fn new(asset: impl Into<String>, source: S, wallet: W, sink: K) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (control, _) = watch::channel(Command::Play);
        Self {
            asset: asset.into(),
            source,
            wallet,
            sink,
            policy: RetryPolicy::default(),
            info: None,
            next_index: 0,
            receipts: Vec::new(),
            total_paid: 0,
            state,
            control: Arc::new(control),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Continue an earlier session's output from `index`.
    pub fn starting_at(mut self, index: u32) -> Self {
        self.next_index = index;
        self
    }

    pub fn control(&self) -> SessionControl {
        SessionControl {
            tx: self.control.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// First chunk not yet delivered to the sink.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn info(&self) -> Option<&AssetInfo> {
        self.info.as_ref()
    }

    pub fn receipts(&self) -> &[(u32, SettlementReceipt)] {
        &self.receipts
    }

    /// Atomic units paid for delivered chunks.
    pub fn total_paid(&self) -> u64 {
        self.total_paid
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Clear a pause or stop and run.
    pub async fn resume(&mut self) -> Result<SessionOutcome, StreamError> {
        self.control.send_replace(Command::Play);
        self.run().await
    }

    /// Stream until the last chunk, a pause or stop, or a failure.
    ///
    /// On failure the session is left `Stopped` with the error and
    /// `next_index` still pointing at the chunk that failed; calling
    /// [`StreamSession::resume`] tries it again.
    pub async fn run(&mut self) -> Result<SessionOutcome, StreamError> {
        let mut cmd = self.control.subscribe();
        let pending = *cmd.borrow_and_update();
        if pending != Command::Play {
            return Ok(self.halt(pending));
        }

        let known = self.info.as_ref().map(|info| info.total_chunks);
        let total = match known {
            Some(total) => total,
            None => {
                self.set_state(SessionState::RequestingMetadata);
                let raced = race(&mut cmd, self.source.info(&self.asset)).await;
                match raced {
                    Raced::Interrupted(c) => return Ok(self.halt(c)),
                    Raced::Done(Err(e)) => return Err(self.fail(e)),
                    Raced::Done(Ok(info)) => {
                        info!(
                            asset = %self.asset,
                            chunks = info.total_chunks,
                            price = info.price_per_chunk,
                            "asset info"
                        );
                        let total = info.total_chunks;
                        self.info = Some(info);
                        total
                    }
                }
            }
        };

        while self.next_index < total {
            let index = self.next_index;
            self.set_state(SessionState::Streaming {
                index,
                phase: ChunkPhase::Pending,
            });

            let fetch = fetch_chunk(
                &self.source,
                &self.wallet,
                &self.policy,
                &self.asset,
                index,
            );
            let raced = race(&mut cmd, fetch).await;
            let fetched = match raced {
                Raced::Interrupted(c) => {
                    debug!(index, "chunk request abandoned");
                    return Ok(self.halt(c));
                }
                Raced::Done(Err(e)) => return Err(self.fail(e)),
                Raced::Done(Ok(f)) => f,
            };

            let receipt = fetched.payload.receipt.clone();
            if let Err(e) = self.sink.append(index, fetched.payload.bytes).await {
                return Err(self.fail(StreamError::Sink(e.to_string())));
            }
            if let Some(receipt) = receipt {
                self.receipts.push((index, receipt));
            }
            self.total_paid += fetched.paid;
            self.next_index = index + 1;
            self.set_state(SessionState::Streaming {
                index,
                phase: ChunkPhase::Delivered,
            });

            if cmd.has_changed().unwrap_or(false) {
                let c = *cmd.borrow_and_update();
                if c != Command::Play {
                    return Ok(self.halt(c));
                }
            }
        }

        if let Err(e) = self.sink.finish().await {
            return Err(self.fail(StreamError::Sink(e.to_string())));
        }
        info!(
            asset = %self.asset,
            chunks = total,
            paid = self.total_paid,
            "stream complete"
        );
        self.set_state(SessionState::Stopped {
            next_index: self.next_index,
            reason: StopReason::Completed,
        });
        Ok(SessionOutcome::Completed { chunks: total })
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn halt(&self, command: Command) -> SessionOutcome {
        let next_index = self.next_index;
        if command == Command::Stop {
            info!(next_index, "stream stopped");
            self.set_state(SessionState::Stopped {
                next_index,
                reason: StopReason::Cancelled,
            });
            SessionOutcome::Stopped { next_index }
        } else {
            info!(next_index, "stream paused");
            self.set_state(SessionState::Paused { next_index });
            SessionOutcome::Paused { next_index }
        }
    }

    fn fail(&self, error: StreamError) -> StreamError {
        warn!(next_index = self.next_index, "stream failed: {error}");
        self.set_state(SessionState::Stopped {
            next_index: self.next_index,
            reason: StopReason::Failed(error.clone()),
        });
        error
    }
}

/// Get one chunk: ask, pay when challenged, retry what is retryable.
///
/// After a transport error the proof is dropped and the next attempt starts
/// unpaid, so a proof the server may already have consumed is never sent
/// twice. After `VerifierUnavailable` the server has released the proof, so
/// it is sent again as is.
async fn fetch_chunk<S: ChunkSource, W: Wallet>(
    source: &S,
    wallet: &W,
    policy: &RetryPolicy,
    asset: &str,
    index: u32,
) -> Result<Fetched, StreamError> {
    let mut proof: Option<(PaymentProof, u64)> = None;
    let mut refusals = 0u32;
    let mut retries = 0u32;

    loop {
        let attempt = tokio::time::timeout(
            policy.request_timeout,
            source.fetch(asset, index, proof.as_ref().map(|(p, _)| p)),
        )
        .await
        .unwrap_or_else(|_| {
            Err(StreamError::TransientNetwork(format!(
                "chunk {index} timed out after {:?}",
                policy.request_timeout
            )))
        });

        let challenge = match attempt {
            Ok(FetchOutcome::Delivered(payload)) => {
                let paid = proof.map(|(_, amount)| amount).unwrap_or(0);
                debug!(index, bytes = payload.bytes.len(), paid, "chunk delivered");
                return Ok(Fetched { payload, paid });
            }
            Ok(FetchOutcome::PaymentRequired(challenge)) if proof.is_none() => challenge,
            Ok(FetchOutcome::PaymentRequired(challenge)) => {
                refusals += 1;
                if refusals >= policy.max_payment_attempts {
                    return Err(StreamError::PaymentRejected(
                        "payment not accepted".into(),
                    ));
                }
                challenge
            }
            Ok(FetchOutcome::Rejected { reason, challenge }) => {
                refusals += 1;
                warn!(index, %reason, refusals, "payment refused");
                if refusals >= policy.max_payment_attempts {
                    return Err(StreamError::PaymentRejected(reason));
                }
                challenge
            }
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                let delay = policy.delay_for(retries);
                retries += 1;
                warn!(index, retries, ?delay, "retrying chunk: {e}");
                if matches!(e, StreamError::TransientNetwork(_)) {
                    proof = None;
                }
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        let auth = wallet
            .authorize(&challenge.accepts)
            .await
            .map_err(|e| StreamError::Wallet(e.to_string()))?;
        debug!(index, amount = auth.amount, "paying for chunk");
        proof = Some((auth.proof, auth.amount));
    }
}
