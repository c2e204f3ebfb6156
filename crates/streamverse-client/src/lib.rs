//! StreamVerse streaming client.
//!
//! Plays an asset chunk by chunk, paying for each one as the node asks.
//! [`session::StreamSession`] drives the loop over three seams:
//! [`source::ChunkSource`] (usually [`source::HttpChunkSource`]),
//! [`wallet::Wallet`] and [`sink::PlaybackSink`].

pub mod session;
pub mod sink;
pub mod source;
pub mod wallet;

pub use session::{
    ChunkPhase, RetryPolicy, SessionControl, SessionOutcome, SessionState, StopReason,
    StreamSession,
};
pub use sink::{FileSink, MemorySink, PlaybackSink, SinkError};
pub use source::{ChunkPayload, ChunkSource, FetchOutcome, HttpChunkSource};
pub use streamverse_core::{PlaybackStatus, StreamError};
pub use wallet::{Authorization, VoucherWallet, Wallet, WalletError};
