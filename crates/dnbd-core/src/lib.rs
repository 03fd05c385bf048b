//! `dnbd-core`: the client/server-shared core of a distributed, read-only
//! multicast network block device (see the workspace root's `DESIGN.md` for
//! the grounding ledger).
//!
//! No CLI parsing, daemonization, or host block-layer integration lives
//! here — those are the binaries' job (`dnbd-client`, `dnbd-server`).

pub mod cache;
pub mod host;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod server_table;
pub mod socket;

pub use cache::{Cache, CacheState, CacheStats};
pub use host::{BlockSource, FixedRangeSource, RequestRecord, Segment};
pub use pipeline::{BindOptions, ClientPipeline, PipelineState, TimeoutBoundsMs};
pub use protocol::{Op, ReplyHeader, ReplyInit, Request};
pub use queue::RequestQueue;
pub use server::ServerHandler;
pub use server_table::{ServerRecord, ServerState, ServerTable};
