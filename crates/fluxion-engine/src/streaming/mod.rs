//! Streaming runtime: sources, sinks, bridges, workers and the executor.
//!
//! ```text
//! source task ──► source bridge ──► workers ──► output bridge ──► writer ──► sink
//!                                       └──────────── concurrent sink ────────┘
//! ```

pub mod bridge;
pub mod context;
pub mod executor;
pub mod metrics;
pub(crate) mod policy;
pub mod sink;
pub mod source;
pub(crate) mod worker;

pub use bridge::{bridge, BridgeClosed, BridgeMode, BridgeReceiver, BridgeSender};
pub use context::{RunState, StreamingContext, StreamingContextBuilder};
pub use executor::StreamingExecutor;
pub use metrics::{MetricsRegistry, StageCounters};
pub use sink::{CallbackSink, CollectSink, StreamingSink};
pub use source::{ChannelSource, IterSource, SourceEvent, StreamingSource};
