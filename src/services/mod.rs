//! Crawl services: keyword processing, the verification gate and the scheduler.
//!
//! Services hold no global state; everything they share is passed in by the
//! caller (see [`crate::context::CrawlContext`]).

pub mod crawl;
pub mod keyword;
pub mod shutdown;
pub mod verify_gate;

pub use crawl::{CrawlEvent, CrawlScheduler, CrawlSummary, SchedulerConfig, StopReason};
pub use keyword::{KeywordProcessor, ProcessorConfig};
pub use shutdown::ShutdownSignal;
pub use verify_gate::{
    ChallengeResolver, ChallengeState, GateRegistry, GateReport, GateSettings, GateState,
    PlatformResolver, ResolverError, SurfaceSelector, VerifyGate,
};
