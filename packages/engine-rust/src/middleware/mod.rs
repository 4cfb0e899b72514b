//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`dispatch`]: Innermost service handing contexts to the engine
//! - [`deadline`]: Per-message deadline enforcement
//! - [`metrics`]: Dispatch timing and counting
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes all layers into a single service stack

use std::future::Future;
use std::pin::Pin;

use crate::operation::{DispatchError, DispatchReport};

pub mod deadline;
pub mod dispatch;
pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use deadline::DeadlineLayer;
pub use dispatch::EngineService;
pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_dispatch_pipeline;

/// Boxed future returned by every service of the pipeline.
pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<DispatchReport, DispatchError>> + Send>>;
