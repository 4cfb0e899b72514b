//! soapflow engine: service deployment, message dispatch with fault
//! handling, client calls with asynchronous completion, and the tower
//! dispatch pipeline.

pub mod client;
pub mod config;
pub mod deployment;
pub mod engine;
pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod operation;
pub mod registry;

pub use config::EngineConfig;
pub use deployment::{DeploymentBuilder, Flows, HandlerSpec, ServiceChains, ServiceSpec};
pub use engine::DispatchEngine;
pub use middleware::build_dispatch_pipeline;
pub use operation::{DeployError, DispatchError, DispatchOutcome, DispatchReport, DEADLINE_PROPERTY};
pub use registry::{DeployedService, ServiceRegistry};
