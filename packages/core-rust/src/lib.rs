//! soapflow core: the handler contract, phase rules, phase resolution and
//! execution chains of the SOAP message pipeline.

pub mod chain;
pub mod context;
pub mod error;
pub mod fault;
pub mod handler;
pub mod phase;
pub mod qname;
pub mod resolver;
pub mod rule;
pub mod traits;
pub mod types;

pub use chain::{ChainFault, ChainOutcome, ChainScope, ExecutionChain, Flow};
pub use context::{HeaderBlock, MessageContext};
pub use error::ResolutionError;
pub use fault::{fault_codes, Fault};
pub use handler::{HandlerDescription, HandlerOptions, OptionValue};
pub use phase::Phase;
pub use qname::QName;
pub use resolver::{phase_names, PhaseOrder, PhaseResolver};
pub use rule::PhaseRule;
pub use traits::{FaultCodeExtractor, Handler, HandlerFlow};
pub use types::{Payload, Value};
