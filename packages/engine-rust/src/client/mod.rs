//! Client-side invocation: synchronous and callback-based calls over a
//! pluggable transport.

pub mod call;
pub mod callback;
pub mod transport;

pub use call::Call;
pub use callback::{
    callback_fn, AsyncResult, CallError, CallStatus, Callback, FnCallback, PendingCall,
    PendingCalls,
};
pub use transport::{LoopbackTransport, Transport};
