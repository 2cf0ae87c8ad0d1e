// Callgate Core Library
//
// Uniform invocation of blocking, asynchronous and generator-style callables
// from an async runtime, scoped release of the resources they open, and
// resolution of their declared signatures.

// =================================================================
// Invocation
// =================================================================

// Callable Model
// Callables, their calling conventions and invocation arguments
pub mod callable;

// Shape Classification
// Decides the calling convention of a callable, looking through one wrapper
pub mod shape;

// Worker Offload
// Bounded blocking worker segments and the process-wide offloader
pub mod offload;

// Unified Invocation
pub mod invoke;

// Resource Lifecycle
// Two-phase resources, exit scopes and the threaded resource adapter
pub mod resource;

// Signature Resolution
// Annotation model, deferred reference parsing and binding frames
pub mod signature;

// Stream Helpers
pub mod stream;

// =================================================================
// Ambient
// =================================================================

pub mod config;
pub mod tracing;
pub mod test_logging;

pub use callable::{Arguments, Body, Callable};
pub use config::{BridgeConfig, ConfigError, OffloadConfig, QueuePolicy};
pub use invoke::{invoke, run_async, Invoker};
pub use offload::{run_offloaded, Offloader, PoolSegment};
pub use resource::{
    open_resource, open_resource_blocking, scoped, AsyncFnResource, AsyncResource, BlockingExitScope,
    BlockingResource, ExitOutcome, ExitScope, FnResource,
};
pub use shape::{classify, is_async_callable, is_async_generator_callable, is_generator_callable, Shape};
pub use signature::{
    enter_frame, resolve_signature, resolve_signature_with, Annotation, Namespace, Parameter, ParameterKind, Signature,
    TypeExpr,
};
pub use stream::async_map;

pub use callgate_error::{CallableError, InvokeError, InvokeResult, Retryable};
