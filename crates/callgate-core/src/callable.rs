//! Callable data model
//!
//! A [`Callable`] is an opaque unit of behaviour the bridge can invoke. Its
//! body fixes the calling convention; its declared signature and
//! declaration-site namespace feed signature resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::resource::{AsyncResource, BlockingResource};
use crate::signature::{Namespace, Signature};
use callgate_error::CallableError;

/// A plain blocking function
pub type BlockingFn = dyn Fn(Arguments) -> Result<Value, CallableError> + Send + Sync;

/// A plain asynchronous function
pub type AsyncFn = dyn Fn(Arguments) -> BoxFuture<'static, Result<Value, CallableError>> + Send + Sync;

/// Factory for a two-phase resource whose steps block
pub type BlockingResourceFactory = dyn Fn(Arguments) -> Box<dyn BlockingResource> + Send + Sync;

/// Factory for a two-phase resource whose steps are asynchronous
pub type AsyncResourceFactory = dyn Fn(Arguments) -> Box<dyn AsyncResource> + Send + Sync;

//-----------------------------------------------------------------------------
// Arguments
//-----------------------------------------------------------------------------

/// Positional and keyword arguments for one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            args: args.into_iter().collect(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Add a keyword argument; a later value for the same key replaces the
    /// earlier one.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

//-----------------------------------------------------------------------------
// Callable
//-----------------------------------------------------------------------------

/// The calling convention of a callable
#[derive(Clone)]
pub enum Body {
    Blocking(Arc<BlockingFn>),
    Async(Arc<AsyncFn>),
    BlockingGenerator(Arc<BlockingResourceFactory>),
    AsyncGenerator(Arc<AsyncResourceFactory>),
    /// A wrapper that forwards every call to another callable
    Forward(Arc<Callable>),
}

impl Body {
    fn label(&self) -> &'static str {
        match self {
            Body::Blocking(_) => "blocking",
            Body::Async(_) => "async",
            Body::BlockingGenerator(_) => "blocking-generator",
            Body::AsyncGenerator(_) => "async-generator",
            Body::Forward(_) => "forward",
        }
    }
}

/// A named callable with an optional declared signature
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    signature: Option<Arc<Signature>>,
    globals: Arc<Namespace>,
    body: Body,
}

impl Callable {
    fn from_body(name: &str, body: Body) -> Self {
        Self {
            name: Arc::from(name),
            signature: None,
            globals: Arc::new(Namespace::new()),
            body,
        }
    }

    /// A plain blocking function
    pub fn blocking<F>(name: &str, f: F) -> Self
    where
        F: Fn(Arguments) -> Result<Value, CallableError> + Send + Sync + 'static,
    {
        Self::from_body(name, Body::Blocking(Arc::new(f)))
    }

    /// A plain asynchronous function
    pub fn asynchronous<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallableError>> + Send + 'static,
    {
        Self::from_body(name, Body::Async(Arc::new(move |args| f(args).boxed())))
    }

    /// A resource factory whose enter and exit steps block
    pub fn blocking_generator<F, R>(name: &str, factory: F) -> Self
    where
        F: Fn(Arguments) -> R + Send + Sync + 'static,
        R: BlockingResource + 'static,
    {
        Self::from_body(
            name,
            Body::BlockingGenerator(Arc::new(move |args| {
                Box::new(factory(args)) as Box<dyn BlockingResource>
            })),
        )
    }

    /// A resource factory whose enter and exit steps are asynchronous
    pub fn async_generator<F, R>(name: &str, factory: F) -> Self
    where
        F: Fn(Arguments) -> R + Send + Sync + 'static,
        R: AsyncResource + 'static,
    {
        Self::from_body(
            name,
            Body::AsyncGenerator(Arc::new(move |args| Box::new(factory(args)) as Box<dyn AsyncResource>)),
        )
    }

    /// A wrapper that forwards to `inner`. The wrapper has no signature or
    /// globals of its own unless given them.
    pub fn wrap(name: &str, inner: Callable) -> Self {
        Self::from_body(name, Body::Forward(Arc::new(inner)))
    }

    /// Attach a declared signature
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(Arc::new(signature));
        self
    }

    /// Attach the declaration-site namespace
    pub fn with_globals(mut self, globals: Namespace) -> Self {
        self.globals = Arc::new(globals);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    /// The signature declared on this callable itself
    pub fn declared_signature(&self) -> Option<&Signature> {
        self.signature.as_deref()
    }

    /// The effective signature: this callable's own, or else the first one
    /// declared along the chain of wrapped callables.
    pub fn signature(&self) -> Option<&Signature> {
        let mut current = self;
        loop {
            if let Some(signature) = current.declared_signature() {
                return Some(signature);
            }
            current = current.wrapped()?;
        }
    }

    /// The callable this one forwards to, if it is a wrapper
    pub fn wrapped(&self) -> Option<&Callable> {
        match &self.body {
            Body::Forward(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }

    /// Follow the whole chain of wrappers to the innermost implementation
    pub fn innermost(&self) -> &Callable {
        let mut current = self;
        while let Some(inner) = current.wrapped() {
            current = inner;
        }
        current
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("body", &self.body.label())
            .field("signature", &self.signature)
            .finish()
    }
}
