// Callable Shape Classification
//
// Decides which calling convention a callable follows. Forwarding wrappers
// are looked through exactly one level.

use std::fmt;
use std::sync::Arc;

use tracing::{error, trace};

use crate::callable::{AsyncFn, AsyncResourceFactory, BlockingFn, BlockingResourceFactory, Body, Callable};
use callgate_error::{InvokeError, InvokeResult};

/// The calling convention of a callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Blocking,
    Asynchronous,
    BlockingGenerator,
    AsynchronousGenerator,
}

impl Shape {
    pub fn is_generator(self) -> bool {
        matches!(self, Shape::BlockingGenerator | Shape::AsynchronousGenerator)
    }

    pub fn is_async(self) -> bool {
        matches!(self, Shape::Asynchronous | Shape::AsynchronousGenerator)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Shape::Blocking => "blocking",
            Shape::Asynchronous => "asynchronous",
            Shape::BlockingGenerator => "blocking generator",
            Shape::AsynchronousGenerator => "asynchronous generator",
        };
        f.write_str(label)
    }
}

/// The implementation a classified callable dispatches to
pub(crate) enum Target<'a> {
    Blocking(&'a Arc<BlockingFn>),
    Async(&'a Arc<AsyncFn>),
    BlockingGenerator(&'a Arc<BlockingResourceFactory>),
    AsyncGenerator(&'a Arc<AsyncResourceFactory>),
}

impl Target<'_> {
    pub(crate) fn shape(&self) -> Shape {
        match self {
            Target::Blocking(_) => Shape::Blocking,
            Target::Async(_) => Shape::Asynchronous,
            Target::BlockingGenerator(_) => Shape::BlockingGenerator,
            Target::AsyncGenerator(_) => Shape::AsynchronousGenerator,
        }
    }
}

fn direct(body: &Body) -> Option<Target<'_>> {
    match body {
        Body::Blocking(f) => Some(Target::Blocking(f)),
        Body::Async(f) => Some(Target::Async(f)),
        Body::BlockingGenerator(f) => Some(Target::BlockingGenerator(f)),
        Body::AsyncGenerator(f) => Some(Target::AsyncGenerator(f)),
        Body::Forward(_) => None,
    }
}

pub(crate) fn target(callable: &Callable) -> InvokeResult<Target<'_>> {
    if let Some(found) = direct(callable.body()) {
        return Ok(found);
    }

    let inner = match callable.wrapped() {
        Some(inner) => inner,
        None => return Err(InvokeError::unclassifiable(callable.name(), "no body")),
    };

    match direct(inner.body()) {
        Some(found) => {
            trace!(callable = callable.name(), inner = inner.name(), "classified through wrapper");
            Ok(found)
        }
        None => {
            error!(
                callable = callable.name(),
                inner = inner.name(),
                "callable wraps another wrapper and cannot be classified"
            );
            Err(InvokeError::unclassifiable(
                callable.name(),
                format!("forwards to wrapper `{}`", inner.name()),
            ))
        }
    }
}

/// Classify a callable into one of the four shapes
pub fn classify(callable: &Callable) -> InvokeResult<Shape> {
    target(callable).map(|t| t.shape())
}

/// True for asynchronous functions and asynchronous generators
pub fn is_async_callable(callable: &Callable) -> bool {
    classify(callable).map(Shape::is_async).unwrap_or(false)
}

/// True for either generator flavour
pub fn is_generator_callable(callable: &Callable) -> bool {
    classify(callable).map(Shape::is_generator).unwrap_or(false)
}

pub fn is_async_generator_callable(callable: &Callable) -> bool {
    matches!(classify(callable), Ok(Shape::AsynchronousGenerator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ExitOutcome, FnResource};
    use serde_json::Value;

    fn plain() -> Callable {
        Callable::blocking("plain", |_| Ok(Value::Null))
    }

    #[test]
    fn test_direct_shapes() {
        assert_eq!(classify(&plain()).unwrap(), Shape::Blocking);
        let fetch = Callable::asynchronous("fetch", |_| async { Ok(Value::Null) });
        assert_eq!(classify(&fetch).unwrap(), Shape::Asynchronous);
        assert!(is_async_callable(&fetch));
        assert!(!is_generator_callable(&fetch));

        let conn = Callable::blocking_generator("conn", |_| {
            FnResource::new(|| Ok((Value::Null, ())), |_, _: Option<&InvokeError>| ExitOutcome::Released)
        });
        assert_eq!(classify(&conn).unwrap(), Shape::BlockingGenerator);
        assert!(is_generator_callable(&conn));
        assert!(!is_async_generator_callable(&conn));
    }

    #[test]
    fn test_one_wrapper_is_transparent() {
        let wrapped = Callable::wrap("decorated", plain());
        assert_eq!(classify(&wrapped).unwrap(), Shape::Blocking);
    }

    #[test]
    fn test_nested_wrapper_is_unclassifiable() {
        let nested = Callable::wrap("outer", Callable::wrap("inner", plain()));
        let err = classify(&nested).unwrap_err();
        assert!(matches!(err, InvokeError::Unclassifiable { .. }));
        assert!(err.is_programming_error());
        assert!(!is_async_callable(&nested));
    }
}
