// Signature Resolution
//
// Declared signatures of callables and their resolution into fully typed
// signatures, including deferred references visible only at the call site.

pub mod annotation;
pub mod bindings;
pub mod parser;
pub mod resolver;

use serde_json::Value;

pub use annotation::{Annotation, Namespace, TypeExpr};
pub use bindings::{collect_outer_locals, enter_frame, FrameGuard};
pub use resolver::{
    evaluate_deferred, resolve_annotation, resolve_signature, resolve_signature_with,
    ResolutionFailure,
};

/// How an argument binds to a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    PositionalOnly,
    PositionalOrKeyword,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    kind: ParameterKind,
    default: Option<Value>,
    annotation: Annotation,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            annotation: Annotation::Empty,
        }
    }

    /// A positional-or-keyword parameter with the given annotation
    pub fn positional(name: impl Into<String>, annotation: impl Into<Annotation>) -> Self {
        Self::new(name, ParameterKind::PositionalOrKeyword).with_annotation(annotation)
    }

    /// A keyword-only parameter with the given annotation
    pub fn keyword(name: impl Into<String>, annotation: impl Into<Annotation>) -> Self {
        Self::new(name, ParameterKind::KeywordOnly).with_annotation(annotation)
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<Annotation>) -> Self {
        self.annotation = annotation.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn annotation(&self) -> &Annotation {
        &self.annotation
    }
}

/// Ordered parameters plus a return annotation.
///
/// A signature produced by [`resolve_signature`] is a fresh value on every
/// call; nothing is cached between resolutions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Signature {
    parameters: Vec<Parameter>,
    return_annotation: Annotation,
}

impl Signature {
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self {
            parameters,
            return_annotation: Annotation::Empty,
        }
    }

    pub fn returning(mut self, annotation: impl Into<Annotation>) -> Self {
        self.return_annotation = annotation.into();
        self
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn return_annotation(&self) -> &Annotation {
        &self.return_annotation
    }

    /// Copy of this signature with parameters and return annotation replaced
    pub fn replace(&self, parameters: Vec<Parameter>, return_annotation: Annotation) -> Self {
        Self {
            parameters,
            return_annotation,
        }
    }

    /// True if every annotation in the signature is resolved
    pub fn is_resolved(&self) -> bool {
        self.return_annotation.is_resolved()
            && self.parameters.iter().all(|p| p.annotation.is_resolved())
    }
}
