//! Annotation model for callable signatures.
//!
//! An [`Annotation`] is what a parameter or return slot is declared with. It
//! may already be a resolved [`TypeExpr`], a deferred reference written as
//! text, an `Annotated` composite carrying a base plus metadata, or a plain
//! metadata value. A [`Namespace`] maps identifiers to annotations and is
//! used both for declaration-site globals and for caller binding frames.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

//-----------------------------------------------------------------------------
// Type Expressions
//-----------------------------------------------------------------------------

/// A fully resolved type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeExpr {
    /// Matches any type.
    Any,
    /// The type of `None`.
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    /// Homogeneous list.
    List(Box<TypeExpr>),
    /// Homogeneous set.
    Set(Box<TypeExpr>),
    /// Fixed-arity tuple.
    Tuple(Vec<TypeExpr>),
    /// Mapping from key type to value type.
    Dict(Box<TypeExpr>, Box<TypeExpr>),
    /// Union of two or more distinct members, flattened.
    Union(Vec<TypeExpr>),
    /// A user type, identified by its qualified name.
    Named(String),
}

impl TypeExpr {
    pub fn named(name: impl Into<String>) -> Self {
        TypeExpr::Named(name.into())
    }

    pub fn list(item: TypeExpr) -> Self {
        TypeExpr::List(Box::new(item))
    }

    pub fn set(item: TypeExpr) -> Self {
        TypeExpr::Set(Box::new(item))
    }

    pub fn dict(key: TypeExpr, value: TypeExpr) -> Self {
        TypeExpr::Dict(Box::new(key), Box::new(value))
    }

    pub fn tuple(items: impl IntoIterator<Item = TypeExpr>) -> Self {
        TypeExpr::Tuple(items.into_iter().collect())
    }

    /// Build a union, flattening nested unions and dropping duplicates.
    /// A union of a single member collapses to that member.
    pub fn union(members: impl IntoIterator<Item = TypeExpr>) -> Self {
        let mut flat: Vec<TypeExpr> = Vec::new();
        for member in members {
            match member {
                TypeExpr::Union(inner) => {
                    for item in inner {
                        if !flat.contains(&item) {
                            flat.push(item);
                        }
                    }
                }
                other => {
                    if !flat.contains(&other) {
                        flat.push(other);
                    }
                }
            }
        }

        if flat.len() == 1 {
            flat.remove(0)
        } else {
            TypeExpr::Union(flat)
        }
    }

    /// `Optional[T]`, i.e. `T | None`
    pub fn optional(inner: TypeExpr) -> Self {
        TypeExpr::union([inner, TypeExpr::NoneType])
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Any => write!(f, "Any"),
            TypeExpr::NoneType => write!(f, "None"),
            TypeExpr::Bool => write!(f, "bool"),
            TypeExpr::Int => write!(f, "int"),
            TypeExpr::Float => write!(f, "float"),
            TypeExpr::Str => write!(f, "str"),
            TypeExpr::Bytes => write!(f, "bytes"),
            TypeExpr::List(item) => write!(f, "list[{}]", item),
            TypeExpr::Set(item) => write!(f, "set[{}]", item),
            TypeExpr::Tuple(items) if items.is_empty() => write!(f, "tuple[()]"),
            TypeExpr::Tuple(items) => write!(f, "tuple[{}]", join(items, ", ")),
            TypeExpr::Dict(key, value) => write!(f, "dict[{}, {}]", key, value),
            TypeExpr::Union(members) => write!(f, "{}", join(members, " | ")),
            TypeExpr::Named(name) => write!(f, "{}", name),
        }
    }
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

//-----------------------------------------------------------------------------
// Annotations
//-----------------------------------------------------------------------------

/// The declared annotation of a parameter or return slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Annotation {
    /// Nothing was declared.
    #[default]
    Empty,
    /// A resolved type.
    Type(TypeExpr),
    /// A forward reference, written as source text, still to be evaluated.
    Deferred(String),
    /// A base annotation decorated with metadata elements.
    Annotated {
        base: Box<Annotation>,
        metadata: Vec<Annotation>,
    },
    /// A non-type value, typically metadata such as a dependency marker.
    Value(Value),
}

impl Annotation {
    pub fn deferred(text: impl Into<String>) -> Self {
        Annotation::Deferred(text.into())
    }

    /// Build an `Annotated` form. Nested `Annotated` bases are flattened so
    /// that `Annotated[Annotated[T, a], b]` becomes `Annotated[T, a, b]`.
    pub fn annotated(base: Annotation, metadata: impl IntoIterator<Item = Annotation>) -> Self {
        match base {
            Annotation::Annotated {
                base: inner,
                metadata: mut existing,
            } => {
                existing.extend(metadata);
                Annotation::Annotated {
                    base: inner,
                    metadata: existing,
                }
            }
            base => Annotation::Annotated {
                base: Box::new(base),
                metadata: metadata.into_iter().collect(),
            },
        }
    }

    /// True if no deferred reference remains anywhere in this annotation
    pub fn is_resolved(&self) -> bool {
        match self {
            Annotation::Deferred(_) => false,
            Annotation::Annotated { base, metadata } => {
                base.is_resolved() && metadata.iter().all(Annotation::is_resolved)
            }
            _ => true,
        }
    }

    /// The resolved type, if this annotation is a plain type
    pub fn as_type(&self) -> Option<&TypeExpr> {
        match self {
            Annotation::Type(ty) => Some(ty),
            _ => None,
        }
    }
}

impl From<TypeExpr> for Annotation {
    fn from(ty: TypeExpr) -> Self {
        Annotation::Type(ty)
    }
}

impl From<Value> for Annotation {
    fn from(value: Value) -> Self {
        Annotation::Value(value)
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::Empty => write!(f, "<empty>"),
            Annotation::Type(ty) => write!(f, "{}", ty),
            Annotation::Deferred(text) => write!(f, "'{}'", text),
            Annotation::Annotated { base, metadata } => {
                write!(f, "Annotated[{}", base)?;
                for item in metadata {
                    write!(f, ", {}", item)?;
                }
                write!(f, "]")
            }
            Annotation::Value(value) => write!(f, "{}", value),
        }
    }
}

//-----------------------------------------------------------------------------
// Namespaces
//-----------------------------------------------------------------------------

/// A mapping from identifier to the annotation bound to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    bindings: BTreeMap<String, Annotation>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, annotation: impl Into<Annotation>) -> Self {
        self.insert(name, annotation);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, annotation: impl Into<Annotation>) {
        self.bindings.insert(name.into(), annotation.into());
    }

    pub fn get(&self, name: &str) -> Option<&Annotation> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Merge `other` into this namespace; bindings in `other` win.
    pub fn extend(&mut self, other: &Namespace) {
        for (name, annotation) in &other.bindings {
            self.bindings.insert(name.clone(), annotation.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Annotation)> {
        self.bindings.iter()
    }
}

impl FromIterator<(String, Annotation)> for Namespace {
    fn from_iter<I: IntoIterator<Item = (String, Annotation)>>(iter: I) -> Self {
        Namespace {
            bindings: iter.into_iter().collect(),
        }
    }
}
