//! Lenient evaluation of deferred annotations and full signature resolution.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::annotation::{Annotation, Namespace, TypeExpr};
use super::bindings;
use super::parser::{self, Expr, ParseError, MAX_NESTING};
use super::Signature;
use crate::callable::Callable;

/// Why a deferred annotation could not be evaluated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionFailure {
    #[error("cannot parse annotation: {0}")]
    Parse(#[from] ParseError),
    #[error("name `{0}` is not defined")]
    UnknownName(String),
    #[error("`{0}` is not a type")]
    NotAType(String),
    #[error("`{0}` is not subscriptable")]
    NotSubscriptable(String),
    #[error("forward references nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("`{form}` expects {expected} argument(s), got {got}")]
    Arity {
        form: &'static str,
        expected: &'static str,
        got: usize,
    },
}

//-----------------------------------------------------------------------------
// Signature Resolution
//-----------------------------------------------------------------------------

/// Resolve a callable's signature using the binding frames currently pushed
/// on this thread.
pub fn resolve_signature(callable: &Callable) -> Signature {
    resolve_signature_with(callable, &Namespace::new())
}

/// Resolve a callable's signature with an explicit set of extra bindings,
/// which take precedence over every pushed frame.
///
/// Parameter names, kinds and defaults come from the outermost declared
/// signature; deferred references are evaluated against the globals of the
/// innermost wrapped callable. Unresolvable annotations are passed through
/// unchanged.
pub fn resolve_signature_with(callable: &Callable, extra_locals: &Namespace) -> Signature {
    let declared = callable.signature().cloned().unwrap_or_default();

    let mut locals = bindings::collect_outer_locals();
    locals.extend(extra_locals);

    let globals = callable.innermost().globals();

    let parameters = declared
        .parameters()
        .iter()
        .map(|param| {
            let resolved = resolve_annotation(param.annotation(), globals, &locals);
            param.clone().with_annotation(resolved)
        })
        .collect();
    let return_annotation = resolve_annotation(declared.return_annotation(), globals, &locals);

    debug!(callable = callable.name(), "resolved signature");
    declared.replace(parameters, return_annotation)
}

/// Resolve one annotation leniently.
///
/// A deferred reference that cannot be evaluated is returned unchanged. An
/// `Annotated` form has its base and every metadata element resolved
/// independently.
pub fn resolve_annotation(annotation: &Annotation, globals: &Namespace, locals: &Namespace) -> Annotation {
    Resolution { globals, locals, active: Vec::new() }.resolve(annotation)
}

// Deferred texts currently being expanded. A text met again while it is
// still active is a cycle and stays deferred.
struct Resolution<'a> {
    globals: &'a Namespace,
    locals: &'a Namespace,
    active: Vec<String>,
}

impl Resolution<'_> {
    fn resolve(&mut self, annotation: &Annotation) -> Annotation {
        match annotation {
            Annotation::Deferred(text) => {
                if self.active.len() > MAX_NESTING || self.active.contains(text) {
                    debug!(annotation = %text, "cyclic or too deeply nested annotation left unresolved");
                    return annotation.clone();
                }
                let evaluated = match evaluate_deferred(text, self.globals, self.locals) {
                    Ok(resolved) => resolved,
                    Err(failure) => {
                        debug!(annotation = %text, %failure, "leaving annotation unresolved");
                        return annotation.clone();
                    }
                };
                self.active.push(text.clone());
                let resolved = self.expand(evaluated);
                self.active.pop();
                resolved
            }
            other => self.expand(other.clone()),
        }
    }

    fn expand(&mut self, annotation: Annotation) -> Annotation {
        match annotation {
            Annotation::Annotated { base, metadata } => {
                let base = self.resolve(&base);
                let metadata: Vec<Annotation> = metadata.iter().map(|item| self.resolve(item)).collect();
                Annotation::annotated(base, metadata)
            }
            other => other,
        }
    }
}

/// Strictly evaluate deferred annotation text. Names are looked up in
/// `locals`, then `globals`, then the builtin forms.
pub fn evaluate_deferred(
    text: &str,
    globals: &Namespace,
    locals: &Namespace,
) -> Result<Annotation, ResolutionFailure> {
    evaluate_at(text, globals, locals, 0)
}

fn evaluate_at(
    text: &str,
    globals: &Namespace,
    locals: &Namespace,
    depth: usize,
) -> Result<Annotation, ResolutionFailure> {
    if depth > MAX_NESTING {
        return Err(ResolutionFailure::TooDeep(MAX_NESTING));
    }
    let expr = parser::parse(text)?;
    let env = Env { globals, locals, depth };
    env.annotation(env.eval(&expr)?, &expr)
}

//-----------------------------------------------------------------------------
// Evaluation
//-----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    List,
    Set,
    Tuple,
    Dict,
    Optional,
    Union,
    Annotated,
}

impl Form {
    fn name(self) -> &'static str {
        match self {
            Form::List => "list",
            Form::Set => "set",
            Form::Tuple => "tuple",
            Form::Dict => "dict",
            Form::Optional => "Optional",
            Form::Union => "Union",
            Form::Annotated => "Annotated",
        }
    }
}

enum Evaluated {
    Annotation(Annotation),
    Form(Form),
}

fn builtin(name: &str) -> Option<Evaluated> {
    let bare = ["typing.", "typing_extensions.", "builtins.", "collections.abc."]
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name);

    let ty = |t: TypeExpr| Some(Evaluated::Annotation(Annotation::Type(t)));
    match bare {
        "int" => ty(TypeExpr::Int),
        "float" => ty(TypeExpr::Float),
        "str" => ty(TypeExpr::Str),
        "bool" => ty(TypeExpr::Bool),
        "bytes" => ty(TypeExpr::Bytes),
        "NoneType" => ty(TypeExpr::NoneType),
        "Any" | "object" => ty(TypeExpr::Any),
        "list" | "List" | "Sequence" => Some(Evaluated::Form(Form::List)),
        "set" | "Set" | "frozenset" | "FrozenSet" => Some(Evaluated::Form(Form::Set)),
        "tuple" | "Tuple" => Some(Evaluated::Form(Form::Tuple)),
        "dict" | "Dict" | "Mapping" => Some(Evaluated::Form(Form::Dict)),
        "Optional" => Some(Evaluated::Form(Form::Optional)),
        "Union" => Some(Evaluated::Form(Form::Union)),
        "Annotated" => Some(Evaluated::Form(Form::Annotated)),
        _ => None,
    }
}

struct Env<'a> {
    globals: &'a Namespace,
    locals: &'a Namespace,
    depth: usize,
}

impl Env<'_> {
    fn lookup(&self, name: &str) -> Result<Evaluated, ResolutionFailure> {
        if let Some(found) = self.locals.get(name).or_else(|| self.globals.get(name)) {
            return Ok(Evaluated::Annotation(found.clone()));
        }
        builtin(name).ok_or_else(|| ResolutionFailure::UnknownName(name.to_string()))
    }

    fn eval(&self, expr: &Expr) -> Result<Evaluated, ResolutionFailure> {
        match expr {
            Expr::Name(name) => self.lookup(name),
            Expr::None => Ok(Evaluated::Annotation(Annotation::Type(TypeExpr::NoneType))),
            // A quoted name in type position is a nested forward reference
            Expr::Str(text) => {
                evaluate_at(text, self.globals, self.locals, self.depth + 1).map(Evaluated::Annotation)
            }
            Expr::Int(value) => Ok(Evaluated::Annotation(Annotation::Value(Value::from(*value)))),
            Expr::Union(left, right) => {
                let left = self.ty(self.eval(left)?, left)?;
                let right = self.ty(self.eval(right)?, right)?;
                Ok(Evaluated::Annotation(Annotation::Type(TypeExpr::union([left, right]))))
            }
            Expr::Subscript(base, args) => match self.eval(base)? {
                Evaluated::Form(form) => self.apply(form, args).map(Evaluated::Annotation),
                Evaluated::Annotation(_) => Err(ResolutionFailure::NotSubscriptable(describe(base))),
            },
        }
    }

    fn apply(&self, form: Form, args: &[Expr]) -> Result<Annotation, ResolutionFailure> {
        let arity = |expected: &'static str| ResolutionFailure::Arity {
            form: form.name(),
            expected,
            got: args.len(),
        };

        let ty = match (form, args) {
            (Form::List, [item]) => TypeExpr::list(self.eval_ty(item)?),
            (Form::Set, [item]) => TypeExpr::set(self.eval_ty(item)?),
            (Form::Dict, [key, value]) => TypeExpr::dict(self.eval_ty(key)?, self.eval_ty(value)?),
            (Form::Optional, [inner]) => TypeExpr::optional(self.eval_ty(inner)?),
            (Form::Tuple, items) => TypeExpr::tuple(
                items
                    .iter()
                    .map(|item| self.eval_ty(item))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (Form::Union, members) if !members.is_empty() => TypeExpr::union(
                members
                    .iter()
                    .map(|member| self.eval_ty(member))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (Form::Annotated, [base, metadata @ ..]) if !metadata.is_empty() => {
                let base = self.annotation(self.eval(base)?, base)?;
                let metadata = metadata
                    .iter()
                    .map(|item| self.metadata(item))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Annotation::annotated(base, metadata));
            }
            (Form::List, _) | (Form::Set, _) | (Form::Optional, _) => return Err(arity("1")),
            (Form::Dict, _) => return Err(arity("2")),
            (Form::Union, _) => return Err(arity("at least 1")),
            (Form::Annotated, _) => return Err(arity("at least 2")),
        };
        Ok(Annotation::Type(ty))
    }

    // Metadata keeps literals as values rather than treating them as types
    fn metadata(&self, expr: &Expr) -> Result<Annotation, ResolutionFailure> {
        match expr {
            Expr::Str(text) => Ok(Annotation::Value(Value::String(text.clone()))),
            other => self.annotation(self.eval(other)?, other),
        }
    }

    fn eval_ty(&self, expr: &Expr) -> Result<TypeExpr, ResolutionFailure> {
        self.ty(self.eval(expr)?, expr)
    }

    fn ty(&self, evaluated: Evaluated, expr: &Expr) -> Result<TypeExpr, ResolutionFailure> {
        match self.annotation(evaluated, expr)? {
            Annotation::Type(ty) => Ok(ty),
            _ => Err(ResolutionFailure::NotAType(describe(expr))),
        }
    }

    fn annotation(&self, evaluated: Evaluated, expr: &Expr) -> Result<Annotation, ResolutionFailure> {
        match evaluated {
            Evaluated::Annotation(annotation) => Ok(annotation),
            Evaluated::Form(Form::List) => Ok(Annotation::Type(TypeExpr::list(TypeExpr::Any))),
            Evaluated::Form(Form::Set) => Ok(Annotation::Type(TypeExpr::set(TypeExpr::Any))),
            Evaluated::Form(Form::Dict) => {
                Ok(Annotation::Type(TypeExpr::dict(TypeExpr::Any, TypeExpr::Any)))
            }
            Evaluated::Form(Form::Tuple) => Ok(Annotation::Type(TypeExpr::tuple([]))),
            Evaluated::Form(_) => Err(ResolutionFailure::NotAType(describe(expr))),
        }
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Name(name) => name.clone(),
        Expr::None => "None".to_string(),
        Expr::Str(text) => format!("{:?}", text),
        Expr::Int(value) => value.to_string(),
        Expr::Subscript(base, args) => format!("{}[...; {}]", describe(base), args.len()),
        Expr::Union(left, right) => format!("{} | {}", describe(left), describe(right)),
    }
}
