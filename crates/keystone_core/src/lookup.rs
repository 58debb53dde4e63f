//! Implementation catalog: construct "the implementation named by this
//! template for this revision".
//!
//! Every per-revision variant registers a factory under a fully qualified
//! name such as `v1_20_R3::menu::MenuRenderer`. A lookup substitutes the
//! revision into a name template, finds the factory, checks the supplied
//! arguments against the factory's declared signature and runs it. The
//! three failure modes stay distinct so callers can say precisely what is
//! missing:
//!
//! * the name is not registered at all -> [`LookupError::NotFound`]
//! * the arguments do not fit the signature -> [`LookupError::ConstructorMismatch`]
//! * the factory ran and failed (or panicked) -> [`LookupError::ConstructionFailed`]

use crate::error::LookupError;
use crate::revision::RevisionTag;
use crate::types::ClientId;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Placeholder replaced by the revision tag in name templates.
pub const REVISION_PLACEHOLDER: &str = "{revision}";

/// Type of one constructor parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Bool,
    Int,
    Float,
    Text,
    Client,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::Bool => "bool",
            ArgKind::Int => "int",
            ArgKind::Float => "float",
            ArgKind::Text => "text",
            ArgKind::Client => "client",
        };
        f.write_str(name)
    }
}

/// One constructor argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstructorArg {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Client(ClientId),
}

impl ConstructorArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            ConstructorArg::Bool(_) => ArgKind::Bool,
            ConstructorArg::Int(_) => ArgKind::Int,
            ConstructorArg::Float(_) => ArgKind::Float,
            ConstructorArg::Text(_) => ArgKind::Text,
            ConstructorArg::Client(_) => ArgKind::Client,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConstructorArg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConstructorArg::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConstructorArg::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ConstructorArg::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_client(&self) -> Option<ClientId> {
        match self {
            ConstructorArg::Client(v) => Some(*v),
            _ => None,
        }
    }
}

/// Renders a list of argument kinds as `(int, text)`.
fn signature_string(kinds: impl IntoIterator<Item = ArgKind>) -> String {
    let parts: Vec<String> = kinds.into_iter().map(|k| k.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// Error type factories return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A type-erased constructed implementation.
pub type Instance = Box<dyn Any + Send + Sync>;

type FactoryFn = dyn Fn(&[ConstructorArg]) -> Result<Instance, BoxError> + Send + Sync;

/// A registered constructor: its signature and the function that runs it.
#[derive(Clone)]
pub struct Factory {
    signature: Vec<ArgKind>,
    build: Arc<FactoryFn>,
}

impl Factory {
    pub fn new<F>(signature: Vec<ArgKind>, build: F) -> Self
    where
        F: Fn(&[ConstructorArg]) -> Result<Instance, BoxError> + Send + Sync + 'static,
    {
        Self {
            signature,
            build: Arc::new(build),
        }
    }

    pub fn signature(&self) -> &[ArgKind] {
        &self.signature
    }

    fn accepts(&self, args: &[ConstructorArg]) -> bool {
        self.signature.len() == args.len()
            && self
                .signature
                .iter()
                .zip(args)
                .all(|(kind, arg)| *kind == arg.kind())
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("signature", &signature_string(self.signature.iter().copied()))
            .finish()
    }
}

/// Substitutes `revision` into `template`.
///
/// A template without the placeholder is returned unchanged, which makes
/// revision-independent implementations possible.
pub fn qualify(template: &str, revision: RevisionTag) -> String {
    template.replace(REVISION_PLACEHOLDER, &revision.to_string())
}

/// Registry of named factories.
///
/// Built once at startup and then shared read-only, so lookups take no
/// locks.
#[derive(Debug, Default, Clone)]
pub struct ImplementationCatalog {
    factories: HashMap<String, Factory>,
}

impl ImplementationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a fully qualified name.
    ///
    /// Returns the previous factory if the name was already taken.
    pub fn register(&mut self, name: impl Into<String>, factory: Factory) -> Option<Factory> {
        let name = name.into();
        let previous = self.factories.insert(name.clone(), factory);
        if previous.is_some() {
            warn!("Replaced implementation registered as {}", name);
        }
        previous
    }

    /// Registers a factory for `template` on every revision in `revisions`.
    pub fn register_for<'a>(
        &mut self,
        template: &str,
        revisions: impl IntoIterator<Item = &'a RevisionTag>,
        factory: Factory,
    ) {
        for revision in revisions {
            self.register(qualify(template, *revision), factory.clone());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Constructs the implementation registered for `template` at `revision`.
    ///
    /// # Errors
    ///
    /// See the module documentation for the three failure modes.
    pub fn instantiate(
        &self,
        template: &str,
        revision: RevisionTag,
        args: &[ConstructorArg],
    ) -> Result<Instance, LookupError> {
        let name = qualify(template, revision);
        let factory = self
            .factories
            .get(&name)
            .ok_or_else(|| LookupError::NotFound { name: name.clone() })?;

        if !factory.accepts(args) {
            return Err(LookupError::ConstructorMismatch {
                expected: signature_string(factory.signature.iter().copied()),
                found: signature_string(args.iter().map(ConstructorArg::kind)),
                name,
            });
        }

        debug!("Constructing {}", name);
        match catch_unwind(AssertUnwindSafe(|| (factory.build)(args))) {
            Ok(Ok(instance)) => Ok(instance),
            Ok(Err(e)) => Err(LookupError::ConstructionFailed {
                name,
                reason: e.to_string(),
            }),
            Err(panic) => Err(LookupError::ConstructionFailed {
                name,
                reason: panic_message(panic.as_ref()),
            }),
        }
    }

    /// Like [`instantiate`](Self::instantiate) but downcasts to `T`.
    ///
    /// # Errors
    ///
    /// Additionally reports [`LookupError::ConstructorMismatch`] when the
    /// factory produced something other than a `T`.
    pub fn instantiate_as<T: Any + Send + Sync>(
        &self,
        template: &str,
        revision: RevisionTag,
        args: &[ConstructorArg],
    ) -> Result<T, LookupError> {
        let instance = self.instantiate(template, revision, args)?;
        instance
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| LookupError::ConstructorMismatch {
                name: qualify(template, revision),
                expected: std::any::type_name::<T>().to_string(),
                found: "an instance of another type".to_string(),
            })
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{V1_19_R3, V1_20_R3, V1_8_R3};

    const GREETER: &str = "{revision}::Greeter";

    fn catalog() -> ImplementationCatalog {
        let mut catalog = ImplementationCatalog::new();
        catalog.register_for(
            GREETER,
            &[V1_19_R3, V1_20_R3],
            Factory::new(vec![ArgKind::Text, ArgKind::Int], |args| {
                let name = args[0].as_text().unwrap_or_default().to_string();
                let times = args[1].as_int().unwrap_or_default();
                if times < 0 {
                    return Err("times must not be negative".into());
                }
                Ok(Box::new(name.repeat(times as usize)) as Instance)
            }),
        );
        catalog.register(
            "v1_20_R3::Exploder",
            Factory::new(vec![], |_| panic!("boom")),
        );
        catalog
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify(GREETER, V1_20_R3), "v1_20_R3::Greeter");
        assert_eq!(qualify("shared::Thing", V1_20_R3), "shared::Thing");
    }

    #[test]
    fn test_instantiate_success() {
        let args = [ConstructorArg::Text("hi".into()), ConstructorArg::Int(2)];
        let greeting: String = catalog().instantiate_as(GREETER, V1_20_R3, &args).unwrap();
        assert_eq!(greeting, "hihi");
    }

    #[test]
    fn test_not_found_names_qualified_implementation() {
        let args = [ConstructorArg::Text("hi".into()), ConstructorArg::Int(2)];
        let err = catalog().instantiate(GREETER, V1_8_R3, &args).unwrap_err();
        assert_eq!(
            err,
            LookupError::NotFound {
                name: "v1_8_R3::Greeter".into()
            }
        );
    }

    #[test]
    fn test_constructor_mismatch_on_arity_and_type() {
        let catalog = catalog();

        let err = catalog
            .instantiate(GREETER, V1_20_R3, &[ConstructorArg::Text("hi".into())])
            .unwrap_err();
        assert!(matches!(err, LookupError::ConstructorMismatch { .. }));

        let err = catalog
            .instantiate(
                GREETER,
                V1_20_R3,
                &[ConstructorArg::Int(2), ConstructorArg::Text("hi".into())],
            )
            .unwrap_err();
        match err {
            LookupError::ConstructorMismatch { expected, found, .. } => {
                assert_eq!(expected, "(text, int)");
                assert_eq!(found, "(int, text)");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_construction_failed_and_panics_are_contained() {
        let catalog = catalog();
        let args = [ConstructorArg::Text("hi".into()), ConstructorArg::Int(-1)];
        let err = catalog.instantiate(GREETER, V1_20_R3, &args).unwrap_err();
        assert!(matches!(err, LookupError::ConstructionFailed { .. }));

        let err = catalog
            .instantiate("{revision}::Exploder", V1_20_R3, &[])
            .unwrap_err();
        match err {
            LookupError::ConstructionFailed { reason, .. } => assert!(reason.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_downcast_to_wrong_type_is_mismatch() {
        let args = [ConstructorArg::Text("hi".into()), ConstructorArg::Int(1)];
        let err = catalog()
            .instantiate_as::<u32>(GREETER, V1_20_R3, &args)
            .unwrap_err();
        assert!(matches!(err, LookupError::ConstructorMismatch { .. }));
    }
}
