//! Memoized per-feature implementation selection.
use super::{
    BoundaryEffectFeature, Feature, FloatingTextFeature, InputDialogFeature, MenuFeature,
    StatusBarFeature, TitleFeature,
};
use crate::error::{FeatureError, LookupError};
use crate::lookup::{qualify, ConstructorArg, ImplementationCatalog};
use crate::revision::RevisionTag;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// How to build one feature.
#[derive(Debug, Clone)]
struct Declaration {
    template: String,
    args: Vec<ConstructorArg>,
}

type Binding = Result<ResolvedFeature, FeatureError>;

/// A constructed feature implementation, shared by every caller.
#[derive(Clone)]
pub struct ResolvedFeature {
    name: Arc<str>,
    implementation: Arc<str>,
    instance: Arc<dyn Any + Send + Sync>,
}

impl ResolvedFeature {
    /// Symbolic feature name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified name of the selected implementation.
    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    /// Recovers the typed capability, if this binding belongs to `F`.
    pub fn downcast<F: Feature>(&self) -> Option<Arc<F::Implementation>> {
        self.instance
            .downcast_ref::<Arc<F::Implementation>>()
            .cloned()
    }
}

impl std::fmt::Debug for ResolvedFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedFeature")
            .field("name", &self.name)
            .field("implementation", &self.implementation)
            .finish()
    }
}

/// Maps feature names to the implementation chosen for the running revision.
///
/// Resolution happens at most once per feature name. Concurrent first
/// requests race on a once-cell, so exactly one of them constructs the
/// implementation and the rest wait for its result. A failed resolution is
/// memoized too: later requests get the same [`FeatureError`] without the
/// catalog being consulted again.
pub struct FeatureRegistry {
    revision: RevisionTag,
    catalog: Arc<ImplementationCatalog>,
    declarations: RwLock<HashMap<String, Declaration>>,
    bindings: DashMap<String, Arc<OnceCell<Binding>>>,
}

impl FeatureRegistry {
    /// Creates a registry with the built-in features declared.
    pub fn new(revision: RevisionTag, catalog: Arc<ImplementationCatalog>) -> Self {
        let registry = Self {
            revision,
            catalog,
            declarations: RwLock::new(HashMap::new()),
            bindings: DashMap::new(),
        };
        registry.declare_feature::<MenuFeature>();
        registry.declare_feature::<FloatingTextFeature>();
        registry.declare_feature::<BoundaryEffectFeature>();
        registry.declare_feature::<StatusBarFeature>();
        registry.declare_feature::<InputDialogFeature>();
        registry.declare_feature::<TitleFeature>();
        registry
    }

    /// Revision every lookup is made against.
    pub fn revision(&self) -> RevisionTag {
        self.revision
    }

    /// Declares how to build the feature called `name`.
    ///
    /// Returns `false` and leaves the declaration untouched once the
    /// feature has been resolved, since bindings never change afterwards.
    pub fn declare(
        &self,
        name: impl Into<String>,
        template: impl Into<String>,
        args: Vec<ConstructorArg>,
    ) -> bool {
        let name = name.into();
        if self.is_resolved(&name) {
            warn!("Ignoring redeclaration of already resolved feature '{}'", name);
            return false;
        }
        self.declarations.write().insert(
            name,
            Declaration {
                template: template.into(),
                args,
            },
        );
        true
    }

    /// Declares a typed feature with its default arguments.
    pub fn declare_feature<F: Feature>(&self) -> bool {
        self.declare(F::NAME, F::TEMPLATE, F::default_args())
    }

    /// Whether `name` has been resolved, successfully or not.
    pub fn is_resolved(&self, name: &str) -> bool {
        self.bindings
            .get(name)
            .map(|cell| cell.get().is_some())
            .unwrap_or(false)
    }

    /// Returns the implementation of `name` for the running revision.
    ///
    /// # Errors
    ///
    /// [`FeatureError::UnsupportedRevision`] naming the feature, the revision
    /// and the underlying lookup failure.
    pub fn get(&self, name: &str) -> Result<ResolvedFeature, FeatureError> {
        // The shard guard must be released before `entry` takes the write lock.
        let existing = self.bindings.get(name).map(|cell| cell.value().clone());
        let cell = match existing {
            Some(cell) => cell,
            None => self
                .bindings
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone(),
        };
        cell.get_or_init(|| self.resolve(name)).clone()
    }

    /// Typed variant of [`get`](Self::get).
    ///
    /// Declares `F` with its defaults if nothing was declared under its name.
    pub fn get_typed<F: Feature>(&self) -> Result<Arc<F::Implementation>, FeatureError> {
        if !self.declarations.read().contains_key(F::NAME) {
            self.declare_feature::<F>();
        }
        let resolved = self.get(F::NAME)?;
        resolved
            .downcast::<F>()
            .ok_or_else(|| FeatureError::UnsupportedRevision {
                feature: F::NAME.to_string(),
                revision: self.revision,
                cause: LookupError::ConstructorMismatch {
                    name: resolved.implementation().to_string(),
                    expected: std::any::type_name::<F::Implementation>().to_string(),
                    found: "an implementation of another capability".to_string(),
                },
            })
    }

    fn resolve(&self, name: &str) -> Binding {
        let declaration = self.declarations.read().get(name).cloned();
        let Some(declaration) = declaration else {
            warn!("❌ Feature '{}' was requested but never declared", name);
            return Err(FeatureError::UnsupportedRevision {
                feature: name.to_string(),
                revision: self.revision,
                cause: LookupError::NotFound {
                    name: name.to_string(),
                },
            });
        };

        match self
            .catalog
            .instantiate(&declaration.template, self.revision, &declaration.args)
        {
            Ok(instance) => {
                let implementation = qualify(&declaration.template, self.revision);
                info!("🧩 Feature '{}' bound to {}", name, implementation);
                Ok(ResolvedFeature {
                    name: Arc::from(name),
                    implementation: Arc::from(implementation),
                    instance: Arc::from(instance),
                })
            }
            Err(cause) => {
                warn!(
                    "❌ Feature '{}' unavailable on revision {}: {}",
                    name, self.revision, cause
                );
                Err(FeatureError::UnsupportedRevision {
                    feature: name.to_string(),
                    revision: self.revision,
                    cause,
                })
            }
        }
    }
}

impl std::fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("revision", &self.revision)
            .field("declared", &self.declarations.read().len())
            .field("bound", &self.bindings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{feature_factory, variants, StatusBar, TitleDisplay};
    use crate::lookup::{ArgKind, Factory, Instance};
    use crate::revision::{V1_20_R3, V1_8_R3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn builtin(revision: RevisionTag) -> FeatureRegistry {
        let mut catalog = ImplementationCatalog::new();
        variants::install_builtin(&mut catalog);
        FeatureRegistry::new(revision, Arc::new(catalog))
    }

    #[test]
    fn test_builtin_feature_resolves() {
        let registry = builtin(V1_20_R3);
        let title = registry.get_typed::<TitleFeature>().unwrap();
        assert_eq!(title.clear().len(), 1);

        let resolved = registry.get("title").unwrap();
        assert_eq!(resolved.implementation(), "v1_20_R3::title::TitleDisplay");
        assert!(resolved.downcast::<StatusBarFeature>().is_none());
    }

    #[test]
    fn test_same_instance_is_shared() {
        let registry = builtin(V1_20_R3);
        let a = registry.get_typed::<StatusBarFeature>().unwrap();
        let b = registry.get_typed::<StatusBarFeature>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unsupported_revision_names_feature_and_revision() {
        let registry = builtin(V1_8_R3);
        let err = registry.get_typed::<StatusBarFeature>().err().unwrap();
        assert_eq!(err.feature(), "status_bar");
        assert_eq!(err.revision(), V1_8_R3);
        let FeatureError::UnsupportedRevision { cause, .. } = err;
        assert_eq!(
            cause,
            LookupError::NotFound {
                name: "v1_8_R3::bar::StatusBar".into()
            }
        );
    }

    #[test]
    fn test_failure_is_memoized_without_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut catalog = ImplementationCatalog::new();
        catalog.register(
            "v1_20_R3::flaky::Thing",
            Factory::new(vec![], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Instance, _>("native handle unavailable".into())
            }),
        );
        let registry = FeatureRegistry::new(V1_20_R3, Arc::new(catalog));
        registry.declare("flaky", "{revision}::flaky::Thing", vec![]);

        let first = registry.get("flaky").unwrap_err();
        let second = registry.get("flaky").unwrap_err();
        assert_eq!(first, second);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!registry.declare("flaky", "{revision}::other::Thing", vec![]));
    }

    #[test]
    fn test_concurrent_first_resolution_constructs_once() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = constructed.clone();
        let mut catalog = ImplementationCatalog::new();
        variants::install_builtin(&mut catalog);
        catalog.register(
            "v1_20_R3::bar::StatusBar",
            feature_factory::<StatusBarFeature, _>(vec![], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(Arc::new(variants::BossEventBar) as Arc<dyn StatusBar>)
            }),
        );
        let registry = Arc::new(FeatureRegistry::new(V1_20_R3, Arc::new(catalog)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_typed::<StatusBarFeature>().is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undeclared_feature() {
        let registry = builtin(V1_20_R3);
        let err = registry.get("pathing_entity").unwrap_err();
        assert_eq!(err.feature(), "pathing_entity");
    }

    #[test]
    fn test_host_declared_feature_with_arguments() {
        let mut catalog = ImplementationCatalog::new();
        catalog.register(
            "v1_20_R3::item::MetaCodec",
            Factory::new(vec![ArgKind::Int], |args| {
                Ok(Box::new(args[0].as_int().unwrap_or_default()) as Instance)
            }),
        );
        let registry = FeatureRegistry::new(V1_20_R3, Arc::new(catalog));
        registry.declare(
            "item_metadata",
            "{revision}::item::MetaCodec",
            vec![ConstructorArg::Text("wrong".into())],
        );
        let err = registry.get("item_metadata").unwrap_err();
        assert!(matches!(
            err,
            FeatureError::UnsupportedRevision {
                cause: LookupError::ConstructorMismatch { .. },
                ..
            }
        ));
    }

    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn TitleDisplay) {}
}
