//! Model registry.
//!
//! The registry maps logical model names to routes. The active catalog is an
//! immutable snapshot behind an `ArcSwap`: `resolve` reads the snapshot once,
//! so a call keeps a consistent route even if a reload lands mid-call.

use arc_swap::ArcSwap;
use gateway_config::GatewayConfig;
use gateway_core::{
    BackendDescriptor, BackendId, GatewayError, GatewayResult, ModelName, ModelRoute,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Declaration of one logical model before validation
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    /// Logical name
    pub name: ModelName,
    /// Equally ranked primaries
    pub primaries: Vec<BackendId>,
    /// Explicit fallbacks, tried after the primaries
    pub fallbacks: Vec<BackendId>,
}

impl ModelDefinition {
    /// Create a definition with primaries only
    #[must_use]
    pub fn new(name: ModelName, primaries: Vec<BackendId>) -> Self {
        Self {
            name,
            primaries,
            fallbacks: Vec::new(),
        }
    }

    /// Set explicit fallbacks
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: Vec<BackendId>) -> Self {
        self.fallbacks = fallbacks;
        self
    }
}

/// Validated, immutable set of routes
#[derive(Debug, Default)]
pub struct ModelCatalog {
    routes: HashMap<String, Arc<ModelRoute>>,
    backends: HashMap<String, Arc<BackendDescriptor>>,
    version: u64,
}

impl ModelCatalog {
    /// Build and validate a catalog.
    ///
    /// Each route lists the primaries, then every descriptor reachable
    /// through `fallback_of` from the primaries, then the explicit
    /// fallbacks and what they reach. Descriptors reachable along several
    /// paths appear once, at their first position.
    ///
    /// # Errors
    /// Returns `GatewayError::Config` for duplicate backend ids, duplicate
    /// model names, unknown references, self references or fallback cycles
    pub fn build(backends: Vec<BackendDescriptor>, models: Vec<ModelDefinition>) -> GatewayResult<Self> {
        let mut by_id: HashMap<BackendId, Arc<BackendDescriptor>> = HashMap::with_capacity(backends.len());
        for backend in backends {
            if by_id.contains_key(&backend.id) {
                return Err(GatewayError::config(format!("duplicate backend id {}", backend.id)));
            }
            by_id.insert(backend.id.clone(), Arc::new(backend));
        }

        for backend in by_id.values() {
            for target in &backend.fallback_of {
                if !by_id.contains_key(target) {
                    return Err(GatewayError::config(format!(
                        "backend {} falls back to unknown backend {target}",
                        backend.id
                    )));
                }
            }
        }
        detect_cycles(&by_id)?;

        let mut routes = HashMap::with_capacity(models.len());
        for model in models {
            if routes.contains_key(model.name.as_str()) {
                return Err(GatewayError::config(format!("duplicate model name {}", model.name)));
            }
            let route = build_route(&model, &by_id)?;
            debug!(
                model = %model.name,
                candidates = route.candidates().len(),
                "Built model route"
            );
            routes.insert(model.name.to_string(), Arc::new(route));
        }

        Ok(Self {
            routes,
            backends: by_id.into_iter().map(|(id, d)| (id.to_string(), d)).collect(),
            version: 0,
        })
    }

    /// Build a catalog from configuration
    ///
    /// # Errors
    /// Returns `GatewayError::Config` for malformed entries or any catalog rule violation
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let backends = config
            .descriptors()
            .map_err(|e| GatewayError::config(e.to_string()))?;
        let models = config
            .models
            .iter()
            .map(|m| {
                let ids = |list: &[String]| {
                    list.iter()
                        .map(|id| BackendId::new(id.as_str()))
                        .collect::<Result<Vec<_>, _>>()
                };
                Ok(ModelDefinition {
                    name: ModelName::new(m.name.as_str())?,
                    primaries: ids(&m.backends)?,
                    fallbacks: ids(&m.fallbacks)?,
                })
            })
            .collect::<Result<Vec<_>, gateway_core::ValidationError>>()
            .map_err(|e| GatewayError::config(e.to_string()))?;
        Self::build(backends, models)
    }

    /// Route for a logical model
    #[must_use]
    pub fn route(&self, name: &str) -> Option<&Arc<ModelRoute>> {
        self.routes.get(name)
    }

    /// Descriptor by id
    #[must_use]
    pub fn backend(&self, id: &str) -> Option<&Arc<BackendDescriptor>> {
        self.backends.get(id)
    }

    /// All backend descriptors
    pub fn backends(&self) -> impl Iterator<Item = &Arc<BackendDescriptor>> {
        self.backends.values()
    }

    /// Logical model names, sorted
    #[must_use]
    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of logical models
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the catalog has no models
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Version assigned by the registry that published this catalog
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

fn lookup(by_id: &HashMap<BackendId, Arc<BackendDescriptor>>, model: &ModelName, id: &BackendId) -> GatewayResult<Arc<BackendDescriptor>> {
    by_id
        .get(id)
        .cloned()
        .ok_or_else(|| GatewayError::config(format!("model {model} references unknown backend {id}")))
}

fn build_route(model: &ModelDefinition, by_id: &HashMap<BackendId, Arc<BackendDescriptor>>) -> GatewayResult<ModelRoute> {
    let mut declared = HashSet::new();
    for id in model.primaries.iter().chain(&model.fallbacks) {
        if !declared.insert(id) {
            return Err(GatewayError::config(format!(
                "model {} lists backend {id} more than once",
                model.name
            )));
        }
    }

    let primaries = model
        .primaries
        .iter()
        .map(|id| lookup(by_id, &model.name, id))
        .collect::<GatewayResult<Vec<_>>>()?;

    let mut chain: Vec<Arc<BackendDescriptor>> = Vec::new();
    let mut seen: HashSet<BackendId> = model.primaries.iter().cloned().collect();
    for primary in &primaries {
        for next in &primary.fallback_of {
            expand(next, by_id, &mut seen, &mut chain);
        }
    }
    for id in &model.fallbacks {
        let descriptor = lookup(by_id, &model.name, id)?;
        if seen.insert(descriptor.id.clone()) {
            chain.push(Arc::clone(&descriptor));
        }
        for next in &descriptor.fallback_of {
            expand(next, by_id, &mut seen, &mut chain);
        }
    }

    ModelRoute::new(model.name.clone(), primaries, chain)
}

// References were checked and the graph is acyclic before this runs.
fn expand(
    id: &BackendId,
    by_id: &HashMap<BackendId, Arc<BackendDescriptor>>,
    seen: &mut HashSet<BackendId>,
    chain: &mut Vec<Arc<BackendDescriptor>>,
) {
    let Some(descriptor) = by_id.get(id) else {
        return;
    };
    if !seen.insert(id.clone()) {
        return;
    }
    chain.push(Arc::clone(descriptor));
    for next in &descriptor.fallback_of {
        expand(next, by_id, seen, chain);
    }
}

fn detect_cycles(by_id: &HashMap<BackendId, Arc<BackendDescriptor>>) -> GatewayResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a BackendId,
        by_id: &'a HashMap<BackendId, Arc<BackendDescriptor>>,
        marks: &mut HashMap<&'a BackendId, Mark>,
        path: &mut Vec<&'a BackendId>,
    ) -> GatewayResult<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let cycle: Vec<String> = path[start..]
                    .iter()
                    .map(ToString::to_string)
                    .chain(std::iter::once(id.to_string()))
                    .collect();
                return Err(GatewayError::config(format!(
                    "fallback cycle detected: {}",
                    cycle.join(" -> ")
                )));
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        path.push(id);
        if let Some(descriptor) = by_id.get(id) {
            for next in &descriptor.fallback_of {
                visit(next, by_id, marks, path)?;
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::with_capacity(by_id.len());
    let mut ids: Vec<&BackendId> = by_id.keys().collect();
    ids.sort();
    for id in ids {
        visit(id, by_id, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

/// Registry holding the active catalog
#[derive(Debug)]
pub struct ModelRegistry {
    active: ArcSwap<ModelCatalog>,
    next_version: AtomicU64,
}

impl ModelRegistry {
    /// Create a registry with an initial catalog
    #[must_use]
    pub fn new(mut catalog: ModelCatalog) -> Self {
        catalog.version = 1;
        Self {
            active: ArcSwap::from_pointee(catalog),
            next_version: AtomicU64::new(2),
        }
    }

    /// Create a registry from configuration
    ///
    /// # Errors
    /// Returns `GatewayError::Config` when the catalog is invalid
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        Ok(Self::new(ModelCatalog::from_config(config)?))
    }

    /// Resolve a logical model against the current snapshot
    ///
    /// # Errors
    /// Returns `GatewayError::UnknownModel` if the name is not in the catalog
    pub fn resolve(&self, logical_name: &str) -> GatewayResult<Arc<ModelRoute>> {
        let snapshot = self.active.load();
        snapshot
            .route(logical_name)
            .cloned()
            .ok_or_else(|| GatewayError::unknown_model(logical_name))
    }

    /// Current catalog snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<ModelCatalog> {
        self.active.load_full()
    }

    /// Atomically replace the active catalog, returning its version
    pub fn reload(&self, mut catalog: ModelCatalog) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        catalog.version = version;
        let models = catalog.len();
        self.active.store(Arc::new(catalog));
        info!(version, models, "Model catalog reloaded");
        version
    }

    /// Validate a configuration and swap its catalog in
    ///
    /// # Errors
    /// Returns `GatewayError::Config` and keeps the current catalog when invalid
    pub fn reload_from_config(&self, config: &GatewayConfig) -> GatewayResult<u64> {
        let catalog = ModelCatalog::from_config(config)?;
        Ok(self.reload(catalog))
    }

    /// Version of the active catalog
    #[must_use]
    pub fn version(&self) -> u64 {
        self.active.load().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> BackendId {
        BackendId::new(name).expect("valid id")
    }

    fn backend(name: &str, fallbacks: &[&str]) -> BackendDescriptor {
        let mut descriptor = BackendDescriptor::new(id(name), "openai", format!("{name}-model"), "http://localhost");
        descriptor.fallback_of = fallbacks.iter().map(|f| id(f)).collect();
        descriptor
    }

    fn model(name: &str, primaries: &[&str], fallbacks: &[&str]) -> ModelDefinition {
        ModelDefinition::new(
            ModelName::new(name).expect("valid name"),
            primaries.iter().map(|p| id(p)).collect(),
        )
        .with_fallbacks(fallbacks.iter().map(|f| id(f)).collect())
    }

    fn chain(route: &ModelRoute) -> Vec<&str> {
        route.candidates().iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_resolve_builds_transitive_chain() {
        let catalog = ModelCatalog::build(
            vec![backend("a", &["b"]), backend("b", &["c"]), backend("c", &[]), backend("d", &[])],
            vec![model("chat", &["a"], &["d"])],
        )
        .expect("valid catalog");
        let registry = ModelRegistry::new(catalog);

        let route = registry.resolve("chat").expect("known model");
        assert_eq!(chain(&route), vec!["a", "b", "c", "d"]);
        assert_eq!(route.primaries().len(), 1);
    }

    #[test]
    fn test_diamond_fallbacks_are_deduplicated() {
        let catalog = ModelCatalog::build(
            vec![backend("a", &["c"]), backend("b", &["c"]), backend("c", &[])],
            vec![model("chat", &["a", "b"], &[])],
        )
        .expect("valid catalog");
        let route = catalog.route("chat").expect("route");
        assert_eq!(chain(route), vec!["a", "b", "c"]);
        assert_eq!(route.primaries().len(), 2);
    }

    #[test]
    fn test_unknown_model() {
        let registry = ModelRegistry::new(ModelCatalog::default());
        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, GatewayError::UnknownModel { ref model } if model == "missing"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = ModelCatalog::build(
            vec![backend("a", &["b"]), backend("b", &["c"]), backend("c", &["a"])],
            vec![model("chat", &["a"], &[])],
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("fallback cycle"), "{message}");
        assert!(message.contains("a -> b -> c -> a"), "{message}");
    }

    #[test]
    fn test_self_fallback_is_rejected() {
        assert!(ModelCatalog::build(vec![backend("a", &["a"])], vec![]).is_err());
        assert!(ModelCatalog::build(vec![backend("a", &[])], vec![model("chat", &["a"], &["a"])]).is_err());
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let err = ModelCatalog::build(
            vec![backend("a", &[])],
            vec![model("chat", &["a"], &[]), model("chat", &["a"], &[])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate model name chat"));

        assert!(ModelCatalog::build(vec![backend("a", &[]), backend("a", &[])], vec![]).is_err());
    }

    #[test]
    fn test_unknown_references_are_rejected() {
        assert!(ModelCatalog::build(vec![backend("a", &["zzz"])], vec![]).is_err());
        assert!(ModelCatalog::build(vec![backend("a", &[])], vec![model("chat", &["b"], &[])]).is_err());
    }

    #[test]
    fn test_reload_swaps_snapshot_and_keeps_old_route() {
        let registry = ModelRegistry::new(
            ModelCatalog::build(vec![backend("a", &[])], vec![model("chat", &["a"], &[])]).expect("valid"),
        );
        let held = registry.resolve("chat").expect("known");
        assert_eq!(registry.version(), 1);

        let version = registry.reload(
            ModelCatalog::build(vec![backend("b", &[])], vec![model("chat", &["b"], &[])]).expect("valid"),
        );
        assert_eq!(version, 2);
        assert_eq!(registry.version(), 2);
        assert_eq!(chain(&held), vec!["a"]);
        assert_eq!(chain(&registry.resolve("chat").expect("known")), vec!["b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_during_reload_sees_whole_snapshots() {
        let generation = |tag: &str| {
            ModelCatalog::build(
                vec![backend(&format!("{tag}-a"), &[&format!("{tag}-b")]), backend(&format!("{tag}-b"), &[])],
                vec![model("chat", &[&format!("{tag}-a")], &[])],
            )
            .expect("valid catalog")
        };
        let registry = Arc::new(ModelRegistry::new(generation("old")));

        let readers: Vec<_> = (0..100)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let route = registry.resolve("chat").expect("known model");
                        let ids = chain(&route);
                        let tag = ids[0].split('-').next().unwrap_or_default().to_string();
                        assert_eq!(ids, vec![format!("{tag}-a"), format!("{tag}-b")]);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for round in 0..20 {
            let tag = if round % 2 == 0 { "new" } else { "old" };
            registry.reload(generation(tag));
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.expect("reader task");
        }
        assert_eq!(registry.version(), 21);
    }

    #[test]
    fn test_from_config_rejects_invalid_catalog() {
        let yaml = r#"
backends:
  - id: a
    model: m
    endpoint: http://localhost:1
    fallbacks: [b]
  - id: b
    model: m
    endpoint: http://localhost:2
    fallbacks: [a]
models:
  - name: chat
    backends: [a]
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).expect("parse");
        let err = ModelRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
    }
}
