//! Per-test fixture composition
//!
//! A fixture is a named constructor with an explicit dependency list. The
//! constructor receives its resolved dependencies and a single-use [`Use`]
//! token; it hands its value to the test through [`Use::provide`], which
//! resumes once the test is over so the constructor can tear down.
//!
//! Defining a name that already exists layers the new definition over the
//! old one. Inside the new layer, a dependency on its own name resolves to
//! the layer below, so a fixture can wrap the value it replaces while every
//! other dependent transparently receives the wrapped value.
//!
//! Within a scope each fixture is constructed at most once, dependencies
//! before dependents, and torn down in reverse construction order.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::error::{E2eError, E2eResult};

pub type FixtureValue = Arc<dyn Any + Send + Sync>;

type Constructor = Arc<dyn Fn(FixtureSet, Use) -> BoxFuture<'static, E2eResult<()>> + Send + Sync>;

/// Values visible to a constructor or test, keyed by fixture name
#[derive(Clone, Default)]
pub struct FixtureSet {
    values: HashMap<String, FixtureValue>,
}

impl FixtureSet {
    /// Clone out the value of fixture `name`
    pub fn get<T>(&self, name: &str) -> E2eResult<T>
    where
        T: Any + Send + Sync + Clone,
    {
        let value = self.values.get(name).ok_or_else(|| E2eError::UnknownFixture {
            name: name.to_string(),
            requested_by: "lookup".to_string(),
        })?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| E2eError::FixtureType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    fn insert(&mut self, name: &str, value: FixtureValue) {
        self.values.insert(name.to_string(), value);
    }
}

/// Single-use handle a constructor passes its value through
pub struct Use {
    value_tx: oneshot::Sender<FixtureValue>,
    teardown_rx: oneshot::Receiver<()>,
}

impl Use {
    /// Hand `value` to dependents and the test, then wait for teardown
    pub async fn provide<T>(self, value: T)
    where
        T: Any + Send + Sync,
    {
        if self.value_tx.send(Arc::new(value)).is_err() {
            return;
        }
        // A dropped scope counts as teardown
        let _ = self.teardown_rx.await;
    }
}

/// Recorded fixture lifecycle step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FixtureEvent {
    Setup { name: String, layer: usize },
    Teardown { name: String, layer: usize },
}

struct Definition {
    dependencies: Vec<String>,
    constructor: Constructor,
}

type NodeId = (String, usize);

/// Declared fixtures, resolved per test
#[derive(Default, Clone)]
pub struct FixtureRegistry {
    layers: HashMap<String, Vec<Arc<Definition>>>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare fixture `name`, layering over any existing definition
    pub fn define<F, Fut>(mut self, name: &str, dependencies: &[&str], constructor: F) -> Self
    where
        F: Fn(FixtureSet, Use) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = E2eResult<()>> + Send + 'static,
    {
        let constructor: Constructor =
            Arc::new(move |deps: FixtureSet, use_: Use| constructor(deps, use_).boxed());
        self.layers
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(Definition {
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
                constructor,
            }));
        self
    }

    /// Declare a fixture with nothing to tear down
    pub fn define_value<F, Fut, T>(self, name: &str, dependencies: &[&str], constructor: F) -> Self
    where
        F: Fn(FixtureSet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = E2eResult<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        let constructor = Arc::new(constructor);
        self.define(name, dependencies, move |deps, use_| {
            let constructor = constructor.clone();
            async move {
                let value = (constructor.as_ref())(deps).await?;
                use_.provide(value).await;
                Ok(())
            }
        })
    }

    /// Layer every definition of `other` over this registry
    pub fn extend(mut self, other: FixtureRegistry) -> Self {
        for (name, definitions) in other.layers {
            self.layers.entry(name).or_default().extend(definitions);
        }
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    fn top(&self, name: &str, requested_by: &str) -> E2eResult<NodeId> {
        match self.layers.get(name) {
            Some(defs) if !defs.is_empty() => Ok((name.to_string(), defs.len() - 1)),
            _ => Err(E2eError::UnknownFixture {
                name: name.to_string(),
                requested_by: requested_by.to_string(),
            }),
        }
    }

    fn definition(&self, node: &NodeId) -> &Arc<Definition> {
        &self.layers[&node.0][node.1]
    }

    /// Node a dependency of `node` refers to
    fn resolve_dependency(&self, node: &NodeId, dependency: &str) -> E2eResult<NodeId> {
        if dependency == node.0 {
            if node.1 == 0 {
                return Err(E2eError::UnknownFixture {
                    name: dependency.to_string(),
                    requested_by: format!("{} (no underlying definition)", node.0),
                });
            }
            Ok((node.0.clone(), node.1 - 1))
        } else {
            self.top(dependency, &node.0)
        }
    }

    /// Construction order for `requested` and everything they depend on
    pub fn plan(&self, requested: &[&str]) -> E2eResult<Vec<(String, usize)>> {
        let mut order = Vec::new();
        let mut done: HashSet<NodeId> = HashSet::new();
        let mut path: Vec<NodeId> = Vec::new();

        for name in requested {
            let node = self.top(name, "test")?;
            self.visit(node, &mut order, &mut done, &mut path)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        node: NodeId,
        order: &mut Vec<NodeId>,
        done: &mut HashSet<NodeId>,
        path: &mut Vec<NodeId>,
    ) -> E2eResult<()> {
        if done.contains(&node) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.0.clone()).collect();
            cycle.push(node.0.clone());
            return Err(E2eError::FixtureCycle(cycle));
        }

        path.push(node.clone());
        for dependency in &self.definition(&node).dependencies {
            let dep = self.resolve_dependency(&node, dependency)?;
            self.visit(dep, order, done, path)?;
        }
        path.pop();

        done.insert(node.clone());
        order.push(node);
        Ok(())
    }

    /// Construct `requested` for one test
    pub async fn setup(&self, requested: &[&str]) -> E2eResult<FixtureScope> {
        let mut scope = FixtureScope::default();
        self.setup_into(requested, &mut scope).await?;
        Ok(scope)
    }

    /// Construct `requested` into `scope`
    ///
    /// Fixtures are pushed onto `scope` as soon as they provide, so if this
    /// future is dropped part way (a per-test deadline), tearing `scope`
    /// down still releases everything built so far. A constructor that has
    /// not provided yet is aborted with the future.
    pub async fn setup_into(&self, requested: &[&str], scope: &mut FixtureScope) -> E2eResult<()> {
        let plan = self.plan(requested)?;
        let mut built: HashMap<NodeId, FixtureValue> = HashMap::new();

        for node in plan {
            let definition = self.definition(&node).clone();

            let mut deps = FixtureSet::default();
            for dependency in &definition.dependencies {
                let dep = self.resolve_dependency(&node, dependency)?;
                deps.insert(dependency, built[&dep].clone());
            }

            debug!("Setting up fixture '{}' (layer {})", node.0, node.1);
            match start_fixture(&node.0, &definition, deps).await {
                Ok((value, running)) => {
                    scope.trace.push(FixtureEvent::Setup { name: node.0.clone(), layer: node.1 });
                    scope.running.push(RunningFixture {
                        name: node.0.clone(),
                        layer: node.1,
                        teardown_tx: running.0,
                        task: running.1,
                    });
                    built.insert(node, value);
                }
                Err(e) => {
                    if let Err(teardown_error) = scope.teardown().await {
                        warn!("Teardown after failed setup also failed: {}", teardown_error);
                    }
                    return Err(e);
                }
            }
        }

        for name in requested {
            let node = self.top(name, "test")?;
            scope.values.insert(name, built[&node].clone());
        }
        Ok(())
    }

    /// Run `body` with `requested` fixtures, always tearing down afterwards
    pub async fn run<F, Fut, T>(&self, requested: &[&str], body: F) -> E2eResult<T>
    where
        F: FnOnce(FixtureSet) -> Fut,
        Fut: Future<Output = E2eResult<T>>,
    {
        let mut scope = self.setup(requested).await?;
        let result = body(scope.values()).await;
        let teardown = scope.teardown().await;
        let value = result?;
        teardown?;
        Ok(value)
    }
}

type Running = (oneshot::Sender<()>, JoinHandle<E2eResult<()>>);

/// Spawn a constructor and wait for it to provide its value
async fn start_fixture(
    name: &str,
    definition: &Definition,
    deps: FixtureSet,
) -> E2eResult<(FixtureValue, Running)> {
    let (value_tx, value_rx) = oneshot::channel();
    let (teardown_tx, teardown_rx) = oneshot::channel();

    let task = tokio::spawn((definition.constructor)(deps, Use { value_tx, teardown_rx }));
    let pending = PendingConstructor { abort: task.abort_handle(), armed: true };

    let provided = value_rx.await;
    pending.disarm();

    match provided {
        Ok(value) => Ok((value, (teardown_tx, task))),
        // The constructor returned (or panicked) before providing
        Err(_) => match task.await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Err(E2eError::FixtureNotProvided(name.to_string())),
            Err(join_error) => Err(E2eError::FixtureFailed {
                name: name.to_string(),
                reason: join_error.to_string(),
            }),
        },
    }
}

/// Aborts a constructor whose setup was cancelled before it provided
struct PendingConstructor {
    abort: AbortHandle,
    armed: bool,
}

impl PendingConstructor {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConstructor {
    fn drop(&mut self) {
        if self.armed {
            self.abort.abort();
        }
    }
}

struct RunningFixture {
    name: String,
    layer: usize,
    teardown_tx: oneshot::Sender<()>,
    task: JoinHandle<E2eResult<()>>,
}

/// Constructed fixtures of one test
#[derive(Default)]
pub struct FixtureScope {
    values: FixtureSet,
    running: Vec<RunningFixture>,
    trace: Vec<FixtureEvent>,
}

impl FixtureScope {
    /// Requested fixtures by name
    pub fn values(&self) -> FixtureSet {
        self.values.clone()
    }

    pub fn trace(&self) -> &[FixtureEvent] {
        &self.trace
    }

    /// Tear down in reverse construction order
    ///
    /// Every fixture is torn down even if an earlier teardown fails; the
    /// first failure is returned.
    pub async fn teardown(&mut self) -> E2eResult<()> {
        let mut first_error = None;

        while let Some(fixture) = self.running.pop() {
            debug!("Tearing down fixture '{}' (layer {})", fixture.name, fixture.layer);
            let _ = fixture.teardown_tx.send(());

            let outcome = match fixture.task.await {
                Ok(result) => result,
                Err(join_error) => Err(E2eError::FixtureFailed {
                    name: fixture.name.clone(),
                    reason: join_error.to_string(),
                }),
            };
            self.trace.push(FixtureEvent::Teardown { name: fixture.name.clone(), layer: fixture.layer });

            if let Err(e) = outcome {
                warn!("Teardown of fixture '{}' failed: {}", fixture.name, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for FixtureScope {
    fn drop(&mut self) {
        for fixture in self.running.drain(..) {
            fixture.task.abort();
        }
    }
}
