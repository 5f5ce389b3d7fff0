//! Session networks and alias bookkeeping.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ephemera_common::{EphemeraError, EphemeraResult, ResourceHandle, ResourceId, ResourceKind};
use parking_lot::Mutex;

use crate::runtime::ignore_not_found;
use crate::session::Session;

#[derive(Debug, Default)]
struct NetworkState {
    name: String,
    aliases: HashMap<String, ResourceId>,
    members: HashSet<ResourceId>,
}

/// Creates isolated networks and attaches containers to them under aliases.
///
/// Aliases are unique within a network. Attaching a container to a network
/// it is already on is a no-op. A network cannot be removed while containers
/// are attached.
#[derive(Debug)]
pub struct NetworkFabric {
    session: Arc<Session>,
    networks: Mutex<HashMap<ResourceId, NetworkState>>,
    counter: AtomicUsize,
}

impl NetworkFabric {
    /// Create a fabric for a session.
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            networks: Mutex::new(HashMap::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Create a network with a generated name.
    ///
    /// # Errors
    ///
    /// Returns an error if the reaper cannot be reached or the runtime
    /// refuses the network.
    pub async fn create_network(&self) -> EphemeraResult<ResourceHandle> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("ephemera-{}-{n}", self.session.id().short());
        self.create_network_named(&name).await
    }

    /// Create a network with a given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the reaper cannot be reached or the runtime
    /// refuses the network.
    pub async fn create_network_named(&self, name: &str) -> EphemeraResult<ResourceHandle> {
        let labels = self.session.labels().await?;
        let id = self.session.runtime().create_network(name, &labels).await?;
        let handle = self
            .session
            .register(id.clone(), ResourceKind::Network, labels);
        self.networks.lock().insert(
            id,
            NetworkState {
                name: name.to_string(),
                ..NetworkState::default()
            },
        );
        tracing::info!(network = %name, id = %handle.id.short(), "Network created");
        Ok(handle)
    }

    /// Attach a container under `aliases`.
    ///
    /// # Errors
    ///
    /// - [`EphemeraError::AliasConflict`] if another container holds an alias
    /// - the runtime error if the connect fails
    pub async fn attach(
        &self,
        container: &ResourceId,
        network: &ResourceId,
        aliases: &[String],
    ) -> EphemeraResult<()> {
        {
            let mut networks = self.networks.lock();
            let state = networks.entry(network.clone()).or_insert_with(|| NetworkState {
                name: network.to_string(),
                ..NetworkState::default()
            });
            if state.members.contains(container) {
                tracing::debug!(network = %state.name, container = %container.short(), "Already attached");
                return Ok(());
            }
            for alias in aliases {
                if let Some(owner) = state.aliases.get(alias) {
                    if owner != container {
                        return Err(EphemeraError::AliasConflict {
                            network: state.name.clone(),
                            alias: alias.clone(),
                        });
                    }
                }
            }
            // Reserve before the runtime call so concurrent attaches cannot
            // both claim an alias.
            state.members.insert(container.clone());
            for alias in aliases {
                state.aliases.insert(alias.clone(), container.clone());
            }
        }

        if let Err(e) = self.session.runtime().connect(network, container, aliases).await {
            self.release(network, container);
            return Err(e);
        }
        tracing::info!(network = %network.short(), container = %container.short(), ?aliases, "Attached");
        Ok(())
    }

    /// Detach a container. Detaching a container that is not attached is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the runtime error if the disconnect fails.
    pub async fn detach(&self, container: &ResourceId, network: &ResourceId) -> EphemeraResult<()> {
        let attached = self
            .networks
            .lock()
            .get(network)
            .is_some_and(|s| s.members.contains(container));
        if !attached {
            return Ok(());
        }
        ignore_not_found(self.session.runtime().disconnect(network, container).await)?;
        self.release(network, container);
        tracing::info!(network = %network.short(), container = %container.short(), "Detached");
        Ok(())
    }

    /// Remove a network.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::NetworkBusy`] while containers are attached,
    /// or the runtime error if the removal fails.
    pub async fn remove_network(&self, network: &ResourceId) -> EphemeraResult<()> {
        {
            let networks = self.networks.lock();
            if let Some(state) = networks.get(network) {
                if !state.members.is_empty() {
                    return Err(EphemeraError::NetworkBusy {
                        network: state.name.clone(),
                    });
                }
            }
        }
        ignore_not_found(self.session.runtime().remove_network(network).await)?;
        self.networks.lock().remove(network);
        self.session.registry().deregister(network);
        tracing::info!(network = %network.short(), "Network removed");
        Ok(())
    }

    /// Drop a removed container from every network.
    pub fn forget_container(&self, container: &ResourceId) {
        let mut networks = self.networks.lock();
        for state in networks.values_mut() {
            if state.members.remove(container) {
                state.aliases.retain(|_, owner| owner != container);
            }
        }
    }

    /// Aliases in use on a network.
    #[must_use]
    pub fn aliases(&self, network: &ResourceId) -> BTreeMap<String, ResourceId> {
        self.networks
            .lock()
            .get(network)
            .map(|s| s.aliases.iter().map(|(a, c)| (a.clone(), c.clone())).collect())
            .unwrap_or_default()
    }

    /// Networks a container is attached to.
    #[must_use]
    pub fn networks_of(&self, container: &ResourceId) -> Vec<ResourceId> {
        self.networks
            .lock()
            .iter()
            .filter(|(_, s)| s.members.contains(container))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn release(&self, network: &ResourceId, container: &ResourceId) {
        if let Some(state) = self.networks.lock().get_mut(network) {
            state.members.remove(container);
            state.aliases.retain(|_, owner| owner != container);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CreateConfig, FaultPoint, MemoryRuntime, RuntimeClient};
    use ephemera_common::Settings;

    fn fabric(runtime: &MemoryRuntime) -> NetworkFabric {
        let session = Session::new(
            Arc::new(runtime.clone()),
            Settings::default().with_reaper_disabled(true),
        );
        NetworkFabric::new(Arc::new(session))
    }

    fn aliases(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn alias_must_be_unique() {
        let runtime = MemoryRuntime::new();
        let fabric = fabric(&runtime);
        let net = fabric.create_network().await.unwrap().id;
        let a = runtime.create(&CreateConfig::default()).await.unwrap();
        let b = runtime.create(&CreateConfig::default()).await.unwrap();

        fabric.attach(&a, &net, &aliases(&["db"])).await.unwrap();
        let err = fabric.attach(&b, &net, &aliases(&["cache", "db"])).await.unwrap_err();
        assert!(matches!(err, EphemeraError::AliasConflict { ref alias, .. } if alias == "db"));
        // The failed attach reserved nothing.
        assert_eq!(fabric.aliases(&net).len(), 1);
        fabric.attach(&b, &net, &aliases(&["cache"])).await.unwrap();
    }

    #[tokio::test]
    async fn attaching_twice_is_a_no_op() {
        let runtime = MemoryRuntime::new();
        let fabric = fabric(&runtime);
        let net = fabric.create_network().await.unwrap().id;
        let a = runtime.create(&CreateConfig::default()).await.unwrap();
        fabric.attach(&a, &net, &aliases(&["a"])).await.unwrap();
        fabric.attach(&a, &net, &aliases(&["a"])).await.unwrap();
        assert_eq!(runtime.endpoint_aliases(&net, &a), Some(aliases(&["a"])));
    }

    #[tokio::test]
    async fn busy_until_detached() {
        let runtime = MemoryRuntime::new();
        let fabric = fabric(&runtime);
        let net = fabric.create_network().await.unwrap().id;
        let a = runtime.create(&CreateConfig::default()).await.unwrap();
        fabric.attach(&a, &net, &aliases(&["a"])).await.unwrap();

        let err = fabric.remove_network(&net).await.unwrap_err();
        assert!(matches!(err, EphemeraError::NetworkBusy { .. }));

        fabric.detach(&a, &net).await.unwrap();
        fabric.detach(&a, &net).await.unwrap();
        fabric.remove_network(&net).await.unwrap();
        assert_eq!(runtime.network_count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_releases_aliases() {
        let runtime = MemoryRuntime::new();
        let fabric = fabric(&runtime);
        let net = fabric.create_network().await.unwrap().id;
        let a = runtime.create(&CreateConfig::default()).await.unwrap();
        runtime.fail_next(FaultPoint::Connect, 1);
        assert!(fabric.attach(&a, &net, &aliases(&["a"])).await.is_err());
        assert!(fabric.aliases(&net).is_empty());
        assert!(fabric.networks_of(&a).is_empty());
    }
}
