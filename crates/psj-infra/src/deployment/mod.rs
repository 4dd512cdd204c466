//! In-process deployments of simulated homeservers.

mod blueprint;
mod network;

pub use blueprint::{Blueprint, HomeserverBlueprint};
pub use network::Network;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use psj_core::ports::ServerDirectory;
use psj_core::{HarnessConfig, ServerName, UserId};

use crate::client::CsApi;
use crate::homeserver::Homeserver;

/// Running homeservers built from a [`Blueprint`].
///
/// Dropping a deployment destroys it.
pub struct Deployment {
    blueprint: &'static str,
    network: Arc<Network>,
    homeservers: BTreeMap<ServerName, Homeserver>,
    config: HarnessConfig,
    destroyed: AtomicBool,
}

impl Deployment {
    pub async fn deploy(blueprint: Blueprint, config: &HarnessConfig) -> Result<Self> {
        let network = Arc::new(Network::new());
        let mut homeservers = BTreeMap::new();

        for hs in &blueprint.homeservers {
            let name = ServerName::from(hs.name);
            let homeserver = Homeserver::new(
                name.clone(),
                network.clone(),
                config.homeserver.clone(),
            );
            for user in &hs.users {
                homeserver.register_user(user);
            }
            let addr = homeserver
                .start()
                .await
                .with_context(|| format!("Failed to start {}", name))?;
            network.register(name.clone(), addr);
            homeservers.insert(name, homeserver);
        }

        tracing::info!(
            blueprint = blueprint.name,
            homeservers = homeservers.len(),
            "deployment ready"
        );
        Ok(Self {
            blueprint: blueprint.name,
            network,
            homeservers,
            config: config.clone(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Name resolution for anything talking to this deployment.
    pub fn directory(&self) -> Arc<dyn ServerDirectory> {
        self.network.clone()
    }

    pub fn homeserver(&self, server: &str) -> Option<&Homeserver> {
        self.homeservers.get(&ServerName::from(server))
    }

    /// Client for a registered user on `server`.
    pub fn client(&self, server: &str, user_id: &str) -> Result<CsApi> {
        let homeserver = self
            .homeserver(server)
            .ok_or_else(|| anyhow!("{} is not part of the {} deployment", server, self.blueprint))?;
        let user_id = UserId::parse(user_id)?;
        let token = homeserver
            .access_token(&user_id)
            .ok_or_else(|| anyhow!("{} is not registered on {}", user_id, server))?;
        CsApi::new(
            homeserver.server_name().clone(),
            user_id,
            token,
            self.directory(),
            &self.config,
        )
    }

    /// Stop and start every homeserver. Stored state survives; addresses
    /// change.
    pub async fn restart(&self) -> Result<()> {
        for (name, homeserver) in &self.homeservers {
            homeserver.stop();
            self.network.unregister(name);
        }
        for (name, homeserver) in &self.homeservers {
            let addr = homeserver
                .start()
                .await
                .with_context(|| format!("Failed to restart {}", name))?;
            self.network.register(name.clone(), addr);
        }
        tracing::info!(blueprint = self.blueprint, "deployment restarted");
        Ok(())
    }

    /// Stop every homeserver. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (name, homeserver) in &self.homeservers {
            homeserver.stop();
            self.network.unregister(name);
        }
        tracing::info!(blueprint = self.blueprint, "deployment destroyed");
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        self.destroy();
    }
}
