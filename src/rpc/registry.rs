use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::DiscoveryMode;
use crate::types::{Result, ShardError};

use super::{RoleChannel, RoleType, Transport};

/// Cache of one channel per `(role, index)`.
///
/// Lookups take the read lock; a miss re-checks under the write lock
/// before connecting, so concurrent first use still opens one connection.
pub struct RoleChannelRegistry {
    transport: Arc<dyn Transport>,
    discovery: DiscoveryMode,
    shutdown_timeout: Duration,
    roles: RwLock<HashMap<RoleType, u32>>,
    channels: RwLock<HashMap<(RoleType, u32), Arc<dyn RoleChannel>>>,
}

impl RoleChannelRegistry {
    /// Registry connecting through `transport`.
    pub fn new(
        transport: Arc<dyn Transport>,
        discovery: DiscoveryMode,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            discovery,
            shutdown_timeout,
            roles: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Declares `count` instances of `role`.
    pub fn register_role(&self, role: RoleType, count: u32) {
        self.roles.write().insert(role, count);
        debug!(role = %role, count, "registry.role.registered");
    }

    /// Pre-connects every registered instance under static discovery.
    pub fn start(&self) -> Result<()> {
        if self.discovery != DiscoveryMode::Static {
            return Ok(());
        }
        let roles: Vec<(RoleType, u32)> = self
            .roles
            .read()
            .iter()
            .map(|(role, count)| (*role, *count))
            .collect();
        for (role, count) in roles {
            for index in 0..count {
                self.get_channel(role, index)?;
            }
        }
        info!(channels = self.channels.read().len(), "registry.start");
        Ok(())
    }

    /// Returns the channel to `(role, index)`, connecting on first use.
    pub fn get_channel(&self, role: RoleType, index: u32) -> Result<Arc<dyn RoleChannel>> {
        let count = self
            .roles
            .read()
            .get(&role)
            .copied()
            .ok_or_else(|| ShardError::NetworkConfig(format!("role {role} is not registered")))?;
        if index >= count {
            return Err(ShardError::NetworkConfig(format!(
                "{role} index {index} out of range (count {count})"
            )));
        }
        if let Some(channel) = self.channels.read().get(&(role, index)) {
            return Ok(Arc::clone(channel));
        }
        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(&(role, index)) {
            return Ok(Arc::clone(channel));
        }
        let channel = self.transport.connect(role, index)?;
        channels.insert((role, index), Arc::clone(&channel));
        debug!(role = %role, index, "registry.channel.created");
        Ok(channel)
    }

    /// Number of cached channels.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Shuts every channel down, waiting up to the shutdown timeout for each.
    pub fn stop(&self) {
        let channels: Vec<((RoleType, u32), Arc<dyn RoleChannel>)> =
            self.channels.write().drain().collect();
        for ((role, index), channel) in channels {
            if !channel.shutdown(self.shutdown_timeout) {
                warn!(role = %role, index, "registry.channel.shutdown_timeout");
            }
        }
        info!("registry.stop");
    }
}
