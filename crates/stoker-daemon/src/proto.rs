//! The daemon's four remote interfaces.
//!
//! These are the surfaces a transport layer exposes to the outside
//! world: activation requests, registration and administration, the
//! group-side monitor callbacks, and a minimal read-only registry that
//! only ever hands out the system's own reference. Each call first
//! enters through [`crate::export::ExportSet`], so a daemon in shutdown
//! refuses work instead of racing it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::daemon::{ActivationDaemon, ActivationError};
use crate::export::Iface;
use crate::group::{
    GroupDesc, GroupId, GroupInstantiator, MarshalledProxy, ObjectDesc, ObjectId,
};

/// The well-known name the registry binds the activation system under.
pub const SYSTEM_NAME: &str = "stoker.ActivationSystem";

/// Object activation.
#[async_trait]
pub trait Activator: Send + Sync {
    /// Return a proxy for the object, instantiating it in its group's
    /// child process if needed. `force` bypasses the cached proxy.
    async fn activate(
        &self,
        object: ObjectId,
        force: bool,
    ) -> Result<MarshalledProxy, ActivationError>;
}

/// Registration and administration.
#[async_trait]
pub trait ActivationSystem: Send + Sync {
    async fn register_object(
        &self,
        group: GroupId,
        desc: ObjectDesc,
    ) -> Result<ObjectId, ActivationError>;

    async fn unregister_object(&self, object: ObjectId) -> Result<(), ActivationError>;

    async fn register_group(&self, desc: GroupDesc) -> Result<GroupId, ActivationError>;

    async fn unregister_group(&self, group: GroupId) -> Result<(), ActivationError>;

    /// A spawned group process registers itself as live.
    async fn active_group(
        &self,
        group: GroupId,
        incarnation: u64,
        instantiator: Arc<dyn GroupInstantiator>,
    ) -> Result<(), ActivationError>;

    async fn set_object_desc(
        &self,
        object: ObjectId,
        desc: ObjectDesc,
    ) -> Result<ObjectDesc, ActivationError>;

    async fn set_group_desc(
        &self,
        group: GroupId,
        desc: GroupDesc,
    ) -> Result<GroupDesc, ActivationError>;

    async fn object_desc(&self, object: ObjectId) -> Result<ObjectDesc, ActivationError>;

    async fn group_desc(&self, group: GroupId) -> Result<GroupDesc, ActivationError>;

    async fn groups(&self) -> Result<HashMap<GroupId, GroupDesc>, ActivationError>;

    async fn activatable_objects(
        &self,
    ) -> Result<HashMap<ObjectId, ObjectDesc>, ActivationError>;

    async fn shutdown(&self) -> Result<(), ActivationError>;
}

/// Callbacks from group processes about object and group liveness.
#[async_trait]
pub trait ActivationMonitor: Send + Sync {
    async fn active_object(
        &self,
        object: ObjectId,
        proxy: MarshalledProxy,
    ) -> Result<(), ActivationError>;

    async fn inactive_object(&self, object: ObjectId) -> Result<(), ActivationError>;

    async fn inactive_group(
        &self,
        group: GroupId,
        incarnation: u64,
    ) -> Result<(), ActivationError>;
}

/// A minimal name registry. Lookup only; every mutation is refused.
#[async_trait]
pub trait SystemRegistry: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<MarshalledProxy, ActivationError>;

    async fn list(&self) -> Result<Vec<String>, ActivationError>;

    async fn bind(&self, name: &str, proxy: MarshalledProxy) -> Result<(), ActivationError>;

    async fn rebind(&self, name: &str, proxy: MarshalledProxy) -> Result<(), ActivationError>;

    async fn unbind(&self, name: &str) -> Result<(), ActivationError>;
}

#[async_trait]
impl Activator for Arc<ActivationDaemon> {
    async fn activate(
        &self,
        object: ObjectId,
        force: bool,
    ) -> Result<MarshalledProxy, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::Activator)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).activate(object, force).await
    }
}

#[async_trait]
impl ActivationSystem for Arc<ActivationDaemon> {
    async fn register_object(
        &self,
        group: GroupId,
        desc: ObjectDesc,
    ) -> Result<ObjectId, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).register_object(group, desc).await
    }

    async fn unregister_object(&self, object: ObjectId) -> Result<(), ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).unregister_object(object).await
    }

    async fn register_group(&self, desc: GroupDesc) -> Result<GroupId, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).register_group(desc).await
    }

    async fn unregister_group(&self, group: GroupId) -> Result<(), ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).unregister_group(group).await
    }

    async fn active_group(
        &self,
        group: GroupId,
        incarnation: u64,
        instantiator: Arc<dyn GroupInstantiator>,
    ) -> Result<(), ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).active_group(group, incarnation, instantiator).await
    }

    async fn set_object_desc(
        &self,
        object: ObjectId,
        desc: ObjectDesc,
    ) -> Result<ObjectDesc, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).set_object_desc(object, desc).await
    }

    async fn set_group_desc(
        &self,
        group: GroupId,
        desc: GroupDesc,
    ) -> Result<GroupDesc, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).set_group_desc(group, desc).await
    }

    async fn object_desc(&self, object: ObjectId) -> Result<ObjectDesc, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).object_desc(object).await
    }

    async fn group_desc(&self, group: GroupId) -> Result<GroupDesc, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).group_desc(group).await
    }

    async fn groups(&self) -> Result<HashMap<GroupId, GroupDesc>, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        Ok((**self).groups().await)
    }

    async fn activatable_objects(
        &self,
    ) -> Result<HashMap<ObjectId, ObjectDesc>, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        Ok((**self).activatable_objects().await)
    }

    async fn shutdown(&self) -> Result<(), ActivationError> {
        let guard = self
            .exports()
            .enter(Iface::System)
            .ok_or(ActivationError::ShuttingDown)?;
        // The shutdown sequence unexports this very interface; holding
        // our own call guard would deadlock the drain.
        drop(guard);
        (**self).shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl ActivationMonitor for Arc<ActivationDaemon> {
    async fn active_object(
        &self,
        object: ObjectId,
        proxy: MarshalledProxy,
    ) -> Result<(), ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::Monitor)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).active_object(object, proxy).await
    }

    async fn inactive_object(&self, object: ObjectId) -> Result<(), ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::Monitor)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).inactive_object(object).await
    }

    async fn inactive_group(
        &self,
        group: GroupId,
        incarnation: u64,
    ) -> Result<(), ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::Monitor)
            .ok_or(ActivationError::ShuttingDown)?;
        (**self).inactive_group(group, incarnation).await
    }
}

#[async_trait]
impl SystemRegistry for Arc<ActivationDaemon> {
    async fn lookup(&self, name: &str) -> Result<MarshalledProxy, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::Registry)
            .ok_or(ActivationError::ShuttingDown)?;
        if name == SYSTEM_NAME {
            Ok(self.system_ref().clone())
        } else {
            Err(ActivationError::NotBound {
                name: name.to_string(),
            })
        }
    }

    async fn list(&self) -> Result<Vec<String>, ActivationError> {
        let _guard = self
            .exports()
            .enter(Iface::Registry)
            .ok_or(ActivationError::ShuttingDown)?;
        Ok(vec![SYSTEM_NAME.to_string()])
    }

    async fn bind(&self, _name: &str, _proxy: MarshalledProxy) -> Result<(), ActivationError> {
        Err(ActivationError::ReadOnlyRegistry)
    }

    async fn rebind(&self, _name: &str, _proxy: MarshalledProxy) -> Result<(), ActivationError> {
        Err(ActivationError::ReadOnlyRegistry)
    }

    async fn unbind(&self, _name: &str) -> Result<(), ActivationError> {
        Err(ActivationError::ReadOnlyRegistry)
    }
}
