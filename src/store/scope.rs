use std::sync::Arc;

use super::KvBackend;
use crate::ConnectionRole;

/// Which logical connections a store handle talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    /// Shared data: reads and subscriptions on the replica, writes on the
    /// master
    #[default]
    Global,
    /// Per-host data on the local instance
    Local,
}

impl Scope {
    pub fn read_role(self) -> ConnectionRole {
        match self {
            Scope::Global => ConnectionRole::Replica,
            Scope::Local => ConnectionRole::Local,
        }
    }

    pub fn write_role(self) -> ConnectionRole {
        match self {
            Scope::Global => ConnectionRole::Master,
            Scope::Local => ConnectionRole::Local,
        }
    }

    pub fn subscribe_role(self) -> ConnectionRole {
        self.read_role()
    }
}

/// Backends resolved for one scope
#[derive(Clone)]
pub struct ScopedBackends {
    pub read: Arc<dyn KvBackend>,
    pub write: Arc<dyn KvBackend>,
    pub subscribe: Arc<dyn KvBackend>,
}

impl ScopedBackends {
    /// Same backend for every role
    pub fn single(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            read: backend.clone(),
            write: backend.clone(),
            subscribe: backend,
        }
    }
}

impl std::fmt::Debug for ScopedBackends {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ScopedBackends")
            .field("read", &self.read.role())
            .field("write", &self.write.role())
            .field("subscribe", &self.subscribe.role())
            .finish()
    }
}
