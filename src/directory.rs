//! Ownership lookups for the entities a booking references.
//!
//! Accounts, businesses, services and clients live outside the engine. The
//! engine only needs to know which business each of them belongs to.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Subject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Staff(Ulid),
    Resource(Ulid),
    Service(Ulid),
    Client(Ulid),
}

impl EntityRef {
    pub fn kind(&self) -> &'static str {
        match self {
            EntityRef::Staff(_) => "staff",
            EntityRef::Resource(_) => "resource",
            EntityRef::Service(_) => "service",
            EntityRef::Client(_) => "client",
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            EntityRef::Staff(id)
            | EntityRef::Resource(id)
            | EntityRef::Service(id)
            | EntityRef::Client(id) => *id,
        }
    }
}

impl From<Subject> for EntityRef {
    fn from(subject: Subject) -> Self {
        match subject {
            Subject::Staff(id) => EntityRef::Staff(id),
            Subject::Resource(id) => EntityRef::Resource(id),
        }
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Owning business of `entity`, or `None` if the entity is unknown.
    async fn business_of(&self, entity: EntityRef) -> Option<Ulid>;
}

/// Directory held in memory, filled by the host application.
#[derive(Default)]
pub struct MemoryDirectory {
    owners: DashMap<EntityRef, Ulid>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: EntityRef, business_id: Ulid) {
        self.owners.insert(entity, business_id);
    }

    pub fn remove(&self, entity: EntityRef) {
        self.owners.remove(&entity);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn business_of(&self, entity: EntityRef) -> Option<Ulid> {
        self.owners.get(&entity).map(|e| *e.value())
    }
}
