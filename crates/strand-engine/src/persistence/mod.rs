//! Durable persistence of definitions, instances, node states, leases,
//! and events

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    CreateInstanceOptions, InstanceFilter, InstancePatch, InstanceStatus, Lease, NodeInstance,
    NodeStatus, Pagination, StatusCounts, StoreError, WorkflowInstance, WorkflowStore,
};
