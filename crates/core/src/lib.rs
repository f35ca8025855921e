//! cueflow core types: resources, inventory, instance spec/status, errors.

#![forbid(unsafe_code)]

pub mod condition;
pub mod error;
pub mod event;
pub mod instance;
pub mod inventory;
pub mod resource;

pub use condition::{Condition, ConditionStatus, READY, RECONCILING};
pub use error::ReconcileError;
pub use event::{Event, EventKind, EventSink};
pub use instance::{
    ClusterRef, GateExpr, InstanceSpec, InstanceStatus, ObjectKey, SourceRef, TagVar, Validation,
    ValidationEncoding, ValidationMode,
};
pub use inventory::{RefParts, ResourceInventory, ResourceRef};
pub use resource::Resource;

pub mod prelude {
    pub use super::{
        Condition, ConditionStatus, Event, EventKind, EventSink, InstanceSpec, InstanceStatus,
        ObjectKey, ReconcileError, Resource, ResourceInventory, ResourceRef,
    };
}
