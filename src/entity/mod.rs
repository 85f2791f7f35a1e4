//! Entity declarations: typed options, descriptors, instances and the registry
//! that maps method names to handlers.

pub mod config;
pub mod descriptor;
pub mod instance;
pub mod registry;

pub use config::{EntityConfig, StoreKind};
pub use descriptor::{EntityDescriptor, MethodDescriptor, MethodHandler, ParamSpec};
pub use instance::EntityInstance;
pub use registry::{EntityRegistry, EntityType, EntityTypeBuilder};
