//! Sitepod custom resources (`stable.sitepod.io/v1`) and their capabilities.

pub mod appcomponent;
pub mod cluster;
pub mod labels;
pub mod podtask;
pub mod sitepod;
pub mod systemuser;
pub mod website;

pub use appcomponent::*;
pub use cluster::*;
pub use podtask::*;
pub use sitepod::*;
pub use systemuser::*;
pub use website::*;

/// A resource that exposes named boolean conditions other resources may set.
pub trait HasCondition {
    /// Set condition `name`. Returns false if the resource has no such condition.
    fn set_condition(&mut self, name: &str, value: bool) -> bool;
}

/// A resource that fills in defaults before it is first stored.
pub trait Defaultable {
    fn apply_defaults(&mut self);
}
