pub mod common;
pub mod configmap;
pub mod job;
pub mod pdb;
pub mod service;
pub mod statefulset;

pub use common::{API_VERSION, FIELD_MANAGER, FINALIZER, KIND, owner_reference, standard_labels};
