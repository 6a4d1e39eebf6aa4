//! Lifecycle services.
//!
//! Each service is a cheap, cloneable view over the shared [`crate::store::KiaStore`]. They are
//! listed here in lifecycle order: a pregnancy is opened, visited, closed by a delivery, and the
//! delivered child is then immunized. Statistics read across all of them.

pub mod antenatal;
pub mod delivery;
pub mod immunization;
pub mod pregnancy;
pub mod statistics;
