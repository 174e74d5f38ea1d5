//! Domain layer - entities and platform traits

pub mod entities;
pub mod traits;
