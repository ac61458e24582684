//! Core data structures for profile construction.

pub mod platemap;
pub mod store;
pub mod table;

pub use platemap::{resolve_platemap, BarcodeMap, Platemap};
pub use store::{CompartmentTable, ImageTable, MeasurementStore};
pub use table::{Column, ProfileTable, METADATA_PREFIX};
