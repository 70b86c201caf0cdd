//! Osm-Internal is a library for storing versioned OpenStreetMap elements and
//! incrementally materializing the geometry of the current map.
pub mod api;
pub mod config;
pub mod errors;
pub mod ident;
pub mod internal;
