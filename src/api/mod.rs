//! Public surface of the element store.
//!
//! [`core::OsmCore`] is the handle web handlers and daemons hold: the write
//! interface (open / apply / close changesets), the watermark-pinned read
//! interface ([`query::QueryReader`]), and the background tasks (materializer
//! shards, changeset sweeper). Everything underneath is reachable through
//! `crate::internal`, but collaborators are expected to stay on this surface.

pub mod core;
pub mod query;

pub use self::core::{CoreStatus, OsmCore};
pub use self::query::QueryReader;
