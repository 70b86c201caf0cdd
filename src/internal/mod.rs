//! Internal building blocks (element model, store substrate, version log,
//! changesets, commit pipeline, materializer) that power the public APIs.

pub mod changeset;
pub mod commit;
pub mod element;
pub mod log;
pub mod materialize;
pub mod store;
