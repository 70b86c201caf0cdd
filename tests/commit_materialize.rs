//! End-to-end tests that commit mutation batches, drive the materializer to
//! drain the staging queue, and assert geometry and watermark behavior
//! through the public read surface.

use tokio_util::sync::CancellationToken;

use osm_internal::api::OsmCore;
use osm_internal::config::{CoreConfig, ReferencePolicy, RelationGeometry};
use osm_internal::errors::OsmError;
use osm_internal::ident::{ElementKind, TypedId};
use osm_internal::internal::commit::Mutation;
use osm_internal::internal::element::TagMap;
use osm_internal::internal::element::body::{Body, Member};
use osm_internal::internal::element::bounds::{Bounds, Coord};
use osm_internal::internal::element::cell::CellId;
use osm_internal::internal::element::geometry::Geometry;
use osm_internal::internal::materialize::drain_worker;
use osm_internal::internal::store::memory::MemStore;

async fn core_with(config: CoreConfig) -> OsmCore<MemStore> {
    OsmCore::open(MemStore::new(), config).await.unwrap()
}

async fn core() -> OsmCore<MemStore> {
    core_with(CoreConfig::default()).await
}

fn create_node(lon: f64, lat: f64) -> Mutation {
    Mutation::Create {
        kind: ElementKind::Node,
        tags: TagMap::new(),
        body: Body::Node { lon, lat },
    }
}

fn create_way(refs: Vec<TypedId>) -> Mutation {
    Mutation::Create {
        kind: ElementKind::Way,
        tags: TagMap::new(),
        body: Body::Way { refs },
    }
}

fn move_node(id: TypedId, base_version: u64, lon: f64, lat: f64) -> Mutation {
    Mutation::Modify {
        id,
        base_version,
        tags: TagMap::new(),
        body: Body::Node { lon, lat },
    }
}

async fn drain(core: &OsmCore<MemStore>) -> usize {
    let mut worker = core.materializer().worker(0);
    drain_worker(&mut worker).await.unwrap()
}

/// Scenario: create one node, expect a materialized point and an advanced
/// watermark.
#[tokio::test]
async fn create_node_materializes_a_point() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let receipt = core
        .apply(changeset, &[create_node(2.0, 49.0)], &cancel)
        .await
        .unwrap();
    let node = receipt.created[0];
    assert_eq!(node.kind(), ElementKind::Node);

    drain(&core).await;
    assert!(core.watermark().await.unwrap() >= receipt.sequence);

    let reader = core.reader(None).await.unwrap();
    let row = reader.get_element(node, None).await.unwrap();
    assert_eq!(row.version, 1);
    assert!(row.latest);
    assert_eq!(
        reader.get_geometry(node).await.unwrap(),
        Some(Geometry::Point(Coord::new(2.0, 49.0)))
    );
}

/// Scenario: a way over three nodes materializes as their line string.
#[tokio::test]
async fn way_materializes_over_its_nodes() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let nodes = core
        .apply(
            changeset,
            &[
                create_node(0.0, 0.0),
                create_node(1.0, 0.0),
                create_node(1.0, 1.0),
            ],
            &cancel,
        )
        .await
        .unwrap()
        .created;
    let way = core
        .apply(changeset, &[create_way(nodes.clone())], &cancel)
        .await
        .unwrap()
        .created[0];

    drain(&core).await;
    let reader = core.reader(None).await.unwrap();
    assert_eq!(
        reader.get_geometry(way).await.unwrap(),
        Some(Geometry::LineString(vec![
            Coord::new(0.0, 0.0),
            Coord::new(1.0, 0.0),
            Coord::new(1.0, 1.0),
        ]))
    );
    assert_eq!(reader.parents_of(nodes[1]).await.unwrap(), vec![way]);
}

/// Scenario: moving a node rewrites its way in the same batch, and the
/// watermark only advances past the move once the way is rewritten.
#[tokio::test]
async fn node_move_propagates_to_the_way() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let nodes = core
        .apply(
            changeset,
            &[
                create_node(0.0, 0.0),
                create_node(1.0, 0.0),
                create_node(1.0, 1.0),
            ],
            &cancel,
        )
        .await
        .unwrap()
        .created;
    let way = core
        .apply(changeset, &[create_way(nodes.clone())], &cancel)
        .await
        .unwrap()
        .created[0];
    drain(&core).await;

    let receipt = core
        .apply(changeset, &[move_node(nodes[1], 1, 1.0, 0.5)], &cancel)
        .await
        .unwrap();

    // One batch drains the move and rewrites the dependent way.
    let mut worker = core.materializer().worker(0);
    assert!(worker.tick().await.unwrap() >= 1);

    let hwm = core.watermark().await.unwrap();
    assert!(hwm >= receipt.sequence);
    let reader = core.reader(None).await.unwrap();
    assert_eq!(
        reader.get_geometry(way).await.unwrap(),
        Some(Geometry::LineString(vec![
            Coord::new(0.0, 0.0),
            Coord::new(1.0, 0.5),
            Coord::new(1.0, 1.0),
        ]))
    );
}

/// Scenario: deleting a node under the lenient policy elides it from the
/// way and records the gap.
#[tokio::test]
async fn lenient_delete_elides_the_node_and_annotates() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let nodes = core
        .apply(
            changeset,
            &[
                create_node(0.0, 0.0),
                create_node(1.0, 0.0),
                create_node(1.0, 1.0),
            ],
            &cancel,
        )
        .await
        .unwrap()
        .created;
    let way = core
        .apply(changeset, &[create_way(nodes.clone())], &cancel)
        .await
        .unwrap()
        .created[0];
    drain(&core).await;

    core.apply(
        changeset,
        &[Mutation::Delete {
            id: nodes[1],
            base_version: 1,
        }],
        &cancel,
    )
    .await
    .unwrap();
    drain(&core).await;

    let reader = core.reader(None).await.unwrap();
    assert_eq!(reader.get_geometry(nodes[1]).await.unwrap(), None);
    assert_eq!(
        reader.get_geometry(way).await.unwrap(),
        Some(Geometry::LineString(vec![
            Coord::new(0.0, 0.0),
            Coord::new(1.0, 1.0),
        ]))
    );
    let row = reader.spatial_row(way).await.unwrap().unwrap();
    assert_eq!(row.gaps, vec![nodes[1]]);
}

/// Scenario: under the strict policy the way loses its materialized row
/// entirely when a node goes missing.
#[tokio::test]
async fn strict_delete_makes_the_way_unresolvable() {
    let core = core_with(CoreConfig {
        reference_policy: ReferencePolicy::Strict,
        ..CoreConfig::default()
    })
    .await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let nodes = core
        .apply(
            changeset,
            &[create_node(0.0, 0.0), create_node(1.0, 0.0)],
            &cancel,
        )
        .await
        .unwrap()
        .created;
    let way = core
        .apply(changeset, &[create_way(nodes.clone())], &cancel)
        .await
        .unwrap()
        .created[0];
    drain(&core).await;
    let reader = core.reader(None).await.unwrap();
    assert!(reader.get_geometry(way).await.unwrap().is_some());

    core.apply(
        changeset,
        &[Mutation::Delete {
            id: nodes[0],
            base_version: 1,
        }],
        &cancel,
    )
    .await
    .unwrap();
    drain(&core).await;

    let reader = core.reader(None).await.unwrap();
    assert_eq!(reader.get_geometry(way).await.unwrap(), None);
}

/// Scenario: two writers race on the same base version; exactly one wins
/// and the log has no gaps.
#[tokio::test]
async fn concurrent_modifies_conflict_on_base_version() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();
    let node = core
        .apply(changeset, &[create_node(0.0, 0.0)], &cancel)
        .await
        .unwrap()
        .created[0];

    let first = core
        .apply(changeset, &[move_node(node, 1, 0.0, 1.0)], &cancel)
        .await;
    let second = core
        .apply(changeset, &[move_node(node, 1, 0.0, 2.0)], &cancel)
        .await;

    assert!(first.is_ok());
    assert!(matches!(
        second,
        Err(OsmError::VersionConflict { base: 1, latest: 2, .. })
    ));

    drain(&core).await;
    let reader = core.reader(None).await.unwrap();
    let history = reader.history(node, 0, 10).await.unwrap();
    assert_eq!(
        history.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

/// Scenario: the fourth mutation overflows a three-edit changeset with no
/// partial effect.
#[tokio::test]
async fn oversize_changeset_rejects_the_fourth_edit() {
    let core = core_with(CoreConfig {
        max_changeset_size: 3,
        ..CoreConfig::default()
    })
    .await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    for i in 0..3 {
        core.apply(changeset, &[create_node(i as f64, 0.0)], &cancel)
            .await
            .unwrap();
    }
    let result = core
        .apply(changeset, &[create_node(9.0, 9.0)], &cancel)
        .await;
    assert!(matches!(result, Err(OsmError::ChangesetOversize { .. })));

    drain(&core).await;
    let reader = core.reader(None).await.unwrap();
    let row = reader.get_changeset(changeset).await.unwrap();
    assert_eq!(row.size, 3);
    assert_eq!(row.counts.creates, 3);
}

/// Relations materialize as collections of their members, or as envelopes
/// when configured that way.
#[tokio::test]
async fn relation_geometry_follows_configuration() {
    for (mode, expect_envelope) in [
        (RelationGeometry::Collection, false),
        (RelationGeometry::Envelope, true),
    ] {
        let core = core_with(CoreConfig {
            relation_geometry: mode,
            ..CoreConfig::default()
        })
        .await;
        let cancel = CancellationToken::new();
        let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

        let nodes = core
            .apply(
                changeset,
                &[create_node(0.0, 0.0), create_node(2.0, 2.0)],
                &cancel,
            )
            .await
            .unwrap()
            .created;
        let way = core
            .apply(changeset, &[create_way(nodes.clone())], &cancel)
            .await
            .unwrap()
            .created[0];
        let relation = core
            .apply(
                changeset,
                &[Mutation::Create {
                    kind: ElementKind::Relation,
                    tags: TagMap::new(),
                    body: Body::Relation {
                        members: vec![
                            Member::new("outer", way),
                            Member::new("marker", nodes[0]),
                        ],
                    },
                }],
                &cancel,
            )
            .await
            .unwrap()
            .created[0];

        drain(&core).await;
        let reader = core.reader(None).await.unwrap();
        let geom = reader.get_geometry(relation).await.unwrap().unwrap();
        match geom {
            Geometry::Envelope(bounds) => {
                assert!(expect_envelope);
                assert!(bounds.contains(Coord::new(2.0, 2.0)));
            }
            Geometry::Collection(parts) => {
                assert!(!expect_envelope);
                assert_eq!(parts.len(), 2);
            }
            other => panic!("unexpected relation geometry {other:?}"),
        }
    }
}

/// Spatial queries answer from the materialized state at the watermark.
#[tokio::test]
async fn bbox_and_cell_queries_find_materialized_elements() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let nodes = core
        .apply(
            changeset,
            &[create_node(2.0, 49.0), create_node(120.0, -30.0)],
            &cancel,
        )
        .await
        .unwrap()
        .created;
    drain(&core).await;

    let reader = core.reader(None).await.unwrap();
    let query = Bounds::from_corners(Coord::new(0.0, 45.0), Coord::new(5.0, 52.0));
    let hits = reader
        .elements_in_bbox(&query, &[ElementKind::Node])
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, nodes[0]);

    let cells = CellId::cover(&query, 64);
    let hits = reader
        .elements_in_cells(&cells, &[ElementKind::Node])
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, nodes[0]);

    // Kind filtering excludes everything here.
    let none = reader
        .elements_in_bbox(&query, &[ElementKind::Relation])
        .await
        .unwrap();
    assert!(none.is_empty());
}

/// Changeset lifecycle through the facade: close, then reject further work;
/// bbox search over recorded commit bounds finds the changeset.
#[tokio::test]
async fn changeset_lifecycle_and_bbox_search() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core
        .open_changeset(Some(42), TagMap::new(), &cancel)
        .await
        .unwrap();

    core.apply(changeset, &[create_node(10.0, 10.0)], &cancel)
        .await
        .unwrap();
    core.close_changeset(changeset, &cancel).await.unwrap();

    let result = core.apply(changeset, &[create_node(11.0, 11.0)], &cancel).await;
    assert!(matches!(result, Err(OsmError::ChangesetClosed(_))));

    drain(&core).await;
    let reader = core.reader(None).await.unwrap();
    let around = Bounds::from_corners(Coord::new(9.0, 9.0), Coord::new(11.0, 11.0));
    let found = reader.changesets_in_bbox(&around).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, changeset);
    assert_eq!(
        reader.changesets_by_user(42).await.unwrap()[0].id,
        changeset
    );
}

/// Replaying an identical batch is deduplicated by fingerprint and returns
/// the original receipt.
#[tokio::test]
async fn replayed_batches_are_idempotent() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let batch = vec![create_node(5.0, 5.0)];
    let first = core.apply(changeset, &batch, &cancel).await.unwrap();
    let replay = core.apply(changeset, &batch, &cancel).await.unwrap();
    assert_eq!(first, replay);

    drain(&core).await;
    let reader = core.reader(None).await.unwrap();
    assert_eq!(reader.get_changeset(changeset).await.unwrap().size, 1);
}

/// The watermark is monotonic across an arbitrary interleaving of commits
/// and drains, and pinned readers stay stable.
#[tokio::test]
async fn watermark_is_monotonic_and_pins_readers() {
    let core = core().await;
    let cancel = CancellationToken::new();
    let changeset = core.open_changeset(None, TagMap::new(), &cancel).await.unwrap();

    let node = core
        .apply(changeset, &[create_node(1.0, 1.0)], &cancel)
        .await
        .unwrap()
        .created[0];
    drain(&core).await;
    let pin = core.pin().await.unwrap();
    let first_hwm = pin.hwm;
    let pinned = core.reader(Some(pin)).await.unwrap();

    core.apply(changeset, &[move_node(node, 1, 8.0, 8.0)], &cancel)
        .await
        .unwrap();
    drain(&core).await;
    let second_hwm = core.watermark().await.unwrap();
    assert!(second_hwm > first_hwm);

    // The pinned reader still sees the original point.
    assert_eq!(
        pinned.get_geometry(node).await.unwrap(),
        Some(Geometry::Point(Coord::new(1.0, 1.0)))
    );
    let current = core.reader(None).await.unwrap();
    assert_eq!(
        current.get_geometry(node).await.unwrap(),
        Some(Geometry::Point(Coord::new(8.0, 8.0)))
    );
}
