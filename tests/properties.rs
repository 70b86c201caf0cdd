//! Property tests for the pure codecs plus a randomized walk over the
//! commit pipeline that checks the log-level invariants the rest of the
//! system leans on.

use quickcheck::{TestResult, quickcheck};
use rand::RngExt;
use tokio_util::sync::CancellationToken;

use osm_internal::api::OsmCore;
use osm_internal::config::CoreConfig;
use osm_internal::errors::OsmError;
use osm_internal::ident::{ElementKind, ElementRef, MAX_ELEMENT_ID, TypedId};
use osm_internal::internal::commit::Mutation;
use osm_internal::internal::element::TagMap;
use osm_internal::internal::element::body::Body;
use osm_internal::internal::element::bounds::{Bounds, Coord};
use osm_internal::internal::element::cell::{CellId, MAX_ZOOM};
use osm_internal::internal::materialize::drain_worker;
use osm_internal::internal::store::memory::MemStore;

fn kind_of(selector: u8) -> ElementKind {
    ElementKind::ALL[(selector % 3) as usize]
}

quickcheck! {
    fn typed_id_round_trips(selector: u8, id: u64) -> TestResult {
        let kind = kind_of(selector);
        let id = id % (MAX_ELEMENT_ID + 1);
        if id == 0 {
            return TestResult::from_bool(TypedId::new(kind, id).is_err());
        }
        let typed = TypedId::new(kind, id).unwrap();
        TestResult::from_bool(
            typed.decode() == (kind, id) && TypedId::from_raw(typed.raw()).unwrap() == typed,
        )
    }

    fn element_refs_round_trip_through_display(selector: u8, id: u64, version: u64) -> TestResult {
        let kind = kind_of(selector);
        let id = id % (MAX_ELEMENT_ID + 1);
        if id == 0 || version == 0 {
            return TestResult::discard();
        }
        let reference = ElementRef::new(TypedId::new(kind, id).unwrap(), version);
        let parsed: ElementRef = reference.to_string().parse().unwrap();
        TestResult::from_bool(parsed == reference)
    }

    fn cell_quadkeys_round_trip(lon: f64, lat: f64, zoom: u8) -> TestResult {
        if !lon.is_finite() || !lat.is_finite() || lon.abs() > 180.0 || lat.abs() > 90.0 {
            return TestResult::discard();
        }
        let cell = CellId::at(Coord::new(lon, lat), zoom % (MAX_ZOOM + 1));
        TestResult::from_bool(CellId::from_quadkey(&cell.quadkey()) == Some(cell))
    }

    fn bounds_union_contains_both(a_lon: f64, a_lat: f64, b_lon: f64, b_lat: f64) -> TestResult {
        if ![a_lon, a_lat, b_lon, b_lat].iter().all(|v| v.is_finite()) {
            return TestResult::discard();
        }
        let a = Bounds::point(Coord::new(a_lon, a_lat));
        let b = Bounds::point(Coord::new(b_lon, b_lat));
        let union = a.union(&b);
        TestResult::from_bool(
            union.contains(Coord::new(a_lon, a_lat)) && union.contains(Coord::new(b_lon, b_lat)),
        )
    }
}

/// Random creates, moves and deletes; afterwards every element's history is
/// gapless with exactly one latest row, the changeset accounting matches,
/// and draining advances the watermark monotonically.
#[tokio::test]
async fn random_edit_walk_preserves_log_invariants() {
    let core = OsmCore::open(MemStore::new(), CoreConfig::default())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let changeset = core
        .open_changeset(None, TagMap::new(), &cancel)
        .await
        .unwrap();

    let mut rng = rand::rng();
    // (id, latest version, deleted) per created node.
    let mut nodes: Vec<(TypedId, u64, bool)> = Vec::new();
    let mut applied = 0u64;
    let mut last_hwm = 0;

    for round in 0..60 {
        let roll: u8 = rng.random_range(0..10);
        let mutation = if nodes.is_empty() || roll < 4 {
            Mutation::Create {
                kind: ElementKind::Node,
                tags: TagMap::new(),
                body: Body::Node {
                    lon: rng.random_range(-180.0..180.0),
                    lat: rng.random_range(-90.0..90.0),
                },
            }
        } else {
            let pick = rng.random_range(0..nodes.len());
            let (id, version, deleted) = nodes[pick];
            if deleted {
                continue;
            }
            if roll < 8 {
                Mutation::Modify {
                    id,
                    base_version: version,
                    tags: TagMap::new(),
                    body: Body::Node {
                        lon: rng.random_range(-180.0..180.0),
                        lat: rng.random_range(-90.0..90.0),
                    },
                }
            } else {
                Mutation::Delete {
                    id,
                    base_version: version,
                }
            }
        };

        let receipt = core.apply(changeset, &[mutation.clone()], &cancel).await.unwrap();
        applied += 1;
        match mutation {
            Mutation::Create { .. } => nodes.push((receipt.created[0], 1, false)),
            Mutation::Modify { id, .. } => {
                let entry = nodes.iter_mut().find(|(n, ..)| *n == id).unwrap();
                entry.1 += 1;
            }
            Mutation::Delete { id, .. } => {
                let entry = nodes.iter_mut().find(|(n, ..)| *n == id).unwrap();
                entry.1 += 1;
                entry.2 = true;
            }
        }

        // Drain now and then; the watermark may only move forward.
        if round % 7 == 0 {
            let mut worker = core.materializer().worker(0);
            drain_worker(&mut worker).await.unwrap();
            let hwm = core.watermark().await.unwrap();
            assert!(hwm >= last_hwm, "watermark moved backwards");
            last_hwm = hwm;
        }
    }

    let mut worker = core.materializer().worker(0);
    drain_worker(&mut worker).await.unwrap();
    let reader = core.reader(None).await.unwrap();

    for (id, version, deleted) in &nodes {
        let history = reader.history(*id, 0, 1_000).await.unwrap();
        // Gapless versions starting at 1.
        assert_eq!(
            history.iter().map(|r| r.version).collect::<Vec<_>>(),
            (1..=*version).collect::<Vec<_>>()
        );
        // Exactly one latest row, and it is the highest version.
        let latest: Vec<_> = history.iter().filter(|r| r.latest).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, *version);
        assert_eq!(latest[0].visible, !*deleted);
        // Deleted elements have no geometry; live ones do.
        let geometry = reader.get_geometry(*id).await.unwrap();
        assert_eq!(geometry.is_some(), !*deleted);
    }

    let row = reader.get_changeset(changeset).await.unwrap();
    assert_eq!(row.size, applied);
    assert_eq!(
        row.size,
        row.counts.creates + row.counts.modifies + row.counts.deletes
    );
}

/// The commit envelope of every batch lands as a bounds row, and the union
/// bounds covers each of them.
#[tokio::test]
async fn changeset_union_bounds_cover_commit_bounds() {
    let core = OsmCore::open(MemStore::new(), CoreConfig::default())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let changeset = core
        .open_changeset(None, TagMap::new(), &cancel)
        .await
        .unwrap();

    for (lon, lat) in [(2.0, 49.0), (-120.0, 45.0), (151.0, -33.0)] {
        core.apply(
            changeset,
            &[Mutation::Create {
                kind: ElementKind::Node,
                tags: TagMap::new(),
                body: Body::Node { lon, lat },
            }],
            &cancel,
        )
        .await
        .unwrap();
    }

    let mut worker = core.materializer().worker(0);
    drain_worker(&mut worker).await.unwrap();
    let reader = core.reader(None).await.unwrap();
    let row = reader.get_changeset(changeset).await.unwrap();
    let union = row.bounds.expect("bounds recorded");
    for (lon, lat) in [(2.0, 49.0), (-120.0, 45.0), (151.0, -33.0)] {
        assert!(union.contains(Coord::new(lon, lat)));
    }
}

/// Query result caps surface as `TooManyResults` instead of truncation.
#[tokio::test]
async fn result_caps_are_explicit() {
    let core = OsmCore::open(
        MemStore::new(),
        CoreConfig {
            query_result_limit: 2,
            ..CoreConfig::default()
        },
    )
    .await
    .unwrap();
    let cancel = CancellationToken::new();
    let changeset = core
        .open_changeset(None, TagMap::new(), &cancel)
        .await
        .unwrap();

    for i in 0..4 {
        core.apply(
            changeset,
            &[Mutation::Create {
                kind: ElementKind::Node,
                tags: TagMap::new(),
                body: Body::Node {
                    lon: 1.0 + i as f64 * 0.001,
                    lat: 1.0,
                },
            }],
            &cancel,
        )
        .await
        .unwrap();
    }
    let mut worker = core.materializer().worker(0);
    drain_worker(&mut worker).await.unwrap();

    let reader = core.reader(None).await.unwrap();
    let wide = Bounds::from_corners(Coord::new(0.0, 0.0), Coord::new(2.0, 2.0));
    assert!(matches!(
        reader.elements_in_bbox(&wide, &[]).await,
        Err(OsmError::TooManyResults(2))
    ));
}
