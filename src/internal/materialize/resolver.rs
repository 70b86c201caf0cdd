//! Transitive dependents of a set of changed elements: the ways referencing
//! changed nodes and the relations referencing changed ways or relations,
//! walked breadth-first through the latest-membership index.

use std::collections::BTreeMap;

use crate::errors::OsmError;
use crate::ident::TypedId;
use crate::internal::log::ElementLog;
use crate::internal::store::StoreRead;

pub struct DependencyResolver;

impl DependencyResolver {
    /// Expand a seed set to every element whose geometry may change when the
    /// seeds do, mapped to its dependency depth (seeds are depth 0, their
    /// direct parents 1, and so on). The walk is bounded by `max_depth` and
    /// the result map doubles as the visited set, so relation membership
    /// cycles terminate with the lowest depth winning.
    pub async fn dependents<R: StoreRead + ?Sized>(
        reader: &R,
        seeds: impl IntoIterator<Item = TypedId>,
        max_depth: usize,
    ) -> Result<BTreeMap<TypedId, u32>, OsmError> {
        let mut depths: BTreeMap<TypedId, u32> = BTreeMap::new();
        let mut frontier: Vec<TypedId> = Vec::new();
        for seed in seeds {
            if depths.insert(seed, 0).is_none() {
                frontier.push(seed);
            }
        }

        for depth in 1..=max_depth as u32 {
            let mut next = Vec::new();
            for id in frontier {
                for parent in ElementLog::parents_of(reader, id, usize::MAX).await? {
                    if !depths.contains_key(&parent) {
                        depths.insert(parent, depth);
                        next.push(parent);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ident::ElementKind;
    use crate::internal::element::TagMap;
    use crate::internal::element::body::{Body, Member};
    use crate::internal::element::version::ElementVersion;
    use crate::internal::store::Store;
    use crate::internal::store::StoreTxn;
    use crate::internal::store::memory::MemStore;

    fn id(kind: ElementKind, n: u64) -> TypedId {
        TypedId::new(kind, n).unwrap()
    }

    async fn append(store: &MemStore, element: TypedId, body: Body, sequence: u64) {
        let mut txn = store.begin().await.unwrap();
        let row = ElementVersion::visible(
            element,
            1,
            1,
            TagMap::new(),
            body,
            Utc::now(),
            sequence,
        );
        crate::internal::log::ElementLog::append(&mut txn, &[row])
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }

    /// n1 <- w1 <- r1 <- r2, with r1 also holding n1 directly.
    async fn fixture(store: &MemStore) {
        append(store, id(ElementKind::Node, 1), Body::Node { lon: 0.0, lat: 0.0 }, 1).await;
        append(
            store,
            id(ElementKind::Way, 1),
            Body::Way {
                refs: vec![id(ElementKind::Node, 1)],
            },
            2,
        )
        .await;
        append(
            store,
            id(ElementKind::Relation, 1),
            Body::Relation {
                members: vec![
                    Member::new("outer", id(ElementKind::Way, 1)),
                    Member::new("node", id(ElementKind::Node, 1)),
                ],
            },
            3,
        )
        .await;
        append(
            store,
            id(ElementKind::Relation, 2),
            Body::Relation {
                members: vec![Member::new("sub", id(ElementKind::Relation, 1))],
            },
            4,
        )
        .await;
    }

    #[tokio::test]
    async fn lowest_depth_wins_on_multiple_paths() {
        let store = MemStore::new();
        fixture(&store).await;
        let snapshot = store.snapshot(u64::MAX).await.unwrap();

        let depths =
            DependencyResolver::dependents(&snapshot, [id(ElementKind::Node, 1)], 8)
                .await
                .unwrap();
        assert_eq!(depths[&id(ElementKind::Node, 1)], 0);
        assert_eq!(depths[&id(ElementKind::Way, 1)], 1);
        // Reachable at depth 1 (direct member) and depth 2 (via the way).
        assert_eq!(depths[&id(ElementKind::Relation, 1)], 1);
        assert_eq!(depths[&id(ElementKind::Relation, 2)], 2);
    }

    #[tokio::test]
    async fn expansion_respects_max_depth() {
        let store = MemStore::new();
        fixture(&store).await;
        let snapshot = store.snapshot(u64::MAX).await.unwrap();

        let depths =
            DependencyResolver::dependents(&snapshot, [id(ElementKind::Node, 1)], 1)
                .await
                .unwrap();
        assert!(depths.contains_key(&id(ElementKind::Way, 1)));
        assert!(!depths.contains_key(&id(ElementKind::Relation, 2)));
    }

    #[tokio::test]
    async fn membership_cycles_terminate() {
        let store = MemStore::new();
        let r1 = id(ElementKind::Relation, 1);
        let r2 = id(ElementKind::Relation, 2);
        // Mutual membership; admitted because referential integrity is not
        // the resolver's concern.
        append(
            &store,
            r1,
            Body::Relation {
                members: vec![Member::new("peer", r2)],
            },
            1,
        )
        .await;
        append(
            &store,
            r2,
            Body::Relation {
                members: vec![Member::new("peer", r1)],
            },
            2,
        )
        .await;

        let snapshot = store.snapshot(u64::MAX).await.unwrap();
        let depths = DependencyResolver::dependents(&snapshot, [r1], 8).await.unwrap();
        assert_eq!(depths[&r1], 0);
        assert_eq!(depths[&r2], 1);
    }
}
