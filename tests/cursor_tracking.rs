//! # Cursor Tracking Test Suite
//!
//! Outstanding cursors must survive structural mutation: inserts shift
//! their positions, splits move them to the right sibling, and cached
//! value pointers are invalidated and re-derived transparently. These
//! tests hold cursors across heavy mutation and check they keep naming
//! the same logical key and metadata.

use silt::{BTree, BlockStore, CursorId, MatchKind, ObjectKey, ObjectMeta};

fn formatted_store() -> BlockStore {
    let _ = tracing_subscriber::fmt::try_init();
    let mut store = BlockStore::new();
    let mut tx = store.begin();
    BTree::mkfs(&mut tx).expect("mkfs failed");
    tx.commit().expect("commit failed");
    store
}

fn wide_key(bucket: u64, ordinal: u64, seq: u64) -> ObjectKey {
    let mut name = format!("object-{ordinal:06}").into_bytes();
    name.resize(400, b'x');
    ObjectKey::new(bucket, &name, seq).unwrap()
}

fn meta(generation: u32) -> ObjectMeta {
    ObjectMeta {
        data_laddr: 0x8000 + generation as u64,
        generation,
        ..ObjectMeta::default()
    }
}

fn assert_cursor_stable(tree: &mut BTree, cursor: CursorId, key: &ObjectKey, expected: &ObjectMeta) {
    assert_eq!(&tree.cursor_key(cursor).unwrap(), key, "cursor drifted off its key");
    assert_eq!(&tree.cursor_value(cursor).unwrap(), expected, "cursor value changed");
}

#[test]
fn cursor_position_shifts_when_an_earlier_key_is_inserted() {
    let mut store = formatted_store();
    let mut tx = store.begin();
    let mut tree = BTree::new();

    let k = ObjectKey::new(2, b"watched", 0).unwrap();
    let (cursor, _) = tree.insert(&mut tx, &k, &meta(1)).unwrap();
    let before = tree.cursor_position(cursor);

    // a new bucket ahead of the cursor bumps its outermost index
    tree.insert(&mut tx, &ObjectKey::new(1, b"early", 0).unwrap(), &meta(2))
        .unwrap();
    let after = tree.cursor_position(cursor);
    assert!(before < after, "position did not shift: {before} -> {after}");
    assert_cursor_stable(&mut tree, cursor, &k, &meta(1));
}

#[test]
fn cursor_survives_inserts_into_its_own_group() {
    let mut store = formatted_store();
    let mut tx = store.begin();
    let mut tree = BTree::new();

    let k = ObjectKey::new(1, b"name", 5).unwrap();
    let (cursor, _) = tree.insert(&mut tx, &k, &meta(10)).unwrap();

    // earlier seqs under the same (bucket, name) shift the cursor's
    // innermost index and invalidate its cached value pointer
    for seq in 0..5 {
        tree.insert(&mut tx, &ObjectKey::new(1, b"name", seq).unwrap(), &meta(seq as u32))
            .unwrap();
        assert_cursor_stable(&mut tree, cursor, &k, &meta(10));
    }
}

#[test]
fn cursor_survives_a_split_of_its_leaf() {
    let mut store = formatted_store();
    let mut tx = store.begin();
    let mut tree = BTree::new();

    // fill one leaf and keep a cursor near the median
    let keys: Vec<_> = (0..8).map(|i| wide_key(1, i, 0)).collect();
    let mut held = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        let (cursor, _) = tree.insert(&mut tx, k, &meta(i as u32)).unwrap();
        held.push(cursor);
    }
    assert_eq!(tree.level(&mut tx).unwrap(), 0);

    // push the leaf over the edge with keys sorting after the median
    for i in 8..20 {
        tree.insert(&mut tx, &wide_key(1, i, 0), &meta(i as u32)).unwrap();
    }
    assert!(tree.level(&mut tx).unwrap() >= 1);

    // every held cursor still names its key, wherever it landed
    for (i, cursor) in held.iter().enumerate() {
        assert_cursor_stable(&mut tree, *cursor, &keys[i], &meta(i as u32));
    }
}

#[test]
fn lookup_after_a_split_returns_the_moved_cursor() {
    let mut store = formatted_store();
    let mut tx = store.begin();
    let mut tree = BTree::new();

    let watched = wide_key(1, 6, 0);
    let mut watched_cursor = None;
    for i in 0..8 {
        let k = wide_key(1, i, 0);
        let (cursor, _) = tree.insert(&mut tx, &k, &meta(i as u32)).unwrap();
        if k == watched {
            watched_cursor = Some(cursor);
        }
    }
    let watched_cursor = watched_cursor.unwrap();

    for i in 8..20 {
        tree.insert(&mut tx, &wide_key(1, i, 0), &meta(i as u32)).unwrap();
    }
    assert!(tree.level(&mut tx).unwrap() >= 1);

    // the tracked handle and a fresh search agree on identity
    let found = tree.lower_bound(&mut tx, &watched).unwrap();
    assert_eq!(found.match_kind, MatchKind::Eq);
    assert_eq!(found.cursor, watched_cursor);
}

#[test]
fn many_cursors_survive_growth_to_three_levels() {
    let mut store = formatted_store();
    let mut tx = store.begin();
    let mut tree = BTree::new();

    let mut keys = Vec::new();
    for i in 0..160u64 {
        keys.push(wide_key(i / 40, (i / 4) % 10, i % 4));
    }

    let mut held: Vec<(ObjectKey, ObjectMeta, CursorId)> = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        let m = meta(i as u32);
        let (cursor, inserted) = tree.insert(&mut tx, k, &m).unwrap();
        assert!(inserted);
        // keep a handle on every fourth insert
        if i % 4 == 0 {
            held.push((k.clone(), m, cursor));
        }
        // all previously held cursors stay valid after each insert
        if i % 16 == 0 {
            for (hk, hm, hc) in held.clone() {
                assert_cursor_stable(&mut tree, hc, &hk, &hm);
            }
        }
    }

    assert!(tree.level(&mut tx).unwrap() >= 2);
    for (hk, hm, hc) in held {
        assert_cursor_stable(&mut tree, hc, &hk, &hm);
    }
}

#[test]
fn end_cursors_are_detached_and_never_move() {
    let mut store = formatted_store();
    let mut tx = store.begin();
    let mut tree = BTree::new();

    let end_cursor = tree.lookup_smallest(&mut tx).unwrap();
    assert!(tree.cursor_is_end(end_cursor));

    tree.insert(&mut tx, &ObjectKey::new(1, b"a", 0).unwrap(), &meta(1))
        .unwrap();

    // the detached end cursor is untouched by the insert
    assert!(tree.cursor_is_end(end_cursor));
    assert!(tree.cursor_key(end_cursor).is_err());

    // a fresh lookup now lands on the entry
    let smallest = tree.lookup_smallest(&mut tx).unwrap();
    assert!(!tree.cursor_is_end(smallest));
}
