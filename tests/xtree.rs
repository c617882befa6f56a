use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use xtree::{Point, Rect, RectQuery, XTree, XTreeOptions};

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("points.xt");
    (dir, path)
}

fn small_options() -> XTreeOptions {
    XTreeOptions::new()
        .with_page_size(256)
        .with_capacities(4, 4)
}

fn uniform_points(count: usize, seed: u64) -> Vec<Point<f64, 2>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Point::new([rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0)]))
        .collect()
}

fn all_points(tree: &XTree<f64, 2>) -> Vec<(u64, Point<f64, 2>)> {
    let mut found = tree.search(&RectQuery::Overlaps(Rect::max())).unwrap();
    found.sort_by_key(|(id, _)| *id);
    found
}

#[test]
fn commit_and_load_round_trip() {
    let (_dir, path) = scratch();
    let points = uniform_points(300, 7);
    let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
    for (i, point) in points.iter().enumerate() {
        tree.insert(point.clone(), i as u64).unwrap();
    }
    tree.check_consistency().unwrap();
    tree.commit().unwrap();
    let before = all_points(&tree);
    let height = tree.height();
    drop(tree);

    let tree: XTree<f64, 2> = XTree::open(&path, small_options()).unwrap();
    assert_eq!(300, tree.len());
    assert_eq!(height, tree.height());
    tree.check_consistency().unwrap();
    assert_eq!(before, all_points(&tree));
}

#[test]
fn every_point_answers_its_own_containment_query() {
    let (_dir, path) = scratch();
    let points = uniform_points(120, 11);
    let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
    for (i, point) in points.iter().enumerate() {
        tree.insert(point.clone(), i as u64).unwrap();
    }
    for (i, point) in points.iter().enumerate() {
        let exact = RectQuery::ContainedBy(point.to_mbr());
        let found = tree.search(&exact).unwrap();
        assert!(
            found.iter().any(|(id, _)| *id == i as u64),
            "point {} missing from its own window",
            i
        );
    }
}

#[test]
fn repeated_commit_is_idempotent() {
    let (_dir, path) = scratch();
    let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
    for (i, point) in uniform_points(80, 23).into_iter().enumerate() {
        tree.insert(point, i as u64).unwrap();
    }
    tree.commit().unwrap();
    let first = std::fs::read(&path).unwrap();
    tree.commit().unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn low_dimensional_uniform_data_builds_no_supernodes() {
    let (_dir, path) = scratch();
    let mut tree: XTree<f64, 2> = XTree::create(&path, XTreeOptions::new()).unwrap();
    for (i, point) in uniform_points(2000, 42).into_iter().enumerate() {
        tree.insert(point, i as u64).unwrap();
    }
    assert_eq!(2000, tree.len());
    assert_eq!(0, tree.supernode_count());
    tree.check_consistency().unwrap();
}

#[test]
fn reopened_tree_keeps_accepting_inserts() {
    let (_dir, path) = scratch();
    let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
    for (i, point) in uniform_points(60, 3).into_iter().enumerate() {
        tree.insert(point, i as u64).unwrap();
    }
    tree.commit().unwrap();
    drop(tree);

    let mut tree: XTree<f64, 2> = XTree::open(&path, small_options()).unwrap();
    for (i, point) in uniform_points(60, 4).into_iter().enumerate() {
        tree.insert(point, 60 + i as u64).unwrap();
    }
    tree.commit().unwrap();
    drop(tree);

    let tree: XTree<f64, 2> = XTree::open(&path, small_options()).unwrap();
    assert_eq!(120, tree.len());
    tree.check_consistency().unwrap();
    assert_eq!(120, all_points(&tree).len());
}

#[test]
fn f32_scalars_round_trip() {
    let (_dir, path) = scratch();
    let mut tree: XTree<f32, 3> = XTree::create(&path, XTreeOptions::new()).unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let points: Vec<Point<f32, 3>> = (0..200)
        .map(|_| {
            Point::new([
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
            ])
        })
        .collect();
    for (i, point) in points.iter().enumerate() {
        tree.insert(point.clone(), i as u64).unwrap();
    }
    tree.commit().unwrap();
    drop(tree);

    let tree: XTree<f32, 3> = XTree::open(&path, XTreeOptions::new()).unwrap();
    assert_eq!(200, tree.len());
    for (i, point) in points.iter().enumerate() {
        let found = tree.search(&RectQuery::ContainedBy(point.to_mbr())).unwrap();
        assert!(found.iter().any(|(id, p)| *id == i as u64 && p == point));
    }
}

#[test]
fn duplicate_points_are_all_retrievable() {
    let (_dir, path) = scratch();
    let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
    for i in 0..25 {
        tree.insert(Point::new([0.5, 0.5]), i).unwrap();
    }
    tree.check_consistency().unwrap();
    let found = tree
        .search(&RectQuery::ContainedBy(Point::new([0.5, 0.5]).to_mbr()))
        .unwrap();
    assert_eq!(25, found.len());
}
