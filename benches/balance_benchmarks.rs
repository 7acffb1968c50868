use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;
use rand::SeedableRng;

use quadforest::balance::{balance_subtree, Balance};
use quadforest::tree::{complete_region, Tree};
use quadforest::types::quadrant::{Dim, Quadrant};

fn random_complete_tree(dim: Dim, rounds: usize) -> Tree {
    let mut rng = StdRng::seed_from_u64(0);
    let mut quads = Quadrant::root().children(dim);
    for _ in 0..rounds {
        let at = rng.gen_range(0..quads.len());
        if quads[at].level < 10 {
            let children = quads[at].children(dim);
            let _ = quads.splice(at..=at, children);
        }
    }
    Tree::from_quadrants(quads, dim)
}

fn benchmark_balance_subtree(c: &mut Criterion) {
    let template = random_complete_tree(Dim::Three, 2000);

    c.bench_function("balance subtree", |b| {
        b.iter(|| {
            let mut tree = template.clone();
            balance_subtree(
                &mut tree,
                Dim::Three,
                black_box(Balance::Corner),
                None,
                None,
                None,
                0,
            );
            tree.len()
        })
    });
}

fn benchmark_complete_region(c: &mut Criterion) {
    let dim = Dim::Two;
    let deep = dim.max_level();
    let a = Quadrant::root().first_descendant(deep, dim);
    let b = Quadrant::root().last_descendant(deep, dim);

    c.bench_function("complete region across the root", |bench| {
        bench.iter(|| complete_region(&a, true, black_box(&b), true, dim).len())
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(30).measurement_time(std::time::Duration::from_secs(10));
    targets = benchmark_balance_subtree,
              benchmark_complete_region,
}
criterion_main!(benches);
