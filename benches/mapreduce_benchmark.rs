// Throughput of the streaming QR fold as a function of the re-triangularization
// threshold. Small thresholds factor often on short stacks; large ones factor
// rarely on tall stacks.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ized::FitConfig;
use ized::expand::{KnotStrategy, bs_design, knot_vector};
use ized::qr::{LeastSquaresSolver, Penalty, mapreduce_qr, mapreduce_qr_parallel};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

const NUM_CHUNKS: usize = 200;
const ROWS_PER_CHUNK: usize = 500;
const NUM_COLUMNS: usize = 16;
const THRESHOLDS: [usize; 5] = [0, 64, 512, 4096, 32_768];

fn random_chunks(seed: u64) -> Vec<Array2<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    (0..NUM_CHUNKS)
        .map(|_| Array2::from_shape_fn((ROWS_PER_CHUNK, NUM_COLUMNS), |_| normal.sample(&mut rng)))
        .collect()
}

fn spline_chunks(seed: u64) -> (Vec<Array2<f64>>, usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let uniform = Uniform::new(0.0, 10.0);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let knots = knot_vector((0.0, 10.0), 10, 3, KnotStrategy::Uniform, None).unwrap();
    let chunks = (0..NUM_CHUNKS)
        .map(|_| {
            let x = Array1::from_shape_fn(ROWS_PER_CHUNK, |_| uniform.sample(&mut rng));
            let y = x.mapv(|xi: f64| xi.sin() + noise.sample(&mut rng));
            bs_design(x.view(), y.view(), knots.view(), 3).unwrap()
        })
        .collect();
    (chunks, knots.len() + 1)
}

fn bench_fold(c: &mut Criterion) {
    let chunks = random_chunks(42);
    let mut group = c.benchmark_group("mapreduce_qr");
    group.throughput(Throughput::Elements((NUM_CHUNKS * ROWS_PER_CHUNK) as u64));
    group.sample_size(20);

    for threshold in THRESHOLDS {
        group.bench_with_input(BenchmarkId::new("sequential", threshold), &threshold, |b, &t| {
            b.iter(|| {
                mapreduce_qr(black_box(&chunks), t)
                    .and_then(|acc| acc.into_factor())
                    .unwrap()
            })
        });
        group.bench_with_input(BenchmarkId::new("parallel", threshold), &threshold, |b, &t| {
            b.iter(|| {
                mapreduce_qr_parallel(black_box(&chunks), t)
                    .and_then(|acc| acc.into_factor())
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_spline_solve(c: &mut Criterion) {
    let (chunks, response_column) = spline_chunks(7);
    // The boundary columns of a clamped basis are all zero; a small ridge keeps them solvable.
    let ridge = Penalty::ridge(response_column, 1e-6).unwrap();
    let solver = LeastSquaresSolver::new(response_column, &FitConfig::default())
        .with_penalty(&ridge)
        .unwrap();
    let mut group = c.benchmark_group("spline_solve");
    group.throughput(Throughput::Elements((NUM_CHUNKS * ROWS_PER_CHUNK) as u64));
    group.sample_size(20);
    group.bench_function("sequential", |b| b.iter(|| solver.solve(black_box(&chunks)).unwrap()));
    group.bench_function("parallel", |b| {
        b.iter(|| solver.solve_parallel(black_box(&chunks)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_fold, bench_spline_solve);
criterion_main!(benches);
