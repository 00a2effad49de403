use criterion::{criterion_group, criterion_main, Criterion};
use nalgebra::{Matrix5, Vector3, Vector5};
use rand::Rng;
use vertexls::{SpectrometerTrack, VertexBuilder, DEFAULT_Z_REF};

fn event(n_tracks: usize) -> Vec<SpectrometerTrack<f64>> {
    let mut rng = rand::rng();

    let vertex = Vector3::new(
        rng.random_range(-50.0..50.0),
        rng.random_range(-50.0..50.0),
        rng.random_range(2000.0..30000.0),
    );
    (0..n_tracks)
        .map(|_| {
            let slope_x = rng.random_range(-5e-3..5e-3);
            let slope_y = rng.random_range(-5e-3..5e-3);
            let momentum = rng.random_range(5000.0..50000.0);
            let dz = DEFAULT_Z_REF - vertex.z;
            SpectrometerTrack {
                slope_x,
                slope_y,
                x: vertex.x + dz * slope_x + rng.random_range(-0.5..0.5),
                y: vertex.y + dz * slope_y + rng.random_range(-0.5..0.5),
                momentum,
                charge: if rng.random_range(0..2) == 0 { 1 } else { -1 },
                cov: Matrix5::from_diagonal(&Vector5::new(
                    1e-8,
                    1e-8,
                    1.,
                    1.,
                    1e4 / momentum.powi(4),
                )),
            }
        })
        .collect()
}

fn vertex_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("vertex search");

    let tracks = event(8);
    let builder = VertexBuilder::new(&tracks)
        .with_group_size(2)
        .with_group_size(4);
    group.bench_function("search blocking", |b| b.iter(|| builder.build()));

    #[cfg(feature = "parallel")]
    group.bench_function("search parallel", |b| b.iter(|| builder.build_par()));
}

criterion_group!(benches, vertex_benchmark);
criterion_main!(benches);
