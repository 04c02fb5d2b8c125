use criterion::{Criterion, criterion_group, criterion_main};
use ndarray::Array3;
use tvam_optimize::{
    ParallelRayOptics, Projector, PropagationScheme, TargetVolume, VialGeometry, VialRayOptics,
    WaveOptics, uniform_angles,
};

fn bench_propagation(c: &mut Criterion) {
    // 1. Parallel rays, 64^2 x 8 volume over 90 angles
    let optics = ParallelRayOptics::new(uniform_angles(90)).with_absorption(0.01);
    let parallel = PropagationScheme::ParallelRay(optics)
        .build((64, 64, 8))
        .unwrap();
    let patterns = Array3::ones(parallel.pattern_dim());
    let target = TargetVolume::cylinder(64, 8, 0.5);

    c.bench_function("parallel_forward_64x64x8_90", |b| {
        b.iter(|| parallel.forward(&patterns))
    });
    c.bench_function("parallel_adjoint_64x64x8_90", |b| {
        b.iter(|| parallel.adjoint(&patterns, &target.data))
    });

    // 2. Refracting vial, same grid
    let vial = PropagationScheme::VialRay(VialRayOptics::new(
        uniform_angles(90),
        VialGeometry::new(8.3e-3, 7.6e-3, 1.58, 1.4849),
    ))
    .build((64, 64, 8))
    .unwrap();
    c.bench_function("vial_forward_64x64x8_90", |b| b.iter(|| vial.forward(&patterns)));

    // 3. Angular spectrum, 32^2 x 8 volume over 16 angles
    let wave = PropagationScheme::Wave(WaveOptics::centered(uniform_angles(16), 0.5e-6, 100e-6, 32))
        .build((32, 32, 8))
        .unwrap();
    let wave_patterns = Array3::ones(wave.pattern_dim());
    let wave_target = TargetVolume::cylinder(32, 8, 0.5);
    c.bench_function("wave_forward_32x32x8_16", |b| b.iter(|| wave.forward(&wave_patterns)));
    c.bench_function("wave_adjoint_32x32x8_16", |b| {
        b.iter(|| wave.adjoint(&wave_patterns, &wave_target.data))
    });
}

criterion_group!(benches, bench_propagation);
criterion_main!(benches);
