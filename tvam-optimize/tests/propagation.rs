use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tvam_optimize::{
    ParallelRayOptics, Polarization, Projector, PropagationScheme, RandomPolarization, VialGeometry,
    VialRayOptics, WaveOptics, uniform_angles,
};

fn vial() -> VialGeometry {
    VialGeometry::new(6e-3, 5.5e-3, 1.47, 1.48)
}

fn random(dim: (usize, usize, usize), seed: u64) -> Array3<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_simple_fn(dim, || rng.gen::<f32>())
}

fn weighted_dose<P: Projector>(
    projector: &P,
    patterns: &Array3<f32>,
    weights: &Array3<f32>,
) -> f64 {
    projector
        .forward(patterns)
        .iter()
        .zip(weights.iter())
        .map(|(&d, &w)| d as f64 * w as f64)
        .sum()
}

#[test]
fn test_parallel_ray_adjoint_identity() {
    let optics = ParallelRayOptics::new(uniform_angles(30)).with_absorption(0.05);
    let scheme = PropagationScheme::ParallelRay(optics);
    let projector = scheme.build((16, 16, 3)).unwrap();
    let mismatch = projector.adjoint_mismatch(11);
    assert!(mismatch < 1e-4, "mismatch {mismatch}");
}

#[test]
fn test_vial_ray_adjoint_identity() {
    let optics = VialRayOptics::new(uniform_angles(24), vial()).with_absorption(100.0);
    let scheme = PropagationScheme::VialRay(optics);
    let projector = scheme.build((20, 20, 2)).unwrap();
    let mismatch = projector.adjoint_mismatch(5);
    assert!(mismatch < 1e-4, "mismatch {mismatch}");
}

#[test]
fn test_vial_ray_adjoint_identity_with_sampled_polarization() {
    let optics = VialRayOptics::new(uniform_angles(12), VialGeometry::new(1.0, 0.8, 1.6, 1.45))
        .with_polarization(Polarization::Random(RandomPolarization::Sampled { seed: 9 }));
    let mut projector = PropagationScheme::VialRay(optics).build((14, 14, 2)).unwrap();
    projector.refresh();
    assert!(projector.adjoint_mismatch(3) < 1e-4);
}

#[test]
fn test_wave_field_adjoint_identity() {
    for coherent in [false, true] {
        let optics = WaveOptics::centered(uniform_angles(6), 0.5e-6, 40e-6, 10)
            .with_coherent(coherent)
            .with_absorption(1e3);
        let projector = PropagationScheme::Wave(optics).build((10, 10, 4)).unwrap();
        let mismatch = projector.adjoint_mismatch(21);
        assert!(mismatch < 1e-3, "coherent = {coherent}: mismatch {mismatch}");
    }
}

#[test]
fn test_wave_gradient_matches_finite_differences() {
    for coherent in [false, true] {
        let optics =
            WaveOptics::centered(uniform_angles(5), 0.6e-6, 30e-6, 8).with_coherent(coherent);
        let projector = PropagationScheme::Wave(optics).build((8, 8, 3)).unwrap();
        let patterns = random(projector.pattern_dim(), 1);
        let direction = random(projector.pattern_dim(), 2);
        let weights = random(projector.volume_dim(), 3);

        let gradient = projector.adjoint(&patterns, &weights);
        let analytic: f64 = gradient
            .iter()
            .zip(direction.iter())
            .map(|(&g, &v)| g as f64 * v as f64)
            .sum();

        // The dose is quadratic in the patterns, so central differences are
        // exact up to rounding.
        let h = 0.05f32;
        let plus = &patterns + &(&direction * h);
        let minus = &patterns - &(&direction * h);
        let numeric = (weighted_dose(&projector, &plus, &weights)
            - weighted_dose(&projector, &minus, &weights))
            / (2.0 * h as f64);
        let rel = (numeric - analytic).abs() / analytic.abs().max(1e-12);
        assert!(rel < 1e-2, "coherent = {coherent}: numeric {numeric}, analytic {analytic}");
    }
}

#[test]
fn test_ray_energy_bound_without_absorption() {
    let n_angles = 16;
    let scheme = PropagationScheme::ParallelRay(ParallelRayOptics::new(uniform_angles(n_angles)));
    let projector = scheme.build((12, 12, 2)).unwrap();
    let dose = projector.forward(&Array3::ones(projector.pattern_dim()));
    let max = dose.iter().fold(0.0f32, |m, &v| m.max(v));
    assert!(max <= n_angles as f32 + 1e-4, "max dose {max}");
    assert!((dose[[6, 6, 0]] - n_angles as f32).abs() < 1e-4);
}

#[test]
fn test_absorption_strictly_decreases_dose_along_the_beam() {
    let n = 9;
    let clear = PropagationScheme::ParallelRay(ParallelRayOptics::new(vec![0.0]))
        .build((n, n, 1))
        .unwrap();
    let absorbing = ParallelRayOptics::new(vec![0.0]).with_absorption(0.2);
    let absorbing = PropagationScheme::ParallelRay(absorbing)
        .build((n, n, 1))
        .unwrap();
    let ones = Array3::ones(clear.pattern_dim());
    let flat = clear.forward(&ones);
    let decaying = absorbing.forward(&ones);

    // At angle 0 the beam travels along +y.
    let centre = n / 2;
    for j in 0..n {
        assert!((flat[[centre, j, 0]] - 1.0).abs() < 1e-6);
    }
    for j in 0..n - 1 {
        assert!(
            decaying[[centre, j + 1, 0]] < decaying[[centre, j, 0]],
            "dose did not decrease between y = {j} and y = {}",
            j + 1
        );
    }
    assert!(decaying[[centre, 0, 0]] <= 1.0);
}

#[test]
fn test_vial_only_doses_resin() {
    let scheme = PropagationScheme::VialRay(VialRayOptics::new(uniform_angles(18), vial()));
    let n = 24;
    let projector = scheme.build((n, n, 1)).unwrap();
    let dose = projector.forward(&Array3::ones(projector.pattern_dim()));
    let c = (n as f32 - 1.0) / 2.0;
    let voxel = 2.0 * 6e-3 / n as f32;
    for ((i, j, _), &d) in dose.indexed_iter() {
        let r = ((i as f32 - c).powi(2) + (j as f32 - c).powi(2)).sqrt() * voxel;
        if r > 5.5e-3 {
            assert_eq!(d, 0.0, "voxel ({i}, {j}) outside the resin received dose");
        }
    }
    assert!(dose[[n / 2, n / 2, 0]] > 0.0);
    assert!(dose.iter().all(|&d| d.is_finite() && d >= 0.0));
}

fn assert_dose_falls_with_absorption<P: Projector>(projectors: &[P], patterns: &Array3<f32>) {
    let doses: Vec<Array3<f32>> = projectors.iter().map(|p| p.forward(patterns)).collect();
    let mut dosed = 0;
    for (idx, &clear) in doses[0].indexed_iter() {
        if clear <= 0.0 {
            continue;
        }
        dosed += 1;
        for pair in doses.windows(2) {
            let (weaker, stronger) = (pair[0][idx], pair[1][idx]);
            assert!(stronger < weaker, "voxel {idx:?}: {stronger} is not below {weaker}");
        }
    }
    assert!(dosed > 0);
}

#[test]
fn test_dose_strictly_decreases_with_absorption() {
    let dim = (12, 12, 2);
    let parallel: Vec<_> = [None, Some(0.1), Some(0.4)]
        .into_iter()
        .map(|mu| {
            let mut optics = ParallelRayOptics::new(uniform_angles(8));
            if let Some(mu) = mu {
                optics = optics.with_absorption(mu);
            }
            PropagationScheme::ParallelRay(optics).build(dim).unwrap()
        })
        .collect();
    let patterns = random(parallel[0].pattern_dim(), 17);
    assert_dose_falls_with_absorption(&parallel, &patterns);

    let vial_rays: Vec<_> = [None, Some(50.0), Some(200.0)]
        .into_iter()
        .map(|mu| {
            let mut optics = VialRayOptics::new(uniform_angles(8), vial());
            if let Some(mu) = mu {
                optics = optics.with_absorption(mu);
            }
            PropagationScheme::VialRay(optics).build(dim).unwrap()
        })
        .collect();
    let patterns = random(vial_rays[0].pattern_dim(), 18);
    assert_dose_falls_with_absorption(&vial_rays, &patterns);
}
