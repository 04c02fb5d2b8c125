//! Attenuated Radon transform over a bundle of straight chords.
//!
//! Every pattern pixel launches one ray per angle. Inside the absorbing disk
//! the ray is a straight chord: the pixel row itself for an index-matched
//! bath, or the refracted resin-side line from [`VialGeometry::trace`] for a
//! bare vial. Each chord lights the voxels within one pixel pitch of its
//! path, with a weight falling linearly with the distance, and is attenuated
//! by the path travelled since it entered the disk. Chords that cross inside
//! the resin add up.
//!
//! [`RayProjector::forward`] and [`RayProjector::transpose`] enumerate the
//! same taps, so they are exact transposes of each other.

use log::{debug, warn};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::TvamResult;
use crate::geometry::{Polarization, RayPath, Transmission};
use crate::scheme::{ParallelRayOptics, VialRayOptics};
use crate::{Projector, dot, relative_mismatch};

/// One ray inside the absorbing disk, in the frame of its projection angle:
/// `t` runs along the optical axis, heights are measured across it.
#[derive(Clone, Copy, Debug)]
struct Chord {
    bin: usize,
    offset: f32,
    tan_phi: f32,
    cos_phi: f32,
    sin_phi: f32,
    /// Arc-length parameter where the chord enters the disk.
    entry: f32,
    transmission: Transmission,
}

impl Chord {
    fn straight(bin: usize, height: f32, support: f32) -> Self {
        Self::new(bin, height, 0.0, support, Transmission::FULL)
    }

    /// `offset` is the signed distance from the disk centre, `phi` the
    /// direction relative to the optical axis.
    fn new(bin: usize, offset: f32, phi: f32, support: f32, transmission: Transmission) -> Self {
        Self {
            bin,
            offset,
            tan_phi: phi.tan(),
            cos_phi: phi.cos(),
            sin_phi: phi.sin(),
            entry: -(support * support - offset * offset).max(0.0).sqrt(),
            transmission,
        }
    }

    #[inline]
    fn height_at(&self, t: f32) -> f32 {
        t * self.tan_phi + self.offset / self.cos_phi
    }

    #[inline]
    fn path_at(&self, t: f32) -> f32 {
        ((t + self.offset * self.sin_phi) / self.cos_phi - self.entry).max(0.0)
    }
}

pub struct RayProjector {
    trig: Vec<(f32, f32)>,
    n: usize,
    nz: usize,
    n_bins: usize,
    voxel: f32,
    /// Spacing of neighbouring pattern pixels, in volume units.
    pitch: f32,
    support: f32,
    mu: f32,
    chords: Vec<Chord>,
    /// Every chord runs along the optical axis.
    straight: bool,
    polarization: Polarization,
    /// Transmission carried by each (angle, chord) ray.
    weights: Array2<f32>,
    rng: StdRng,
}

impl RayProjector {
    /// Straight rays. Voxels are unit sized unless a DMD diameter fixes the
    /// physical width of the volume.
    pub fn parallel(optics: &ParallelRayOptics, volume_dim: (usize, usize, usize)) -> Self {
        let (n, _, nz) = volume_dim;
        let voxel = optics.dmd_diameter.map_or(1.0, |d| d / n as f32);
        let support = n as f32 * voxel / 2.0;
        let c = (n as f32 - 1.0) / 2.0;
        let chords = (0..n)
            .map(|k| Chord::straight(k, (k as f32 - c) * voxel, support))
            .collect();
        Self::assemble(
            &optics.angles,
            (n, nz),
            n,
            voxel,
            voxel,
            support,
            optics.mu,
            chords,
            true,
            Polarization::default(),
        )
    }

    /// Rays refracted by the vial walls. The volume spans the outer diameter
    /// and only the resin disk receives dose.
    pub fn vial(optics: &VialRayOptics, volume_dim: (usize, usize, usize)) -> TvamResult<Self> {
        let geometry = &optics.geometry;
        geometry.validate()?;
        let (n, _, nz) = volume_dim;
        let vial_diameter = 2.0 * geometry.r_outer;
        let voxel = vial_diameter / n as f32;

        let mut dmd = optics.dmd_diameter.unwrap_or(vial_diameter);
        if dmd > vial_diameter {
            warn!(
                "DMD diameter {dmd} exceeds the vial diameter {vial_diameter}; \
                 simulating the vial width only"
            );
            dmd = vial_diameter;
        }
        let n_bins = ((n as f32 * dmd / vial_diameter).round() as usize).max(2);
        let pitch = dmd / n_bins as f32;
        let c = (n_bins as f32 - 1.0) / 2.0;

        let mut missed = 0usize;
        let mut chords = Vec::with_capacity(n_bins);
        for k in 0..n_bins {
            let y = (k as f32 - c) * pitch;
            match geometry.trace(y) {
                RayPath::Refracted(ray) => chords.push(Chord::new(
                    k,
                    ray.offset,
                    -ray.deflection,
                    geometry.r_inner,
                    ray.transmission(),
                )),
                _ => missed += 1,
            }
        }
        debug!(
            "Vial ray bundle: {} of {} pixels reach the resin (pitch {:.3e}, voxel {:.3e})",
            chords.len(),
            n_bins,
            pitch,
            voxel
        );
        if missed > 0 {
            debug!("{missed} pixels miss the resin (glass only or totally reflected)");
        }

        Ok(Self::assemble(
            &optics.angles,
            (n, nz),
            n_bins,
            pitch,
            voxel,
            geometry.r_inner,
            optics.mu,
            chords,
            false,
            optics.polarization,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        angles: &[f32],
        (n, nz): (usize, usize),
        n_bins: usize,
        pitch: f32,
        voxel: f32,
        support: f32,
        mu: Option<f32>,
        chords: Vec<Chord>,
        straight: bool,
        polarization: Polarization,
    ) -> Self {
        let mut projector = Self {
            trig: angles.iter().map(|a| a.sin_cos()).collect(),
            n,
            nz,
            n_bins,
            voxel,
            pitch,
            support,
            mu: mu.unwrap_or(0.0),
            weights: Array2::zeros((angles.len(), chords.len())),
            chords,
            straight,
            polarization,
            rng: StdRng::seed_from_u64(polarization.seed()),
        };
        projector.draw_weights();
        projector
    }

    fn draw_weights(&mut self) {
        let Self {
            weights,
            chords,
            polarization,
            rng,
            ..
        } = self;
        for mut row in weights.axis_iter_mut(Axis(0)) {
            for (w, chord) in row.iter_mut().zip(chords.iter()) {
                *w = polarization.weight(chord.transmission, &mut *rng);
            }
        }
    }

    /// Number of pattern pixels that reach the resin.
    pub fn chord_count(&self) -> usize {
        self.chords.len()
    }

    /// Emits `(bin, weight)` for every pattern pixel lighting voxel `(i, j)`
    /// at angle `a`.
    ///
    /// Each ray spreads over a triangular footprint reaching one pixel pitch
    /// to either side of its own path. Evenly spaced straight rays thus
    /// interpolate linearly, while refracted rays that cross near the far
    /// wall each add their own share.
    #[inline]
    fn taps(&self, a: usize, i: usize, j: usize, mut emit: impl FnMut(usize, f32)) {
        let c = (self.n as f32 - 1.0) / 2.0;
        let px = (i as f32 - c) * self.voxel;
        let py = (j as f32 - c) * self.voxel;
        if px * px + py * py > self.support * self.support || self.chords.is_empty() {
            return;
        }
        let (sin, cos) = self.trig[a];
        let r = px * cos + py * sin;
        let t = -px * sin + py * cos;

        let count = self.chords.len();
        let candidates = if self.straight {
            // Straight chords sit at evenly spaced, sorted heights.
            let k = ((r - self.chords[0].offset) / self.pitch).floor().max(0.0) as usize;
            k.min(count)..(k + 2).min(count)
        } else {
            0..count
        };
        for k in candidates {
            let chord = &self.chords[k];
            let distance = (r - chord.height_at(t)).abs() * chord.cos_phi;
            let footprint = 1.0 - distance / self.pitch;
            if footprint <= 0.0 {
                continue;
            }
            let w = footprint * self.weights[[a, k]] * (-self.mu * chord.path_at(t)).exp();
            if w > 0.0 {
                emit(chord.bin, w);
            }
        }
    }

    /// Transpose of the forward map: volume to pattern space.
    pub fn transpose(&self, volume: &Array3<f32>) -> Array3<f32> {
        let mut patterns = Array3::zeros(self.pattern_dim());
        patterns
            .axis_iter_mut(Axis(1))
            .into_par_iter()
            .enumerate()
            .for_each(|(a, mut sheet)| {
                for i in 0..self.n {
                    for j in 0..self.n {
                        self.taps(a, i, j, |bin, w| {
                            sheet.row_mut(bin).scaled_add(w, &volume.slice(s![i, j, ..]));
                        });
                    }
                }
            });
        patterns
    }
}

impl Projector for RayProjector {
    fn pattern_dim(&self) -> (usize, usize, usize) {
        (self.n_bins, self.trig.len(), self.nz)
    }

    fn volume_dim(&self) -> (usize, usize, usize) {
        (self.n, self.n, self.nz)
    }

    fn forward(&self, patterns: &Array3<f32>) -> Array3<f32> {
        debug_assert_eq!(patterns.dim(), self.pattern_dim());
        let mut dose = Array3::zeros(self.volume_dim());
        dose.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut plane)| {
                for j in 0..self.n {
                    let mut row = plane.row_mut(j);
                    for a in 0..self.trig.len() {
                        self.taps(a, i, j, |bin, w| {
                            row.scaled_add(w, &patterns.slice(s![bin, a, ..]));
                        });
                    }
                }
            });
        dose
    }

    fn adjoint(&self, _patterns: &Array3<f32>, dose_gradient: &Array3<f32>) -> Array3<f32> {
        self.transpose(dose_gradient)
    }

    fn backproject(&self, volume: &Array3<f32>) -> Array3<f32> {
        self.transpose(volume)
    }

    fn adjoint_mismatch(&self, seed: u64) -> f32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array3::from_shape_simple_fn(self.pattern_dim(), || rng.gen::<f32>());
        let y = Array3::from_shape_simple_fn(self.volume_dim(), || rng.gen::<f32>());
        let lhs = dot(&self.forward(&x), &y);
        let rhs = dot(&x, &self.transpose(&y));
        relative_mismatch(lhs, rhs)
    }

    fn refresh(&mut self) {
        if self.polarization.is_sampled() {
            self.draw_weights();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::VialGeometry;
    use crate::scheme::uniform_angles;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_single_angle_reproduces_pattern_rows() {
        let optics = ParallelRayOptics::new(vec![0.0]);
        let projector = RayProjector::parallel(&optics, (5, 5, 1));
        let mut patterns = Array3::zeros(projector.pattern_dim());
        patterns[[2, 0, 0]] = 1.0;
        let dose = projector.forward(&patterns);
        // At angle 0 the pattern height is the x coordinate: plane x = 2 is lit.
        for j in 1..4 {
            assert_abs_diff_eq!(dose[[2, j, 0]], 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(dose[[1, j, 0]], 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_vial_clamps_oversized_dmd() {
        let geometry = VialGeometry::new(6e-3, 5.5e-3, 1.47, 1.48);
        let optics = VialRayOptics::new(uniform_angles(4), geometry).with_dmd_diameter(20e-3);
        let projector = RayProjector::vial(&optics, (16, 16, 1)).unwrap();
        assert_eq!(projector.pattern_dim(), (16, 4, 1));

        let half = VialRayOptics::new(uniform_angles(4), geometry).with_dmd_diameter(6e-3);
        let projector = RayProjector::vial(&half, (16, 16, 1)).unwrap();
        assert_eq!(projector.pattern_dim(), (8, 4, 1));
    }

    #[test]
    fn test_outer_pixels_of_thick_vial_never_reach_resin() {
        let geometry = VialGeometry::new(1.0, 0.5, 1.5, 1.5);
        let optics = VialRayOptics::new(uniform_angles(4), geometry);
        let projector = RayProjector::vial(&optics, (20, 20, 1)).unwrap();
        assert!(projector.chord_count() < 20);
        assert!(projector.chord_count() > 2);
    }

    #[test]
    fn test_pixels_trapped_in_glass_leave_resin_dark() {
        // Rays with |y| > n_vial * R_i = 4.5e-3 never reach the inner wall.
        let geometry = VialGeometry::new(6e-3, 3e-3, 1.5, 1.5);
        let optics = VialRayOptics::new(uniform_angles(6), geometry);
        let projector = RayProjector::vial(&optics, (32, 32, 1)).unwrap();
        let pitch = 12e-3 / 32.0;
        let mut patterns = Array3::zeros(projector.pattern_dim());
        for k in 0..32 {
            let y = (k as f32 - 15.5) * pitch;
            if y.abs() > 4.6e-3 {
                patterns.slice_mut(s![k, .., ..]).fill(1.0);
            }
        }
        assert!(patterns.sum() > 0.0);
        let dose = projector.forward(&patterns);
        assert_eq!(dose.sum(), 0.0);
    }

    #[test]
    fn test_crossing_refracted_rays_both_deposit() {
        // A bare vial focuses the bundle, so chords swap order near the far
        // wall of the resin.
        let geometry = VialGeometry::new(6e-3, 5.5e-3, 1.47, 1.48);
        let optics = VialRayOptics::new(vec![0.0], geometry);
        let n = 96;
        let projector = RayProjector::vial(&optics, (n, n, 1)).unwrap();
        let c = (n as f32 - 1.0) / 2.0;
        let height = |bin: usize, t: f32| {
            projector
                .chords
                .iter()
                .find(|ch| ch.bin == bin)
                .map_or(f32::NAN, |ch| ch.height_at(t))
        };

        let mut crossing = None;
        'search: for i in 0..n {
            for j in 0..n {
                // At angle 0 the beam runs along +y.
                let t = (j as f32 - c) * projector.voxel;
                let mut lit = Vec::new();
                projector.taps(0, i, j, |bin, _| lit.push(bin));
                for &lo in &lit {
                    for &hi in &lit {
                        if lo < hi && height(lo, t) > height(hi, t) {
                            crossing = Some((i, j, lo, hi));
                            break 'search;
                        }
                    }
                }
            }
        }
        let (i, j, lo, hi) = crossing.expect("no voxel lit by two crossed chords");

        let lit = |bins: &[usize]| {
            let mut patterns = Array3::zeros(projector.pattern_dim());
            for &b in bins {
                patterns[[b, 0, 0]] = 1.0;
            }
            projector.forward(&patterns)[[i, j, 0]]
        };
        let (d_lo, d_hi, d_both) = (lit(&[lo]), lit(&[hi]), lit(&[lo, hi]));
        assert!(d_lo > 0.0 && d_hi > 0.0);
        assert_abs_diff_eq!(d_both, d_lo + d_hi, epsilon = 1e-6);
    }

    #[test]
    fn test_straight_rays_interpolate_between_neighbouring_pixels() {
        let optics = ParallelRayOptics::new(vec![0.0]);
        let projector = RayProjector::parallel(&optics, (6, 6, 1));
        let patterns = Array3::from_shape_fn(projector.pattern_dim(), |(k, _, _)| k as f32);
        let dose = projector.forward(&patterns);
        // At angle 0 a voxel sits exactly on the chord of its own pixel.
        for i in 0..6 {
            assert_abs_diff_eq!(dose[[i, 2, 0]], i as f32, epsilon = 1e-5);
        }
        let mut taps = Vec::new();
        projector.taps(0, 2, 2, |bin, w| taps.push((bin, w)));
        assert_eq!(taps, vec![(2, 1.0)]);
    }

    #[test]
    fn test_sampled_polarization_refresh_changes_weights() {
        use crate::geometry::RandomPolarization;
        let geometry = VialGeometry::new(6e-3, 5.5e-3, 1.47, 1.48);
        let optics = VialRayOptics::new(uniform_angles(3), geometry)
            .with_polarization(Polarization::Random(RandomPolarization::Sampled { seed: 3 }));
        let mut projector = RayProjector::vial(&optics, (12, 12, 1)).unwrap();
        let before = projector.weights.clone();
        projector.refresh();
        assert_ne!(before, projector.weights);
        assert!(projector.adjoint_mismatch(1) < 1e-4);
    }
}
