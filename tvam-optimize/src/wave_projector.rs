//! Scalar wave propagation with the band-limited angular spectrum method.
//!
//! Each pattern sheet (pixel × row) is the real field at the pattern plane.
//! It is carried to every depth plane of the volume by a precomputed transfer
//! function, rotated into the volume grid, and turned into dose either per
//! angle (incoherent) or after summing the fields of all angles (coherent).

use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut2, Axis, Zip, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::ops::{Add, Mul};
use std::sync::Arc;

use crate::scheme::WaveOptics;
use crate::{Projector, dot, relative_mismatch};

/// Unnormalized 2D FFT over (pixel, row) sheets.
struct Fft2 {
    pixel_forward: Arc<dyn Fft<f32>>,
    pixel_inverse: Arc<dyn Fft<f32>>,
    row_forward: Arc<dyn Fft<f32>>,
    row_inverse: Arc<dyn Fft<f32>>,
}

impl Fft2 {
    fn new(n_pixels: usize, n_rows: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            pixel_forward: planner.plan_fft_forward(n_pixels),
            pixel_inverse: planner.plan_fft_inverse(n_pixels),
            row_forward: planner.plan_fft_forward(n_rows),
            row_inverse: planner.plan_fft_inverse(n_rows),
        }
    }

    fn forward(&self, mut sheet: ArrayViewMut2<Complex32>) {
        transform_lanes(&mut sheet, Axis(0), self.pixel_forward.as_ref());
        transform_lanes(&mut sheet, Axis(1), self.row_forward.as_ref());
    }

    fn inverse(&self, mut sheet: ArrayViewMut2<Complex32>) {
        transform_lanes(&mut sheet, Axis(0), self.pixel_inverse.as_ref());
        transform_lanes(&mut sheet, Axis(1), self.row_inverse.as_ref());
    }
}

fn transform_lanes(sheet: &mut ArrayViewMut2<Complex32>, axis: Axis, fft: &dyn Fft<f32>) {
    let mut buffer = vec![Complex32::new(0.0, 0.0); sheet.len_of(axis)];
    for mut lane in sheet.lanes_mut(axis) {
        for (b, v) in buffer.iter_mut().zip(lane.iter()) {
            *b = *v;
        }
        fft.process(&mut buffer);
        for (v, b) in lane.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }
}

/// Sample frequencies of an `n`-point DFT with spacing `dx`, in FFT order.
fn fftfreq(n: usize, dx: f64) -> Vec<f64> {
    let span = n as f64 * dx;
    (0..n)
        .map(|i| {
            let k = if i < (n + 1) / 2 { i as f64 } else { i as f64 - n as f64 };
            k / span
        })
        .collect()
}

/// Values that can be carried through the bilinear rotation.
trait Sample: Copy + Default + Add<Output = Self> + Mul<f32, Output = Self> + Send + Sync {}
impl<T> Sample for T where
    T: Copy + Default + Add<Output = T> + Mul<f32, Output = T> + Send + Sync
{
}

pub struct WaveProjector {
    trig: Vec<(f32, f32)>,
    n: usize,
    nz: usize,
    coherent: bool,
    /// Transfer function of every depth plane, `(depth, pixel freq, row freq)`,
    /// including absorption and the FFT normalization.
    transfer: Array3<Complex32>,
    fft: Fft2,
}

impl WaveProjector {
    pub fn new(optics: &WaveOptics, volume_dim: (usize, usize, usize)) -> Self {
        let (n, _, nz) = volume_dim;
        let dx = optics.aperture as f64 / n as f64;
        let lambda = optics.wavelength as f64;
        let mu = optics.mu.unwrap_or(0.0) as f64;
        let z0 = optics.depths[0] as f64;
        let norm = 1.0 / (n * nz) as f64;

        let fp = fftfreq(n, dx);
        let fr = fftfreq(nz, dx);
        let (width_p, width_r) = (n as f64 * dx, nz as f64 * dx);

        let mut transfer = Array3::zeros((n, n, nz));
        for (mut plane, &z) in transfer.outer_iter_mut().zip(optics.depths.iter()) {
            let z = z as f64;
            let amplitude = (-mu * (z - z0) / 2.0).exp() * norm;
            let limit_p = band_limit(lambda, z, width_p);
            let limit_r = band_limit(lambda, z, width_r);
            for ((p, r), h) in plane.indexed_iter_mut() {
                let (fx, fy) = (fp[p], fr[r]);
                let kz2 = 1.0 / (lambda * lambda) - fx * fx - fy * fy;
                if kz2 <= 0.0 || fx.abs() > limit_p || fy.abs() > limit_r {
                    continue;
                }
                let phase = 2.0 * std::f64::consts::PI * z * kz2.sqrt();
                *h = Complex32::new(
                    (amplitude * phase.cos()) as f32,
                    (amplitude * phase.sin()) as f32,
                );
            }
        }

        Self {
            trig: optics.angles.iter().map(|a| a.sin_cos()).collect(),
            n,
            nz,
            coherent: optics.coherent,
            transfer,
            fft: Fft2::new(n, nz),
        }
    }

    /// Field of one pattern sheet at every depth plane, `(depth, pixel, row)`.
    fn propagate(&self, sheet: ArrayView2<f32>) -> Array3<Complex32> {
        let mut spectrum = sheet.mapv(|v| Complex32::new(v, 0.0));
        self.fft.forward(spectrum.view_mut());

        let mut slab = Array3::zeros((self.n, self.n, self.nz));
        for (mut plane, transfer) in slab.outer_iter_mut().zip(self.transfer.outer_iter()) {
            Zip::from(&mut plane)
                .and(&transfer)
                .and(&spectrum)
                .for_each(|u, &h, &s| *u = h * s);
            self.fft.inverse(plane.view_mut());
        }
        slab
    }

    /// Adjoint of [`Self::propagate`].
    fn back_propagate(&self, slab: &Array3<Complex32>) -> Array2<Complex32> {
        let mut acc = Array2::zeros((self.n, self.nz));
        for (plane, transfer) in slab.outer_iter().zip(self.transfer.outer_iter()) {
            let mut spectrum = plane.to_owned();
            self.fft.forward(spectrum.view_mut());
            Zip::from(&mut acc)
                .and(&transfer)
                .and(&spectrum)
                .for_each(|a, &h, &s| *a += h.conj() * s);
        }
        self.fft.inverse(acc.view_mut());
        acc
    }

    /// Bilinear taps `(depth, pixel, weight)` of the beam-frame slab feeding
    /// voxel `(i, j)` at angle `a`, in pixel units.
    #[inline]
    fn rotation_taps(&self, a: usize, i: usize, j: usize, mut emit: impl FnMut(usize, usize, f32)) {
        let c = (self.n as f32 - 1.0) / 2.0;
        let (sin, cos) = self.trig[a];
        let (cx, cy) = (i as f32 - c, j as f32 - c);
        let d = -cx * sin + cy * cos + c;
        let q = cx * cos + cy * sin + c;
        let edge = (self.n - 1) as f32;
        if d < 0.0 || d >= edge || q < 0.0 || q >= edge {
            return;
        }
        let (d0, q0) = (d.floor() as usize, q.floor() as usize);
        let (fd, fq) = (d - d0 as f32, q - q0 as f32);
        emit(d0, q0, (1.0 - fd) * (1.0 - fq));
        emit(d0 + 1, q0, fd * (1.0 - fq));
        emit(d0, q0 + 1, (1.0 - fd) * fq);
        emit(d0 + 1, q0 + 1, fd * fq);
    }

    /// Adds the rotated slab of angle `a` into `volume`.
    fn rotate_into<T: Sample>(&self, a: usize, slab: &Array3<T>, volume: &mut Array3<T>) {
        for i in 0..self.n {
            for j in 0..self.n {
                let mut column = volume.slice_mut(s![i, j, ..]);
                self.rotation_taps(a, i, j, |d, q, w| {
                    Zip::from(&mut column)
                        .and(&slab.slice(s![d, q, ..]))
                        .for_each(|v, &u| *v = *v + u * w);
                });
            }
        }
    }

    /// Transpose of [`Self::rotate_into`]: volume back to the slab of angle `a`.
    fn rotate_transpose<T: Sample>(&self, a: usize, volume: &Array3<T>) -> Array3<T> {
        let mut slab = Array3::from_elem((self.n, self.n, self.nz), T::default());
        for i in 0..self.n {
            for j in 0..self.n {
                let column = volume.slice(s![i, j, ..]);
                self.rotation_taps(a, i, j, |d, q, w| {
                    Zip::from(slab.slice_mut(s![d, q, ..]))
                        .and(&column)
                        .for_each(|u, &v| *u = *u + v * w);
                });
            }
        }
        slab
    }

    /// Complex field summed over all angles. Linear in the patterns.
    pub fn field(&self, patterns: &Array3<f32>) -> Array3<Complex32> {
        let dim = self.volume_dim();
        (0..self.trig.len())
            .into_par_iter()
            .fold(
                || Array3::zeros(dim),
                |mut acc, a| {
                    let slab = self.propagate(patterns.index_axis(Axis(1), a));
                    self.rotate_into(a, &slab, &mut acc);
                    acc
                },
            )
            .reduce(|| Array3::zeros(dim), |a, b| a + b)
    }

    /// Real part of the adjoint of [`Self::field`]; the exact transpose for
    /// real patterns.
    pub fn field_adjoint(&self, field: &Array3<Complex32>) -> Array3<f32> {
        self.per_angle(|a| self.back_propagate(&self.rotate_transpose(a, field)).mapv(|v| v.re))
    }

    fn per_angle<F>(&self, sheet_for: F) -> Array3<f32>
    where
        F: Fn(usize) -> Array2<f32> + Sync,
    {
        let mut patterns = Array3::zeros(self.pattern_dim());
        patterns
            .axis_iter_mut(Axis(1))
            .into_par_iter()
            .enumerate()
            .for_each(|(a, mut sheet)| sheet.assign(&sheet_for(a)));
        patterns
    }
}

/// Highest spatial frequency along an axis of width `width` that a
/// propagation over `z` represents without aliasing.
fn band_limit(lambda: f64, z: f64, width: f64) -> f64 {
    1.0 / (lambda * ((2.0 * z / width).powi(2) + 1.0).sqrt())
}

impl Projector for WaveProjector {
    fn pattern_dim(&self) -> (usize, usize, usize) {
        (self.n, self.trig.len(), self.nz)
    }

    fn volume_dim(&self) -> (usize, usize, usize) {
        (self.n, self.n, self.nz)
    }

    fn forward(&self, patterns: &Array3<f32>) -> Array3<f32> {
        debug_assert_eq!(patterns.dim(), self.pattern_dim());
        if self.coherent {
            return self.field(patterns).mapv(|e| e.norm_sqr());
        }
        let dim = self.volume_dim();
        (0..self.trig.len())
            .into_par_iter()
            .fold(
                || Array3::zeros(dim),
                |mut acc, a| {
                    let intensity = self
                        .propagate(patterns.index_axis(Axis(1), a))
                        .mapv(|u| u.norm_sqr());
                    self.rotate_into(a, &intensity, &mut acc);
                    acc
                },
            )
            .reduce(|| Array3::zeros(dim), |a, b| a + b)
    }

    /// `2 Re(Pᴴ(E ⊙ g))`, with `E` the field seen by the dose.
    fn adjoint(&self, patterns: &Array3<f32>, dose_gradient: &Array3<f32>) -> Array3<f32> {
        if self.coherent {
            let field = self.field(patterns);
            let weighted = Zip::from(&field)
                .and(dose_gradient)
                .map_collect(|&e, &g| e * (2.0 * g));
            return self.field_adjoint(&weighted);
        }
        self.per_angle(|a| {
            let slab = self.propagate(patterns.index_axis(Axis(1), a));
            let g = self.rotate_transpose(a, dose_gradient);
            let weighted = Zip::from(&slab)
                .and(&g)
                .map_collect(|&u, &g| u * (2.0 * g));
            self.back_propagate(&weighted).mapv(|v| v.re)
        })
    }

    /// Magnitude of the back-propagated target field.
    fn backproject(&self, volume: &Array3<f32>) -> Array3<f32> {
        let field = volume.mapv(|v| Complex32::new(v, 0.0));
        self.per_angle(|a| {
            self.back_propagate(&self.rotate_transpose(a, &field))
                .mapv(|v| v.norm())
        })
    }

    fn dose_exponent(&self) -> i32 {
        2
    }

    fn adjoint_mismatch(&self, seed: u64) -> f32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array3::from_shape_simple_fn(self.pattern_dim(), || rng.gen::<f32>());
        let y = Array3::from_shape_simple_fn(self.volume_dim(), || {
            Complex32::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5)
        });
        let lhs: f64 = self
            .field(&x)
            .iter()
            .zip(y.iter())
            .map(|(a, b)| (a.conj() * *b).re as f64)
            .sum();
        let rhs = dot(&x, &self.field_adjoint(&y));
        relative_mismatch(lhs, rhs)
    }
}
