use ndarray::{Array3, Axis};
use rustfft::{FftPlanner, num_complex::Complex};

/// Ram-Lak (ramp) filters every pattern along its pixel axis.
///
/// Each line is zero-padded to the next power of two of at least twice its
/// length so the circular convolution does not wrap around.
pub fn apply_ram_lak(patterns: &mut Array3<f32>) {
    let nr = patterns.len_of(Axis(0));
    if nr == 0 {
        return;
    }
    let padded = (2 * nr).next_power_of_two();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(padded);
    let ifft = planner.plan_fft_inverse(padded);

    // |f| in FFT order, folding in the 1/N of the inverse transform.
    let filter: Vec<f32> = (0..padded)
        .map(|i| {
            let k = if i <= padded / 2 { i } else { padded - i };
            k as f32 / padded as f32 / padded as f32
        })
        .collect();

    let mut line = vec![Complex::new(0.0f32, 0.0); padded];
    for mut lane in patterns.lanes_mut(Axis(0)) {
        for (i, val) in line.iter_mut().enumerate() {
            *val = Complex::new(if i < nr { lane[i] } else { 0.0 }, 0.0);
        }
        fft.process(&mut line);
        for (val, &f) in line.iter_mut().zip(filter.iter()) {
            *val *= f;
        }
        ifft.process(&mut line);
        for (r, out) in lane.iter_mut().enumerate() {
            *out = line[r].re;
        }
    }
}
