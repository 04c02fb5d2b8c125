//! Print-quality figures of a dose volume against a binary target.

use ndarray::{ArrayBase, Data, Ix3};

/// Fraction of all voxels that are void yet receive at least the smallest
/// dose of any object voxel. Zero means some threshold prints the target
/// exactly.
pub fn voxel_error_rate<S, T>(target: &ArrayBase<S, Ix3>, dose: &ArrayBase<T, Ix3>) -> f32
where
    S: Data<Elem = f32>,
    T: Data<Elem = f32>,
{
    let min_gel_dose = target
        .iter()
        .zip(dose.iter())
        .filter(|&(&t, _)| t > 0.5)
        .fold(f32::MAX, |m, (_, &d)| m.min(d));

    let n_pix_overlap = target
        .iter()
        .zip(dose.iter())
        .filter(|&(&t, &d)| t <= 0.5 && d >= min_gel_dose)
        .count();

    if target.is_empty() {
        return 0.0;
    }
    n_pix_overlap as f32 / target.len() as f32
}

/// Dose level that best separates object from void, scanned over 100 steps
/// between the extremes of `dose`.
pub fn best_threshold<S, T>(target: &ArrayBase<S, Ix3>, dose: &ArrayBase<T, Ix3>) -> f32
where
    S: Data<Elem = f32>,
    T: Data<Elem = f32>,
{
    let (min_val, max_val) = dose
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let gel: Vec<f32> = target
        .iter()
        .zip(dose.iter())
        .filter(|&(&t, _)| t > 0.5)
        .map(|(_, &d)| d)
        .collect();
    let void: Vec<f32> = target
        .iter()
        .zip(dose.iter())
        .filter(|&(&t, _)| t <= 0.5)
        .map(|(_, &d)| d)
        .collect();

    if gel.is_empty() || void.is_empty() {
        return (min_val + max_val) / 2.0;
    }

    let num_tests = 100;
    let mut best_thresh = min_val;
    let mut best_score = f32::MIN;
    for i in 0..num_tests {
        let thresh = min_val + (max_val - min_val) * (i as f32) / (num_tests as f32);
        let gel_in_target = gel.iter().filter(|&&d| d >= thresh).count();
        let gel_not_in_target = void.iter().filter(|&&d| d >= thresh).count();
        let score = (gel_in_target as f32 / gel.len() as f32)
            - (gel_not_in_target as f32 / void.len() as f32);
        if score > best_score {
            best_score = score;
            best_thresh = thresh;
        }
    }
    best_thresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn pair() -> (Array3<f32>, Array3<f32>) {
        let target = Array3::from_shape_vec((4, 1, 1), vec![1.0, 1.0, 0.0, 0.0]).unwrap();
        let dose = Array3::from_shape_vec((4, 1, 1), vec![0.9, 0.8, 0.2, 0.85]).unwrap();
        (target, dose)
    }

    #[test]
    fn test_voxel_error_rate_counts_overlapping_void() {
        let (target, dose) = pair();
        assert_eq!(voxel_error_rate(&target, &dose), 0.25);
        let clean = Array3::from_shape_vec((4, 1, 1), vec![0.9, 0.8, 0.2, 0.1]).unwrap();
        assert_eq!(voxel_error_rate(&target, &clean), 0.0);
    }

    #[test]
    fn test_best_threshold_separates_clean_dose() {
        let (target, _) = pair();
        let clean = Array3::from_shape_vec((4, 1, 1), vec![0.9, 0.8, 0.2, 0.1]).unwrap();
        let t = best_threshold(&target, &clean);
        assert!(t > 0.2 && t <= 0.8, "threshold {t}");
    }
}
