use rand::Rng;
use rand::distr::Uniform;
use rand_distr::{Distribution, Normal};

use crate::errors::{HeError, HeResult};

/// Sample `count` rounded Gaussian noise terms, as used for encryption error.
pub fn gaussian_noise<R: Rng + ?Sized>(
    std_dev: f64,
    count: usize,
    rng: &mut R,
) -> HeResult<Vec<f64>> {
    let normal = Normal::new(0.0, std_dev).map_err(|e| {
        HeError::invalid_parameter(format!("noise std_dev {std_dev}: {e}"))
    })?;
    Ok((0..count).map(|_| normal.sample(rng).round()).collect())
}

/// Sample `count` values uniformly from `[-bound, bound)`.
pub fn uniform_reals<R: Rng + ?Sized>(
    bound: f64,
    count: usize,
    rng: &mut R,
) -> HeResult<Vec<f64>> {
    let dist = Uniform::new(-bound, bound).map_err(|e| {
        HeError::invalid_parameter(format!("mask bound {bound}: {e}"))
    })?;
    Ok((0..count).map(|_| dist.sample(rng)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn gaussian_noise_is_integral_and_small() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let noise = gaussian_noise(3.2, 4096, &mut rng).unwrap();
        assert_eq!(noise.len(), 4096);
        assert!(noise.iter().all(|e| e.fract() == 0.0));
        assert!(noise.iter().all(|e| e.abs() < 3.2 * 10.0));
        let mean = noise.iter().sum::<f64>() / noise.len() as f64;
        assert!(mean.abs() < 0.5, "mean {mean}");
    }

    #[test]
    fn uniform_reals_stay_in_range() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let values = uniform_reals(5.0, 1000, &mut rng).unwrap();
        assert!(values.iter().all(|v| (-5.0..5.0).contains(v)));
    }

    #[test]
    fn invalid_bounds_are_errors() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        assert!(gaussian_noise(-1.0, 4, &mut rng).is_err());
        assert!(uniform_reals(0.0, 4, &mut rng).is_err());
    }
}
