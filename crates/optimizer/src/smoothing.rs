//! Smoothing of parameter maps between optimization rounds.

use anyhow::{bail, Result};
use ndarray::Array2;

pub trait Smoother: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a smoothed copy of an `instances x parameters` matrix.
    fn smooth(&self, parameters: &Array2<f64>) -> Result<Array2<f64>>;
}

/// Median over a window of `2 * radius + 1` neighbouring instances, per parameter.
/// Windows are clipped at both ends of the instance range.
#[derive(Debug, Clone)]
pub struct MedianSmoother {
    radius: usize,
}

impl MedianSmoother {
    pub fn new(radius: usize) -> Self {
        Self { radius }
    }
}

impl Default for MedianSmoother {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Smoother for MedianSmoother {
    fn name(&self) -> &str {
        "median"
    }

    fn smooth(&self, parameters: &Array2<f64>) -> Result<Array2<f64>> {
        if parameters.iter().any(|v| v.is_nan()) {
            bail!("cannot smooth a parameter map holding NaN");
        }
        let n = parameters.nrows();
        let mut smoothed = parameters.clone();
        for (column, mut target) in parameters.columns().into_iter().zip(smoothed.columns_mut()) {
            for i in 0..n {
                let lo = i.saturating_sub(self.radius);
                let hi = (i + self.radius + 1).min(n);
                let mut window: Vec<f64> = column.slice(ndarray::s![lo..hi]).to_vec();
                window.sort_by(f64::total_cmp);
                let mid = window.len() / 2;
                target[i] = if window.len() % 2 == 0 {
                    0.5 * (window[mid - 1] + window[mid])
                } else {
                    window[mid]
                };
            }
        }
        Ok(smoothed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_median_removes_spikes() {
        let map = array![[1.0, 0.0], [1.0, 0.0], [9.0, 0.0], [1.0, 5.0], [1.0, 0.0]];
        let smoothed = MedianSmoother::new(1).smooth(&map).unwrap();
        assert_eq!(smoothed.column(0).to_vec(), vec![1.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(smoothed.column(1).to_vec(), vec![0.0, 0.0, 0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_zero_radius_is_identity() {
        let map = array![[3.0], [-1.0], [2.0]];
        assert_eq!(MedianSmoother::new(0).smooth(&map).unwrap(), map);
    }

    #[test]
    fn test_nan_maps_are_rejected() {
        assert!(MedianSmoother::default().smooth(&array![[f64::NAN]]).is_err());
    }
}
