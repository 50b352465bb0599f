/// Number of histogram bins used for automatic thresholding.
pub const HISTOGRAM_BINS: usize = 256;

/// Fixed-width histogram over the range of the finite input values.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub counts: Vec<u64>,
}

impl Histogram {
    /// Builds a histogram of every finite value. Returns `None` if there is
    /// none.
    pub fn build<'a, I>(values: I, bins: usize) -> Option<Self>
    where
        I: IntoIterator<Item = &'a f32>,
    {
        let finite: Vec<f64> = values
            .into_iter()
            .filter(|v| v.is_finite())
            .map(|v| f64::from(*v))
            .collect();
        if finite.is_empty() || bins == 0 {
            return None;
        }

        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut counts = vec![0u64; bins];
        let width = (max - min) / bins as f64;
        for v in finite {
            let bin = if width > 0.0 {
                (((v - min) / width) as usize).min(bins - 1)
            } else {
                0
            };
            counts[bin] += 1;
        }
        Some(Self { min, max, counts })
    }

    pub fn bin_width(&self) -> f64 {
        (self.max - self.min) / self.counts.len() as f64
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Otsu's method: the threshold maximizing between-class variance.
///
/// The threshold is the upper edge of the best splitting bin, so values
/// strictly above it form the foreground class. With no finite input the
/// threshold is `0.0`; with a constant input it is that constant.
pub fn otsu_threshold<'a, I>(values: I) -> f32
where
    I: IntoIterator<Item = &'a f32>,
{
    let Some(histogram) = Histogram::build(values, HISTOGRAM_BINS) else {
        return 0.0;
    };
    if histogram.max <= histogram.min {
        return histogram.min as f32;
    }

    let total = histogram.total() as f64;
    let weighted_total: f64 = histogram
        .counts
        .iter()
        .enumerate()
        .map(|(i, c)| i as f64 * *c as f64)
        .sum();

    let mut background = 0f64;
    let mut weighted_background = 0f64;
    let mut best_variance = -1f64;
    let mut best_bin = 0usize;

    for (bin, count) in histogram.counts.iter().enumerate() {
        let count = *count as f64;
        background += count;
        if background == 0.0 {
            continue;
        }
        let foreground = total - background;
        if foreground == 0.0 {
            break;
        }
        weighted_background += bin as f64 * count;
        let mean_background = weighted_background / background;
        let mean_foreground = (weighted_total - weighted_background) / foreground;
        let variance = background * foreground * (mean_background - mean_foreground).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_bin = bin;
        }
    }

    (histogram.min + (best_bin + 1) as f64 * histogram.bin_width()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_nan_threshold_is_zero() {
        let values = vec![f32::NAN; 16];
        assert_eq!(otsu_threshold(&values), 0.0);
        assert_eq!(otsu_threshold(&Vec::<f32>::new()), 0.0);
    }

    #[test]
    fn test_constant_image_threshold_is_the_constant() {
        let values = vec![0.25f32; 10];
        assert_eq!(otsu_threshold(&values), 0.25);
    }

    #[test]
    fn test_two_clusters_split_between() {
        let mut values = vec![0.1f32; 50];
        values.extend(vec![0.9f32; 50]);
        let t = otsu_threshold(&values);
        assert!(t > 0.1 && t < 0.9, "threshold {} not between clusters", t);
        assert_eq!(values.iter().filter(|v| **v > t).count(), 50);
    }

    #[test]
    fn test_histogram_counts_every_finite_value() {
        let values = [0.0f32, 0.5, 1.0, f32::NAN, f32::INFINITY];
        let histogram = Histogram::build(&values, 4).unwrap();
        assert_eq!(histogram.total(), 3);
        assert_eq!(histogram.counts, vec![1, 0, 1, 1]);
    }
}
