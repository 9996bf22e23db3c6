//! Equal-width histograms over historical attribute values, plus the
//! quartile computation the detector's fences are built from.

/// Histogram with `counts.len()` bins delimited by `counts.len() + 1`
/// edges. Bins are half-open `[edge_i, edge_i+1)`; the final bin is closed
/// on the right so the maximum lands inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    edges: Vec<f64>,
    counts: Vec<u64>,
}

impl Histogram {
    /// Builds a histogram using the Freedman-Diaconis bin width
    /// `2 * IQR * n^(-1/3)`. Degenerate inputs (zero IQR, or a single
    /// distinct value) collapse to one bin spanning the data; constant
    /// data gets the range widened by half a unit on each side.
    pub fn freedman_diaconis(data: &[f64]) -> Histogram {
        if data.is_empty() {
            return Histogram {
                edges: Vec::new(),
                counts: Vec::new(),
            };
        }
        let mut sorted = data.to_vec();
        sorted.sort_by(f64::total_cmp);
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let (q1, q3) = quartiles_sorted(&sorted);
        let width = 2.0 * (q3 - q1) * (sorted.len() as f64).powf(-1.0 / 3.0);

        let bin_count = if width > 0.0 && max > min {
            ((max - min) / width).ceil() as usize
        } else {
            1
        };
        let (lo, hi) = if max > min {
            (min, max)
        } else {
            (min - 0.5, max + 0.5)
        };
        let bin_width = (hi - lo) / bin_count as f64;
        let mut edges: Vec<f64> = (0..=bin_count).map(|i| lo + bin_width * i as f64).collect();
        // The arithmetic above can drift; the last edge must be exact so
        // the maximum falls inside the final bin.
        edges[bin_count] = hi;

        let mut counts = vec![0u64; bin_count];
        for &value in &sorted {
            if let Some(index) = locate(&edges, value) {
                counts[index] += 1;
            }
        }
        Histogram { edges, counts }
    }

    /// The count of the bin containing `x`, or zero when `x` lies outside
    /// all bins.
    pub fn bin_count(&self, x: f64) -> u64 {
        match locate(&self.edges, x) {
            Some(index) => self.counts[index],
            None => 0,
        }
    }
}

fn locate(edges: &[f64], x: f64) -> Option<usize> {
    if edges.len() < 2 {
        return None;
    }
    let bin_count = edges.len() - 1;
    let lo = edges[0];
    let hi = edges[bin_count];
    if x < lo || x > hi {
        return None;
    }
    if x == hi {
        return Some(bin_count - 1);
    }
    // Values equal to an interior edge belong to the bin on its right.
    let index = edges.partition_point(|edge| *edge <= x) - 1;
    Some(index.min(bin_count - 1))
}

/// Linearly interpolated percentile over sorted data, matching the
/// interpolation the original quartile computation used.
pub fn percentile_sorted(sorted: &[f64], percentile: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let position = (sorted.len() - 1) as f64 * percentile / 100.0;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// First and third quartiles of sorted data.
pub fn quartiles_sorted(sorted: &[f64]) -> (f64, f64) {
    (
        percentile_sorted(sorted, 25.0),
        percentile_sorted(sorted, 75.0),
    )
}
