//! Window statistics behind the critical-transition indicators.

/// Variances below this are treated as a flat series.
pub(crate) const VARIANCE_EPSILON: f64 = 1e-12;

pub fn mean(series: &[f64]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    series.iter().sum::<f64>() / series.len() as f64
}

/// Population variance.
pub fn variance(series: &[f64]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let m = mean(series);
    series.iter().map(|v| (v - m).powi(2)).sum::<f64>() / series.len() as f64
}

/// Lag-1 autocorrelation. Flat or too-short series return 0.
pub fn lag1_autocorrelation(series: &[f64]) -> f64 {
    if series.len() < 3 {
        return 0.0;
    }
    let m = mean(series);
    let denominator: f64 = series.iter().map(|v| (v - m).powi(2)).sum();
    if denominator < VARIANCE_EPSILON {
        return 0.0;
    }
    let numerator: f64 = series
        .windows(2)
        .map(|pair| (pair[0] - m) * (pair[1] - m))
        .sum();
    numerator / denominator
}

/// Fraction of consecutive pairs that cross the series mean.
pub fn mean_crossing_rate(series: &[f64]) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    let m = mean(series);
    let crossings = series
        .windows(2)
        .filter(|pair| (pair[0] - m) * (pair[1] - m) < 0.0)
        .count();
    crossings as f64 / (series.len() - 1) as f64
}

/// Pearson correlation of two equally long series. Flat series return 0.
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let (ma, mb) = (mean(a), mean(b));
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    if va < VARIANCE_EPSILON || vb < VARIANCE_EPSILON {
        return 0.0;
    }
    cov / (va * vb).sqrt()
}

/// Mean absolute pairwise correlation across dimension series.
pub fn average_abs_correlation(series: &[Vec<f64>]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..series.len() {
        for j in (i + 1)..series.len() {
            total += pearson_correlation(&series[i], &series[j]).abs();
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

/// Column `index` of a row-major history.
pub(crate) fn column(rows: &[Vec<f64>], index: usize) -> Vec<f64> {
    rows.iter()
        .filter_map(|row| row.get(index).copied())
        .collect()
}
