use super::threshold::Threshold;

/// Compensated (Neumaier) summation.  Keeps the error bounded over long runs of points.
pub fn compensated_sum(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut comp = 0.0;

    for &v in values {
        let t = sum + v;
        if sum.abs() >= v.abs() {
            comp += (sum - t) + v;
        } else {
            comp += (v - t) + sum;
        }
        sum = t;
    }

    sum + comp
}

/// Reduced statistics for one timer path over one cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerSummary {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
    pub median: f64,
    /// One value per configured threshold, in the same order.
    pub thresholds: Vec<f64>,
}

/// Summarizes a set of timer values, sorting them in place.
///
/// Returns `None` for an empty set.
pub fn summarize(values: &mut [f64], thresholds: &[Threshold]) -> Option<TimerSummary> {
    let count = values.len();
    if count == 0 {
        return None;
    }

    let sum = compensated_sum(values);
    values.sort_unstable_by(|a, b| a.total_cmp(b));

    let mid = count / 2;
    let median = if count % 2 == 0 { (values[mid - 1] + values[mid]) / 2.0 } else { values[mid] };

    Some(TimerSummary {
        count,
        sum,
        mean: sum / count as f64,
        lower: values[0],
        upper: values[count - 1],
        median,
        thresholds: thresholds.iter().map(|t| values[t.index(count)]).collect(),
    })
}

/// Population standard deviation, skewness and excess kurtosis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moments {
    pub stddev: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

/// Computes the higher moments of a value set around a known mean.
///
/// Skewness takes the Fisher-Pearson adjustment once there are more than five points.  Both
/// skewness and kurtosis are zero when every value is the same.
pub fn moments(values: &[f64], mean: f64) -> Option<Moments> {
    let count = values.len();
    if count == 0 {
        return None;
    }

    let mut second = Vec::with_capacity(count);
    let mut third = Vec::with_capacity(count);
    let mut fourth = Vec::with_capacity(count);
    for &v in values {
        let diff = v - mean;
        let sq = diff * diff;
        second.push(sq);
        third.push(sq * diff);
        fourth.push(sq * sq);
    }

    let n = count as f64;
    let variance = compensated_sum(&second) / n;
    let mut skew = compensated_sum(&third);
    let kurt = compensated_sum(&fourth) / n;

    if count > 5 {
        skew *= n;
        skew /= ((count - 1) * (count - 2)) as f64;
    } else {
        skew /= n;
    }

    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return Some(Moments {
            stddev,
            skewness: 0.0,
            kurtosis: 0.0,
        });
    }

    Some(Moments {
        stddev,
        skewness: skew / (stddev * stddev * stddev),
        kurtosis: kurt / (variance * variance) - 3.0,
    })
}

/// Finds the most common value in a sorted set, with how often it occurs.
///
/// Ties go to the lowest value.  Returns `None` unless some value occurs more than once.
pub fn mode(sorted: &[f64]) -> Option<(f64, usize)> {
    let mut best: Option<(f64, usize)> = None;
    let mut i = 0;
    while i < sorted.len() {
        let run = sorted[i..].iter().take_while(|&&v| v == sorted[i]).count();
        if best.map_or(true, |(_, n)| run > n) {
            best = Some((sorted[i], run));
        }
        i += run.max(1);
    }

    best.filter(|&(_, n)| n > 1)
}

#[cfg(test)]
mod tests {
    use super::{compensated_sum, mode, moments, summarize};
    use crate::stats::Threshold;

    fn thresholds(raw: &[&str]) -> Vec<Threshold> { raw.iter().map(|r| Threshold::parse(r).unwrap()).collect() }

    #[test]
    fn test_compensated_sum_keeps_small_values() {
        let mut values = vec![1.0e16];
        values.extend(std::iter::repeat(1.0).take(1000));
        values.push(-1.0e16);
        assert_eq!(compensated_sum(&values), 1000.0);
    }

    #[test]
    fn test_summarize_basic() {
        let mut values = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let s = summarize(&mut values, &thresholds(&["90", "10"])).unwrap();

        assert_eq!(s.count, 5);
        assert_eq!(s.sum, 15.0);
        assert_eq!(s.mean, 3.0);
        assert_eq!(s.lower, 1.0);
        assert_eq!(s.upper, 5.0);
        assert_eq!(s.median, 3.0);
        assert_eq!(s.thresholds, vec![5.0, 1.0]);
    }

    #[test]
    fn test_summarize_even_count_median() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        let s = summarize(&mut values, &[]).unwrap();
        assert_eq!(s.median, 2.5);
    }

    #[test]
    fn test_summarize_extreme_thresholds_stay_in_bounds() {
        let mut values = vec![7.0];
        let s = summarize(&mut values, &thresholds(&["0", "100", "999m"])).unwrap();
        assert_eq!(s.thresholds, vec![7.0, 7.0, 7.0]);

        let mut values = (1..=10).map(f64::from).collect::<Vec<_>>();
        let s = summarize(&mut values, &thresholds(&["0", "100"])).unwrap();
        assert_eq!(s.thresholds, vec![1.0, 10.0]);
    }

    #[test]
    fn test_summarize_empty() {
        assert!(summarize(&mut [], &[]).is_none());
    }

    #[test]
    fn test_moments() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let m = moments(&values, 5.0).unwrap();
        assert_eq!(m.stddev, 2.0);
        assert!(m.skewness > 0.0);

        let flat = moments(&[3.0, 3.0, 3.0], 3.0).unwrap();
        assert_eq!(flat.stddev, 0.0);
        assert_eq!(flat.skewness, 0.0);
        assert_eq!(flat.kurtosis, 0.0);
    }

    #[test]
    fn test_mode() {
        assert_eq!(mode(&[1.0, 2.0, 2.0, 3.0, 3.0, 3.0, 4.0]), Some((3.0, 3)));
        assert_eq!(mode(&[1.0, 1.0, 2.0, 2.0]), Some((1.0, 2)));
        assert_eq!(mode(&[1.0, 2.0, 3.0]), None);
        assert_eq!(mode(&[]), None);
    }
}
