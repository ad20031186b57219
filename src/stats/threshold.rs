use crate::error::ConfigError;
use std::str::FromStr;

/// A configured timer percentile.
///
/// Written as a plain percentage (`"90"`) or in per-mille with an `m` suffix (`"999m"`).
/// Thresholds below the midpoint report as `lower_NN`, the rest as `upper_NN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Threshold {
    value: u32,
    max: u32,
    label: String,
}

impl Threshold {
    pub fn parse(raw: &str) -> Result<Threshold, ConfigError> {
        let raw = raw.trim();
        let (digits, max) = match raw.strip_suffix('m') {
            Some(digits) => (digits, 1000),
            None => (raw, 100),
        };

        let value = digits
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidThreshold(raw.to_owned(), "not a whole number"))?;

        if value > max {
            return Err(ConfigError::InvalidThreshold(raw.to_owned(), "out of range"));
        }
        if value * 2 == max {
            return Err(ConfigError::InvalidThreshold(raw.to_owned(), "the median is always reported"));
        }

        let side = if value * 2 < max { "lower" } else { "upper" };
        let label = if max == 1000 {
            format!("{}_{:03}", side, value)
        } else {
            format!("{}_{:02}", side, value)
        };

        Ok(Threshold { value, max, label })
    }

    /// The statistic name this threshold reports under.
    pub fn label(&self) -> &str { &self.label }

    /// Index into `count` sorted values.  Always in range for a non-empty set.
    pub fn index(&self, count: usize) -> usize {
        let idx = (self.value as u64 * count as u64 / u64::from(self.max)) as usize;
        idx.min(count.saturating_sub(1))
    }
}

impl FromStr for Threshold {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Threshold, ConfigError> { Threshold::parse(s) }
}

pub(crate) fn default_thresholds() -> Vec<String> { vec!["90".to_owned(), "95".to_owned(), "99".to_owned()] }

#[cfg(test)]
mod tests {
    use super::Threshold;
    use crate::error::ConfigError;

    #[test]
    fn test_threshold_labels() {
        assert_eq!(Threshold::parse("90").unwrap().label(), "upper_90");
        assert_eq!(Threshold::parse("5").unwrap().label(), "lower_05");
        assert_eq!(Threshold::parse("0").unwrap().label(), "lower_00");
        assert_eq!(Threshold::parse("100").unwrap().label(), "upper_100");
        assert_eq!(Threshold::parse("999m").unwrap().label(), "upper_999");
        assert_eq!(Threshold::parse("1m").unwrap().label(), "lower_001");
    }

    #[test]
    fn test_threshold_rejects_nonsense() {
        assert!(matches!(Threshold::parse("50"), Err(ConfigError::InvalidThreshold(_, _))));
        assert!(matches!(Threshold::parse("500m"), Err(ConfigError::InvalidThreshold(_, _))));
        assert!(matches!(Threshold::parse("101"), Err(ConfigError::InvalidThreshold(_, _))));
        assert!(matches!(Threshold::parse("1001m"), Err(ConfigError::InvalidThreshold(_, _))));
        assert!(matches!(Threshold::parse("ninety"), Err(ConfigError::InvalidThreshold(_, _))));
        assert!(matches!(Threshold::parse("-5"), Err(ConfigError::InvalidThreshold(_, _))));
    }

    #[test]
    fn test_threshold_index_is_clamped() {
        let p90 = Threshold::parse("90").unwrap();
        assert_eq!(p90.index(10), 9);
        assert_eq!(p90.index(100), 90);
        assert_eq!(p90.index(1), 0);

        let max = Threshold::parse("100").unwrap();
        assert_eq!(max.index(10), 9);
        assert_eq!(max.index(1), 0);

        let min = Threshold::parse("0").unwrap();
        assert_eq!(min.index(10), 0);

        let p999 = Threshold::parse("999m").unwrap();
        assert_eq!(p999.index(2000), 1998);
        assert_eq!(p999.index(5), 4);
    }
}
