use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::EngineError;

/// The calendar unit of a timeframe. Month is uppercase `M` in labels to
/// disambiguate from minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeframeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeframeUnit {
    pub fn minutes(self) -> u32 {
        match self {
            TimeframeUnit::Minute => 1,
            TimeframeUnit::Hour => 60,
            TimeframeUnit::Day => 1_440,
            TimeframeUnit::Week => 10_080,
            TimeframeUnit::Month => 43_200,
        }
    }

    fn tag(self) -> char {
        match self {
            TimeframeUnit::Minute => 'm',
            TimeframeUnit::Hour => 'h',
            TimeframeUnit::Day => 'd',
            TimeframeUnit::Week => 'w',
            TimeframeUnit::Month => 'M',
        }
    }

    fn from_tag(c: char) -> Option<Self> {
        match c {
            'm' => Some(TimeframeUnit::Minute),
            'h' => Some(TimeframeUnit::Hour),
            'd' => Some(TimeframeUnit::Day),
            'w' => Some(TimeframeUnit::Week),
            'M' => Some(TimeframeUnit::Month),
            _ => None,
        }
    }
}

/// A bar duration paired with its canonical textual forms.
///
/// Two label grammars are accepted: leading-unit (`m5`, `h1`, `M1`) and
/// leading-number (`5m`, `1h`, `1M`). The leading-unit form is the standard
/// label used for aligned-frame column prefixes; the leading-number form is
/// what data stores key their tables by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    unit: TimeframeUnit,
    count: u32,
}

impl Timeframe {
    pub fn new(unit: TimeframeUnit, count: u32) -> Self {
        Self { unit, count }
    }

    /// Parse either accepted label grammar.
    pub fn parse(label: &str) -> Result<Self, EngineError> {
        let invalid = || EngineError::InvalidTimeframe(label.to_string());

        let mut chars = label.chars();
        let first = chars.next().ok_or_else(invalid)?;

        let (unit, digits) = if first.is_ascii_digit() {
            // Leading-number form: digits followed by exactly one unit char.
            let digit_len = label.chars().take_while(char::is_ascii_digit).count();
            let (num, rest) = label.split_at(digit_len);
            let mut rest_chars = rest.chars();
            let tag = rest_chars.next().ok_or_else(invalid)?;
            if rest_chars.next().is_some() {
                return Err(invalid());
            }
            (TimeframeUnit::from_tag(tag).ok_or_else(invalid)?, num)
        } else {
            // Leading-unit form: one unit char followed by digits.
            let unit = TimeframeUnit::from_tag(first).ok_or_else(invalid)?;
            let digits = &label[first.len_utf8()..];
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            (unit, digits)
        };

        let count: u32 = digits.parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }
        Ok(Self { unit, count })
    }

    /// Canonical leading-unit label, e.g. `m5`, `h1`, `M1`. Used as the
    /// column prefix for higher timeframes in aligned frames.
    pub fn standard(&self) -> String {
        format!("{}{}", self.unit.tag(), self.count)
    }

    /// Canonical leading-number label, e.g. `5m`, `1h`, `1M`. Used by data
    /// stores for table and file naming.
    pub fn db(&self) -> String {
        format!("{}{}", self.count, self.unit.tag())
    }

    /// Duration in minutes.
    pub fn minutes(&self) -> u32 {
        self.count * self.unit.minutes()
    }

    /// Duration in seconds.
    pub fn seconds(&self) -> i64 {
        i64::from(self.minutes()) * 60
    }
}

/// Convert any accepted label to the standard (leading-unit) form.
pub fn to_standard(label: &str) -> Result<String, EngineError> {
    Ok(Timeframe::parse(label)?.standard())
}

/// Convert any accepted label to the db (leading-number) form.
pub fn to_db(label: &str) -> Result<String, EngineError> {
    Ok(Timeframe::parse(label)?.db())
}

/// Duration in minutes of any accepted label.
pub fn to_minutes(label: &str) -> Result<u32, EngineError> {
    Ok(Timeframe::parse(label)?.minutes())
}

/// Whether two labels denote the same duration. Unparseable labels are
/// equivalent to nothing.
pub fn are_equivalent(a: &str, b: &str) -> bool {
    match (Timeframe::parse(a), Timeframe::parse(b)) {
        (Ok(a), Ok(b)) => a.minutes() == b.minutes(),
        _ => false,
    }
}

/// Find the label in `available` that denotes the same duration as `wanted`.
pub fn find_matching<'a>(wanted: &str, available: &'a [String]) -> Option<&'a String> {
    available.iter().find(|label| are_equivalent(wanted, label))
}

/// Determine which label form of `wanted` is in use as a column prefix among
/// `column_names` (e.g. `h1` when an `h1_close` column exists).
pub fn get_column_prefix(wanted: &str, column_names: &[String]) -> Option<String> {
    let tf = Timeframe::parse(wanted).ok()?;
    for candidate in [tf.standard(), tf.db()] {
        let prefix = format!("{candidate}_");
        if column_names.iter().any(|name| name.starts_with(&prefix)) {
            return Some(candidate);
        }
    }
    None
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.standard())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::parse(s)
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.standard())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Timeframe::parse(&label).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_leading_unit_form() {
        assert_eq!(Timeframe::parse("m5").unwrap().minutes(), 5);
        assert_eq!(Timeframe::parse("h1").unwrap().minutes(), 60);
        assert_eq!(Timeframe::parse("d1").unwrap().minutes(), 1_440);
        assert_eq!(Timeframe::parse("w1").unwrap().minutes(), 10_080);
        assert_eq!(Timeframe::parse("M1").unwrap().minutes(), 43_200);
    }

    #[test]
    fn parses_leading_number_form() {
        assert_eq!(Timeframe::parse("5m").unwrap().minutes(), 5);
        assert_eq!(Timeframe::parse("1h").unwrap().minutes(), 60);
        assert_eq!(Timeframe::parse("1d").unwrap().minutes(), 1_440);
        assert_eq!(Timeframe::parse("1w").unwrap().minutes(), 10_080);
        assert_eq!(Timeframe::parse("1M").unwrap().minutes(), 43_200);
    }

    #[test]
    fn month_is_case_sensitive() {
        // `1M` is one month; `1m` is one minute.
        assert_eq!(Timeframe::parse("1M").unwrap().minutes(), 43_200);
        assert_eq!(Timeframe::parse("1m").unwrap().minutes(), 1);
        assert_eq!(Timeframe::parse("M1").unwrap().minutes(), 43_200);
        assert_eq!(Timeframe::parse("m1").unwrap().minutes(), 1);
    }

    #[test]
    fn rejects_garbage_labels() {
        for bad in ["", "5", "m", "x5", "5x", "m5h", "55mm", "h-1", "0m", "m0"] {
            assert!(
                Timeframe::parse(bad).is_err(),
                "label '{bad}' should not parse"
            );
        }
    }

    #[test]
    fn label_round_trips() {
        for label in ["m5", "5m", "h1", "1h", "h4", "4h", "d1", "1d", "1w", "M1", "1M"] {
            let std_form = to_standard(label).unwrap();
            let db_form = to_db(&std_form).unwrap();
            assert_eq!(db_form, to_db(label).unwrap());
            assert_eq!(to_minutes(&std_form).unwrap(), to_minutes(label).unwrap());
        }
    }

    #[test]
    fn standard_and_db_forms() {
        let tf = Timeframe::parse("15m").unwrap();
        assert_eq!(tf.standard(), "m15");
        assert_eq!(tf.db(), "15m");

        let tf = Timeframe::parse("h1").unwrap();
        assert_eq!(tf.standard(), "h1");
        assert_eq!(tf.db(), "1h");
    }

    #[test]
    fn equivalence_across_forms() {
        assert!(are_equivalent("m5", "5m"));
        assert!(are_equivalent("h1", "1h"));
        assert!(are_equivalent("60m", "1h"));
        assert!(!are_equivalent("m5", "m15"));
        assert!(!are_equivalent("1M", "1m"));
        assert!(!are_equivalent("nope", "5m"));
    }

    #[test]
    fn find_matching_prefers_equivalents() {
        let available = vec!["1h".to_string(), "5m".to_string(), "1d".to_string()];
        assert_eq!(find_matching("h1", &available), Some(&"1h".to_string()));
        assert_eq!(find_matching("m5", &available), Some(&"5m".to_string()));
        assert_eq!(find_matching("m15", &available), None);
    }

    #[test]
    fn column_prefix_detection() {
        let columns = vec![
            "open".to_string(),
            "close".to_string(),
            "h1_close".to_string(),
            "h1_high".to_string(),
        ];
        assert_eq!(get_column_prefix("1h", &columns), Some("h1".to_string()));
        assert_eq!(get_column_prefix("h1", &columns), Some("h1".to_string()));
        assert_eq!(get_column_prefix("d1", &columns), None);
    }

    #[test]
    fn display_and_fromstr() {
        let tf: Timeframe = "4h".parse().unwrap();
        assert_eq!(tf.to_string(), "h4");
        assert_eq!(tf.seconds(), 14_400);
    }
}
