//! Path template macros
//!
//! Ingestion locators carry time markers (`{date}`, `{hour}`, `{minute}`,
//! `{second}`, `{timestamp}`, case-insensitive) plus arbitrary custom
//! markers. Every time marker requires its parent: hour needs date, minute
//! needs hour, second needs minute; timestamp stands alone.

use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

const DATE: u8 = 0x1;
const HOUR: u8 = 0x2;
const MINUTE: u8 = 0x4;
const SECOND: u8 = 0x8;
const TIMESTAMP: u8 = 0x10;

/// Time granularity justified by the markers in a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternMacro {
    Daily,
    Hourly,
    Minutely,
    Secondly,
    Timestamp,
    /// Markers present but the combination is not accepted
    Invalid,
}

static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("marker pattern"));

fn marker_bit(name: &str) -> u8 {
    match name.to_ascii_lowercase().as_str() {
        "date" => DATE,
        "hour" => HOUR,
        "minute" => MINUTE,
        "second" => SECOND,
        "timestamp" => TIMESTAMP,
        _ => 0,
    }
}

pub struct Macro;

impl Macro {
    /// Coarsest granularity justified by the markers present.
    /// `"s3://b/dt={DATE}/hr={HOUR}"` is HOURLY; a minute marker without
    /// an hour marker is INVALID.
    pub fn extract(template: &str) -> PatternMacro {
        let mut code = 0u8;
        for cap in MARKER.captures_iter(template) {
            code |= marker_bit(&cap[1]);
        }
        match code {
            TIMESTAMP => PatternMacro::Timestamp,
            c if c == DATE => PatternMacro::Daily,
            c if c == DATE | HOUR => PatternMacro::Hourly,
            c if c == DATE | HOUR | MINUTE => PatternMacro::Minutely,
            c if c == DATE | HOUR | MINUTE | SECOND => PatternMacro::Secondly,
            _ => PatternMacro::Invalid,
        }
    }

    /// Whether the template mentions any time marker at all
    pub fn has_time_macros(template: &str) -> bool {
        MARKER
            .captures_iter(template)
            .any(|cap| marker_bit(&cap[1]) != 0)
    }

    /// Window width in seconds for one spec of this granularity
    pub fn seconds(macro_: PatternMacro) -> u64 {
        match macro_ {
            PatternMacro::Daily => 86_400,
            PatternMacro::Hourly => 3_600,
            PatternMacro::Minutely => 60,
            PatternMacro::Secondly => 1,
            PatternMacro::Timestamp | PatternMacro::Invalid => 0,
        }
    }

    /// Formatted value for one marker at the given watermark (unix seconds)
    fn time_string(macro_: PatternMacro, watermark: u64) -> String {
        let t = Utc
            .timestamp_opt(watermark as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch"));
        match macro_ {
            PatternMacro::Daily => t.format("%Y-%m-%d").to_string(),
            PatternMacro::Hourly => t.format("%H").to_string(),
            PatternMacro::Minutely => t.format("%M").to_string(),
            PatternMacro::Secondly => t.format("%S").to_string(),
            PatternMacro::Timestamp => watermark.to_string(),
            PatternMacro::Invalid => String::new(),
        }
    }

    fn replace_marker(template: &str, name: &str, replacement: &str) -> String {
        let re = Regex::new(&format!(r"(?i)\{{{}\}}", name)).expect("marker name is literal");
        re.replace_all(template, replacement).into_owned()
    }

    /// Substitute every marker at or above the granularity with values
    /// derived from the watermark, e.g. `"s3://n/dt={DATE}"` at DAILY →
    /// `"s3://n/dt=2020-12-20"`.
    pub fn materialize(macro_: PatternMacro, template: &str, watermark: u64) -> String {
        match macro_ {
            PatternMacro::Invalid => template.to_string(),
            PatternMacro::Timestamp => Self::replace_marker(
                template,
                "timestamp",
                &Self::time_string(PatternMacro::Timestamp, watermark),
            ),
            _ => {
                let levels = [
                    (PatternMacro::Daily, "date"),
                    (PatternMacro::Hourly, "hour"),
                    (PatternMacro::Minutely, "minute"),
                    (PatternMacro::Secondly, "second"),
                ];
                let depth = match macro_ {
                    PatternMacro::Daily => 1,
                    PatternMacro::Hourly => 2,
                    PatternMacro::Minutely => 3,
                    _ => 4,
                };
                let mut out = template.to_string();
                for (level, name) in levels.iter().take(depth) {
                    out = Self::replace_marker(&out, name, &Self::time_string(*level, watermark));
                }
                out
            }
        }
    }

    /// All materialized paths for the Cartesian product of custom macro
    /// values, deduped by path. Each path maps to the value combination
    /// that produced it.
    pub fn enumerate_paths(
        template: &str,
        macro_values: &BTreeMap<String, Vec<String>>,
    ) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut results = BTreeMap::new();
        if macro_values.is_empty() {
            results.insert(template.to_string(), BTreeMap::new());
            return results;
        }

        let names: Vec<&String> = macro_values.keys().collect();
        let pools: Vec<&Vec<String>> = macro_values.values().collect();
        if pools.iter().any(|p| p.is_empty()) {
            return results;
        }

        // odometer over the value pools
        let mut idx = vec![0usize; pools.len()];
        loop {
            let mut path = template.to_string();
            let mut combo = BTreeMap::new();
            for (i, name) in names.iter().enumerate() {
                let value = &pools[i][idx[i]];
                path = Self::replace_marker(&path, name, value);
                combo.insert((*name).clone(), value.clone());
            }
            results.entry(path).or_insert(combo);

            let mut pos = pools.len();
            loop {
                if pos == 0 {
                    return results;
                }
                pos -= 1;
                idx[pos] += 1;
                if idx[pos] < pools[pos].len() {
                    break;
                }
                idx[pos] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_granularity() {
        assert_eq!(
            Macro::extract("s3://b/dt={DATE}/hr={HOUR}"),
            PatternMacro::Hourly
        );
        assert_eq!(Macro::extract("s3://b/ts={timestamp}"), PatternMacro::Timestamp);
        assert_eq!(
            Macro::extract("s3://b/dt={DATE}/mi={MINUTE}"),
            PatternMacro::Invalid
        );
        assert_eq!(Macro::extract("s3://b/dt={date}"), PatternMacro::Daily);
        assert_eq!(
            Macro::extract("s3://b/dt={date}/hr={hour}/mi={minute}/se={second}"),
            PatternMacro::Secondly
        );
        // timestamp never combines with the calendar markers
        assert_eq!(
            Macro::extract("s3://b/dt={date}/ts={timestamp}"),
            PatternMacro::Invalid
        );
        // no time markers at all
        assert_eq!(Macro::extract("s3://b/static/file"), PatternMacro::Invalid);
        assert!(!Macro::has_time_macros("s3://b/{region}/file"));
        assert!(Macro::has_time_macros("s3://b/dt={DATE}"));
    }

    #[test]
    fn test_materialize() {
        // 2020-12-20 13:14:15 UTC
        let wm = 1_608_470_055;
        assert_eq!(
            Macro::materialize(PatternMacro::Daily, "s3://n/dt={DATE}", wm),
            "s3://n/dt=2020-12-20"
        );
        assert_eq!(
            Macro::materialize(
                PatternMacro::Hourly,
                "s3://n/dt={date}/hr={hour}/mi={minute}",
                wm
            ),
            // minute stays: it is below the hourly granularity
            "s3://n/dt=2020-12-20/hr=13/mi={minute}"
        );
        assert_eq!(
            Macro::materialize(PatternMacro::Secondly, "{date}T{hour}:{minute}:{second}", wm),
            "2020-12-20T13:14:15"
        );
        assert_eq!(
            Macro::materialize(PatternMacro::Timestamp, "s3://n/ts={TIMESTAMP}", wm),
            format!("s3://n/ts={}", wm)
        );
    }

    #[test]
    fn test_enumerate_paths() {
        let mut values = BTreeMap::new();
        values.insert("region".to_string(), vec!["us".to_string(), "eu".to_string()]);
        values.insert("tier".to_string(), vec!["hot".to_string()]);

        let paths = Macro::enumerate_paths("s3://b/{region}/{tier}/part", &values);
        assert_eq!(paths.len(), 2);
        let combo = paths.get("s3://b/us/hot/part").unwrap();
        assert_eq!(combo.get("region").map(String::as_str), Some("us"));

        // empty value map keeps the template as the only path
        let paths = Macro::enumerate_paths("s3://b/part", &BTreeMap::new());
        assert_eq!(paths.len(), 1);

        // duplicate-producing values dedup by path
        let mut dup = BTreeMap::new();
        dup.insert("r".to_string(), vec!["x".to_string(), "x".to_string()]);
        let paths = Macro::enumerate_paths("s3://b/{r}", &dup);
        assert_eq!(paths.len(), 1);
    }
}
