//! Deterministic spec enumeration
//!
//! Turns a table configuration into the full snapshot of ingestion specs
//! for the current watermark: custom markers expand by Cartesian product,
//! then the time window `[now - retention, now]` is walked at the
//! granularity of the locator template. Identical inputs always produce
//! identical spec ids; the registry diffs the snapshot.

use crate::meta::locator::{local_path, Locator};
use crate::meta::macros::{Macro, PatternMacro};
use crate::meta::spec::Spec;
use crate::meta::TableConfig;
use crate::{NebulaError, Result};

#[derive(Debug, Default)]
pub struct SpecProvider;

impl SpecProvider {
    pub fn new() -> Self {
        Self
    }

    /// Generate the current snapshot for one table. `now` is the walk's
    /// upper watermark in unix seconds.
    pub fn generate(&self, version: &str, table: &TableConfig, now: u64) -> Result<Vec<Spec>> {
        // reject malformed locators before touching the registry
        Locator::parse(&table.locator)?;

        let granularity = Macro::extract(&table.locator);
        if granularity == PatternMacro::Invalid && Macro::has_time_macros(&table.locator) {
            return Err(NebulaError::Config(format!(
                "invalid macro combination in locator '{}'",
                table.locator
            )));
        }

        let mut specs = Vec::new();
        for (path, _combo) in Macro::enumerate_paths(&table.locator, &table.macros) {
            match granularity {
                PatternMacro::Invalid => {
                    // no time markers: a single static spec covering the
                    // whole retention window
                    let start = now.saturating_sub(table.retention_seconds);
                    specs.push(self.spec_for(version, table, path, start, now));
                }
                PatternMacro::Timestamp => {
                    let materialized = Macro::materialize(granularity, &path, now);
                    specs.push(self.spec_for(version, table, materialized, now, now));
                }
                _ => {
                    let step = Macro::seconds(granularity);
                    let horizon = now.saturating_sub(table.retention_seconds);
                    let mut watermark = horizon - horizon % step;
                    while watermark <= now {
                        let materialized = Macro::materialize(granularity, &path, watermark);
                        specs.push(self.spec_for(
                            version,
                            table,
                            materialized,
                            watermark,
                            watermark + step - 1,
                        ));
                        watermark += step;
                    }
                }
            }
        }
        Ok(specs)
    }

    fn spec_for(
        &self,
        version: &str,
        table: &TableConfig,
        locator: String,
        time_start: u64,
        time_end: u64,
    ) -> Spec {
        let fingerprint = source_fingerprint(&locator);
        Spec::new(
            version,
            table.name.clone(),
            locator,
            time_start,
            time_end,
            fingerprint,
        )
    }
}

/// Size/mtime fingerprint for statable local sources; remote sources keep
/// an empty fingerprint until their adapter reports one.
fn source_fingerprint(locator: &str) -> String {
    let Ok(path) = local_path(locator) else {
        return String::new();
    };
    match std::fs::metadata(&path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("{}_{}", meta.len(), mtime)
        }
        Err(_) => String::new(),
    }
}
