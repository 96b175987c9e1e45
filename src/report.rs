//! Text and JSON rendering of collections and distributions.

use std::fmt;

use console::style;
use serde::Serialize;

use crate::{
    backend::procfs::{ProcessDetail, ProcessMetrics},
    core::{
        error::EntityError,
        types::{CollectedResult, Collection, EntityHandle},
    },
    stream::distribution::Distribution,
};

const BAR_WIDTH: usize = 40;

#[derive(Serialize)]
struct RawFailure<'a> {
    handle: &'a EntityHandle,
    reason: String,
}

#[derive(Serialize)]
struct RawReport<'a, D, M> {
    results: &'a [CollectedResult<D, M>],
    failures: Vec<RawFailure<'a>>,
}

/// Pretty JSON with every result and every failure reason.
pub fn render_json<D, M>(collection: &Collection<D, M>) -> Result<String, serde_json::Error>
where
    D: Serialize,
    M: Serialize,
{
    let report = RawReport {
        results: &collection.results,
        failures: collection
            .errors
            .iter()
            .map(|err| RawFailure {
                handle: err.handle(),
                reason: err.to_string(),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&report)
}

/// One block per process followed by the failure summary.
pub struct ProcessListing<'a>(pub &'a Collection<ProcessDetail, ProcessMetrics>);

impl fmt::Display for ProcessListing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.results.is_empty() {
            writeln!(f, "{}", style("No entities").red())?;
        }
        for result in &self.0.results {
            let detail = &result.detail;
            writeln!(
                f,
                "{} - {} [{}] parent {}",
                style(&result.handle).green(),
                detail.command,
                detail.state,
                detail.parent_pid
            )?;
            writeln!(
                f,
                "  Memory: {:.3} MB resident, {} threads, {} cpu ticks",
                result.metrics.resident_mib(),
                detail.threads,
                detail.cpu_ticks
            )?;
        }
        write!(f, "{}", FailureSummary(&self.0.errors))
    }
}

/// "N entities failed" followed by one line per failure; empty when nothing failed.
pub struct FailureSummary<'a>(pub &'a [EntityError]);

impl fmt::Display for FailureSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors = self.0;
        if errors.is_empty() {
            return Ok(());
        }
        let noun = if errors.len() == 1 { "entity" } else { "entities" };
        writeln!(f, "{}", style(format!("{} {} failed:", errors.len(), noun)).red())?;
        for err in errors {
            writeln!(f, "  {}", err)?;
        }
        Ok(())
    }
}

/// Count, share and a proportional bar per group, largest group first.
pub struct DistributionChart<'a>(pub &'a Distribution);

impl fmt::Display for DistributionChart<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let distribution = self.0;
        writeln!(
            f,
            "{} ({} records)",
            style(&distribution.field).bold(),
            distribution.total
        )?;

        let mut groups: Vec<(&String, &usize)> = distribution.counts.iter().collect();
        groups.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let width = groups.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        let largest = groups.first().map(|(_, count)| **count).unwrap_or(0);

        for (label, count) in groups {
            let bar = if largest == 0 {
                0
            } else {
                (count * BAR_WIDTH).div_ceil(largest)
            };
            let share = *count as f64 * 100.0 / distribution.total.max(1) as f64;
            writeln!(
                f,
                "  {:<width$}  {:>6}  {:>5.1}%  {}",
                label,
                count,
                share,
                style("█".repeat(bar)).cyan(),
                width = width
            )?;
        }
        Ok(())
    }
}

pub fn render_processes(collection: &Collection<ProcessDetail, ProcessMetrics>) -> String {
    ProcessListing(collection).to_string()
}

pub fn render_failures(errors: &[EntityError]) -> String {
    FailureSummary(errors).to_string()
}

pub fn render_distribution(distribution: &Distribution) -> String {
    DistributionChart(distribution).to_string()
}
