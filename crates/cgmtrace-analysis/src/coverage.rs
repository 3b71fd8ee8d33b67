use crate::stats::rate;
use cgmtrace_config::EventCatalog;
use cgmtrace_ingest_core::EventRecord;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEventCoverage {
    pub event_name: String,
    pub severity: u8,
    pub description: String,
    pub count: u64,
    pub covered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCoverage {
    pub name: String,
    pub total: usize,
    pub covered: usize,
    pub missing: usize,
    pub coverage_rate: f64,
    pub events: Vec<CatalogEventCoverage>,
    pub missing_events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtraEvent {
    pub event_name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub total_known: usize,
    pub covered: usize,
    pub missing: usize,
    pub coverage_rate: f64,
    pub observed_names: usize,
    pub categories: Vec<CategoryCoverage>,
    pub extra_events: Vec<ExtraEvent>,
}

pub fn event_frequencies(events: &[EventRecord]) -> BTreeMap<String, u64> {
    let mut freq = BTreeMap::new();
    for event in events {
        *freq.entry(event.event_name.clone()).or_insert(0) += 1;
    }
    freq
}

pub fn analyze_coverage(freq: &BTreeMap<String, u64>, catalog: &EventCatalog) -> CoverageReport {
    let categories: Vec<CategoryCoverage> = catalog
        .categories
        .iter()
        .map(|category| {
            let events: Vec<CatalogEventCoverage> = category
                .events
                .iter()
                .map(|known| {
                    let count = freq.get(&known.event_name).copied().unwrap_or(0);
                    CatalogEventCoverage {
                        event_name: known.event_name.clone(),
                        severity: known.severity,
                        description: known.description.clone(),
                        count,
                        covered: count > 0,
                    }
                })
                .collect();
            let covered = events.iter().filter(|e| e.covered).count();
            let missing_events = events
                .iter()
                .filter(|e| !e.covered)
                .map(|e| e.event_name.clone())
                .collect();
            CategoryCoverage {
                name: category.name.clone(),
                total: events.len(),
                covered,
                missing: events.len() - covered,
                coverage_rate: rate(covered, events.len()),
                events,
                missing_events,
            }
        })
        .collect();

    let total_known: usize = categories.iter().map(|c| c.total).sum();
    let covered: usize = categories.iter().map(|c| c.covered).sum();

    let mut extra_events: Vec<ExtraEvent> = freq
        .iter()
        .filter(|(name, _)| !catalog.contains(name))
        .map(|(name, count)| ExtraEvent {
            event_name: name.clone(),
            count: *count,
        })
        .collect();
    extra_events.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.event_name.cmp(&b.event_name))
    });

    CoverageReport {
        total_known,
        covered,
        missing: total_known - covered,
        coverage_rate: rate(covered, total_known),
        observed_names: freq.len(),
        categories,
        extra_events,
    }
}
