//! Row-loading simulation
//!
//! Models a list view whose rows load through a fetch -> transform chain.
//! The first screen requests every row, a few rows are requested again while
//! still loading (superseding their first chain), a few are scrolled away
//! (cancelled), and finally the user scrolls back over the whole list.

use super::config::DemoConfig;
use crate::task::{
    Chain, KeyedTaskCache, LoggingEventHandler, Lookup, Scheduler, SchedulerStats, Task,
};
use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Summary of a simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub rows: usize,
    pub workers: usize,
    /// Requests that submitted a new chain
    pub scheduled: usize,
    /// Requests answered from the cache without scheduling anything
    pub cache_hits: usize,
    pub superseded: usize,
    pub scrolled_away: usize,
    /// Values handed to row callbacks
    pub delivered: usize,
    /// Deliveries that did not come from their row's latest chain
    pub stale_deliveries: usize,
    /// Rows with a cached value at the end of the run
    pub rows_loaded: usize,
    pub stats: SchedulerStats,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Tally {
    scheduled: usize,
    cache_hits: usize,
}

impl Tally {
    fn record(&mut self, lookup: &Lookup<String>) {
        match lookup {
            Lookup::Cached(_) => self.cache_hits += 1,
            Lookup::Scheduled { .. } => self.scheduled += 1,
        }
    }
}

/// Issues row requests and remembers which attempt each row is on
struct RowFeed {
    cache: KeyedTaskCache<usize, String>,
    latency_ms: RangeInclusive<u64>,
    attempts: Mutex<HashMap<usize, usize>>,
    deliveries: Arc<Mutex<Vec<(usize, String)>>>,
}

impl RowFeed {
    fn new(cache: KeyedTaskCache<usize, String>, latency_ms: RangeInclusive<u64>) -> Self {
        Self {
            cache,
            latency_ms,
            attempts: Mutex::new(HashMap::new()),
            deliveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn request(&self, row: usize) -> Result<Lookup<String>> {
        let deliveries = Arc::clone(&self.deliveries);
        let lookup = self.cache.request(
            row,
            || self.build_chain(row),
            move |value| {
                debug!("Row {} ready: {}", row, value);
                deliveries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((row, value));
            },
        )?;
        Ok(lookup)
    }

    fn build_chain(&self, row: usize) -> Result<Chain<String>, crate::task::SchedulerError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let attempt = attempts.entry(row).or_insert(0);
            *attempt += 1;
            *attempt
        };
        let mut rng = rand::rng();
        let fetch_ms = rng.random_range(self.latency_ms.clone());
        let transform_ms = rng.random_range(self.latency_ms.clone());

        let fetch = Task::from_future(format!("row-{row}/fetch"), move |_| async move {
            tokio::time::sleep(Duration::from_millis(fetch_ms)).await;
            raw_row(row, attempt)
        });
        let transform = Task::from_future(
            format!("row-{row}/transform"),
            move |inputs: Vec<String>| async move {
                tokio::time::sleep(Duration::from_millis(transform_ms)).await;
                inputs.concat().to_uppercase()
            },
        );
        Chain::new(fetch).then(transform)
    }

    /// What the row should show if only its latest chain was delivered
    fn expected(&self, row: usize) -> Option<String> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&row)
            .map(|attempt| raw_row(row, *attempt).to_uppercase())
    }
}

fn raw_row(row: usize, attempt: usize) -> String {
    format!("row {row} (attempt {attempt})")
}

/// Run the simulation described by `config` on the current runtime
pub async fn run_simulation(config: &DemoConfig) -> Result<SimulationReport> {
    config.validate()?;
    let sim = &config.simulation;
    let scheduler = Scheduler::with_event_handlers(
        config.scheduler.clone(),
        vec![Box::new(LoggingEventHandler)],
    )?;
    let feed = RowFeed::new(
        KeyedTaskCache::new(scheduler.clone()),
        sim.min_latency_ms..=sim.max_latency_ms,
    );
    let started = Instant::now();
    let mut tally = Tally::default();

    info!("Loading first screen of {} rows", sim.rows);
    for row in 0..sim.rows {
        tally.record(&feed.request(row)?);
    }

    let mut superseded = 0;
    for row in 0..sim.rerequests {
        let was_pending = feed.cache.is_pending(&row);
        let lookup = feed.request(row)?;
        if was_pending && matches!(lookup, Lookup::Scheduled { .. }) {
            superseded += 1;
        }
        tally.record(&lookup);
    }

    let mut scrolled_away = 0;
    for row in sim.rows - sim.scroll_away..sim.rows {
        if feed.cache.cancel(&row) {
            scrolled_away += 1;
        }
    }
    info!(
        "Superseded {} rows and scrolled {} rows away",
        superseded, scrolled_away
    );
    scheduler.wait_idle().await;

    info!("Scrolling back over all {} rows", sim.rows);
    for row in 0..sim.rows {
        tally.record(&feed.request(row)?);
    }
    scheduler.wait_idle().await;

    let deliveries = feed
        .deliveries
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let stale_deliveries = deliveries
        .iter()
        .filter(|(row, value)| feed.expected(*row).as_ref() != Some(value))
        .count();
    let rows_loaded = (0..sim.rows)
        .filter(|row| feed.cache.cached(row).is_some())
        .count();

    Ok(SimulationReport {
        rows: sim.rows,
        workers: config.scheduler.max_concurrent_tasks,
        scheduled: tally.scheduled,
        cache_hits: tally.cache_hits,
        superseded,
        scrolled_away,
        delivered: deliveries.len(),
        stale_deliveries,
        rows_loaded,
        stats: scheduler.stats(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Print a report for humans, or as JSON
pub fn print_report(report: &SimulationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("📊 Simulation summary");
    println!("  Rows: {} ({} loaded)", report.rows, report.rows_loaded);
    println!("  Workers: {}", report.workers);
    println!(
        "  Requests: {} scheduled, {} cache hits",
        report.scheduled, report.cache_hits
    );
    println!(
        "  Superseded: {}, scrolled away: {}",
        report.superseded, report.scrolled_away
    );
    println!(
        "  Delivered: {} ({} stale)",
        report.delivered, report.stale_deliveries
    );
    println!(
        "  Tasks: {} submitted, {} started, {} completed, {} cancelled",
        report.stats.submitted, report.stats.started, report.stats.completed, report.stats.cancelled
    );
    println!("  Peak executing: {}", report.stats.peak_executing);
    println!("  Elapsed: {} ms", report.elapsed_ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simulation_loads_every_row() {
        let mut config = DemoConfig::default();
        config.simulation.rows = 12;
        config.simulation.scroll_away = 4;
        config.simulation.rerequests = 2;
        config.simulation.min_latency_ms = 1;
        config.simulation.max_latency_ms = 5;
        config.scheduler.max_concurrent_tasks = 3;

        let report = run_simulation(&config).await.unwrap();

        assert_eq!(report.rows_loaded, 12);
        assert_eq!(report.stale_deliveries, 0);
        assert!(report.stats.peak_executing <= 3);
        assert_eq!(report.stats.submitted, report.stats.finished());
        assert_eq!(report.scheduled + report.cache_hits, 12 + 2 + 12);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = SimulationReport {
            rows: 1,
            workers: 1,
            scheduled: 1,
            cache_hits: 0,
            superseded: 0,
            scrolled_away: 0,
            delivered: 1,
            stale_deliveries: 0,
            rows_loaded: 1,
            stats: SchedulerStats::default(),
            elapsed_ms: 3,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rows_loaded"], 1);
        assert_eq!(json["stats"]["peak_executing"], 0);
    }
}
