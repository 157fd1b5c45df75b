//! Wall-clock profiling driven purely by lifecycle events.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::info;

use crate::{
    algorithm::Trace, event::Event, observer::Observer, state::State, Result, TrainingError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SectionStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl SectionStats {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total.div_f64(self.count as f64)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    /// Time between each `Before*` event and its `After*`, keyed by section.
    pub sections: BTreeMap<&'static str, SectionStats>,
    /// Time between `BATCH_START` and `BATCH_END`.
    pub batches: SectionStats,
    pub event_counts: BTreeMap<Event, u64>,
}

#[derive(Debug, Default)]
struct Inner {
    report: ProfileReport,
    open_section: Option<(&'static str, Instant)>,
    batch_started: Option<Instant>,
}

/// Observer that times the sections of every batch.
///
/// Keep a [`ProfilerHandle`] to read the report after the profiler has been
/// handed to the engine.
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    inner: Arc<Mutex<Inner>>,
}

/// Read access to a profiler owned by the engine.
#[derive(Debug, Clone)]
pub struct ProfilerHandle {
    inner: Arc<Mutex<Inner>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ProfilerHandle {
        ProfilerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| TrainingError::runtime("profiler state poisoned"))
    }
}

impl ProfilerHandle {
    pub fn report(&self) -> ProfileReport {
        match self.inner.lock() {
            Ok(inner) => inner.report.clone(),
            Err(poisoned) => poisoned.into_inner().report.clone(),
        }
    }
}

impl Observer for Profiler {
    fn name(&self) -> &str {
        "profiler"
    }

    fn on_event(&mut self, event: Event, _state: &State, _traces: &[Trace]) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        *inner.report.event_counts.entry(event).or_insert(0) += 1;

        if event.is_before() {
            if let Some(section) = event.section() {
                inner.open_section = Some((section, now));
            }
        } else if event.is_after() {
            if let Some((section, started)) = inner.open_section.take() {
                inner
                    .report
                    .sections
                    .entry(section)
                    .or_default()
                    .record(now.duration_since(started));
            }
        }

        match event {
            Event::BatchStart => inner.batch_started = Some(now),
            Event::BatchEnd => {
                if let Some(started) = inner.batch_started.take() {
                    inner.report.batches.record(now.duration_since(started));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let inner = self.lock()?;
        let report = &inner.report;
        info!(
            batches = report.batches.count,
            mean_batch_ms = report.batches.mean().as_secs_f64() * 1e3,
            "profiler summary"
        );
        for (section, stats) in &report.sections {
            info!(
                section = *section,
                count = stats.count,
                mean_ms = stats.mean().as_secs_f64() * 1e3,
                max_ms = stats.max.as_secs_f64() * 1e3,
                "profiler section"
            );
        }
        Ok(())
    }
}
