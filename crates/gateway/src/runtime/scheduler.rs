//! The timed-signal scheduler: a single ticker claiming due rows and
//! dispatching them as durable `timed_signal.fired` signals.
//!
//! Dispatch is at-least-once: the fired signal goes through the durable
//! queue, and consumers dedupe on the payload `idempotency_key`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use nerve_domain::config::SchedulerConfig;
use nerve_domain::error::Result;
use nerve_domain::signal::{types, Signal};
use nerve_domain::timed::TimedSignal;
use nerve_domain::trace::{events, ObsEvent};
use nerve_store::Store;

use super::rrule::{parse_tz, Rrule};

pub struct TimedScheduler {
    store: Arc<Store>,
    obs: Arc<Store>,
    config: SchedulerConfig,
    worker_id: String,
}

/// What a tick did, for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub dispatched: usize,
    pub missed_failed: usize,
    pub missed_skipped: usize,
    pub reclaimed: usize,
}

impl TimedScheduler {
    pub fn new(store: Arc<Store>, obs: Arc<Store>, config: SchedulerConfig) -> Self {
        Self {
            store,
            obs,
            config,
            worker_id: format!("scheduler-{}", uuid::Uuid::new_v4()),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.config.tick_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(worker_id = %self.worker_id, "timed scheduler running");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(&Utc::now()) {
                        Ok(stats) if stats != TickStats::default() => {
                            tracing::debug!(?stats, "scheduler tick");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("timed scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One synchronous pass: reclaim stale claims, claim due rows, dispatch.
    pub fn tick(&self, now: &DateTime<Utc>) -> Result<TickStats> {
        let mut stats = TickStats::default();

        let stale_cutoff = *now - Duration::seconds(self.config.lease_seconds as i64);
        stats.reclaimed = self.store.reclaim_stale_timed(&stale_cutoff)?;

        for ts in self.store.claim_due_timed(now, &self.worker_id)? {
            self.dispatch_one(&ts, now, &mut stats)?;
        }
        Ok(stats)
    }

    /// Catch-up window: 30 minutes baseline; for recurring rows,
    /// `max(baseline, 5% of the period)`.
    fn catchup_window_seconds(&self, rule: Option<&Rrule>) -> i64 {
        let baseline = self.config.catchup_baseline_minutes as i64 * 60;
        match rule {
            Some(rule) => baseline.max(rule.period_seconds() / 20),
            None => baseline,
        }
    }

    fn dispatch_one(&self, ts: &TimedSignal, now: &DateTime<Utc>, stats: &mut TickStats) -> Result<()> {
        let rule = match ts.rrule.as_deref().filter(|r| !r.is_empty()) {
            Some(raw) => match Rrule::parse(raw) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    self.store.mark_timed_failed(ts.id, &format!("bad rrule: {e}"))?;
                    self.record(
                        ObsEvent::error(events::TIMED_MISSED, &ts.correlation_id)
                            .with_status("failed")
                            .with_detail(&format!("bad rrule: {e}")),
                    );
                    stats.missed_failed += 1;
                    return Ok(());
                }
            },
            None => None,
        };

        let lag = (*now - ts.trigger_at).num_seconds();
        if lag > self.catchup_window_seconds(rule.as_ref()) {
            match &rule {
                None => {
                    self.store.mark_timed_failed(ts.id, "missed_dispatch_window")?;
                    self.record(
                        ObsEvent::error(events::TIMED_MISSED, &ts.correlation_id)
                            .with_status("failed")
                            .with_detail("missed_dispatch_window"),
                    );
                    stats.missed_failed += 1;
                }
                Some(rule) => {
                    // This occurrence is lost; the series continues at the
                    // next future occurrence.
                    self.store.mark_timed_skipped(ts.id)?;
                    if let Some(next) = rule.next_occurrence(now, parse_tz(&ts.timezone)) {
                        self.store.schedule_next_occurrence(ts, &next)?;
                    }
                    self.record(
                        ObsEvent::info(events::TIMED_MISSED, &ts.correlation_id)
                            .with_status("skipped")
                            .with_detail("missed_dispatch_window"),
                    );
                    stats.missed_skipped += 1;
                }
            }
            return Ok(());
        }

        // Durable dispatch: the queue poller feeds it to the FSM.
        let signal = Signal::new(
            types::TIMED_SIGNAL_FIRED,
            "scheduler",
            serde_json::json!({
                "signal_type": ts.signal_type,
                "payload": ts.payload,
                "target": ts.target,
                "origin": ts.origin,
                "idempotency_key": format!("timed:{}:{}", ts.id, ts.attempts),
            }),
        )
        .with_correlation(ts.correlation_id.clone())
        .durable();
        self.store.enqueue_signal(&signal)?;
        self.store.mark_timed_fired(ts.id, now)?;

        if let Some(rule) = &rule {
            if let Some(next) = rule.next_occurrence(now, parse_tz(&ts.timezone)) {
                self.store.schedule_next_occurrence(ts, &next)?;
            }
        }

        self.record(
            ObsEvent::info(events::TIMED_DISPATCHED, &ts.correlation_id)
                .with_status("fired")
                .with_detail(&ts.signal_type),
        );
        stats.dispatched += 1;
        Ok(())
    }

    fn record(&self, event: ObsEvent) {
        event.emit();
        if let Err(e) = self.obs.record_event(&event) {
            tracing::warn!(error = %e, "observability write failed");
        }
    }
}
