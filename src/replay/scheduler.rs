//! Replay orchestration: `Idle -> Streaming -> Draining -> Done`.
//!
//! One row is in flight at a time. The next row is requested from the source only after the
//! current row was skipped or fully published, which keeps broker order equal to file order and
//! leaves the enrichment flag untouched by anything but this loop.

use crate::config::ReplayConfig;
use crate::domain::Row;
use crate::error::{Context, Error, Result};
use crate::replay::catalog::ColumnCatalog;
use crate::replay::clock::{
    time_of_day, until_time_of_day, ReplayClock, ScheduleDecision, TimeSynchronizer,
};
use crate::replay::identity::IdentityResolver;
use crate::replay::message::{ColumnPlan, MessageAssembler};
use crate::replay::source::RowSource;
use crate::replay_event;
use crate::transport::broker::publish_instrumented;
use crate::transport::{Publisher, ATTRIBUTES_TOPIC, CONNECT_TOPIC, TELEMETRY_TOPIC};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ReplayPhase {
    #[default]
    Idle,
    Streaming,
    Draining,
    Done,
}

impl ReplayPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplayPhase::Idle => "idle",
            ReplayPhase::Streaming => "streaming",
            ReplayPhase::Draining => "draining",
            ReplayPhase::Done => "done",
        }
    }
}

impl Display for ReplayPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler-owned run state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayState {
    pub enrichment_sent: bool,
    /// Line of the last row taken from the source.
    pub cursor: u64,
    pub phase: ReplayPhase,
}

impl ReplayState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub rows_read: u64,
    pub rows_admitted: u64,
    pub rows_skipped_past: u64,
    pub rows_skipped_future: u64,
    pub rows_malformed: u64,
    pub enrichment_sent: bool,
    pub telemetry_published: u64,
    pub cancelled: bool,
}

enum WaitOutcome {
    Elapsed,
    Cancelled,
}

enum RowOutcome {
    Continue,
    Cancelled,
}

/// Admission bookkeeping for one pass over a repeating source. A pass ends when the source
/// hands out a line number that is not past the previous one.
#[derive(Debug, Default)]
struct PassTracker {
    last_line: u64,
    admitted: bool,
    /// Soonest window opening seen in the pass, as (distance from now, time of day).
    next_window: Option<(Duration, u32)>,
}

impl PassTracker {
    /// Returns the soonest window opening of the previous pass when `line` starts a new pass
    /// and the previous one admitted nothing.
    fn advance(&mut self, line: u64) -> Option<u32> {
        let rewound = line <= self.last_line;
        self.last_line = line;
        if !rewound {
            return None;
        }
        let idle = if self.admitted { None } else { self.next_window };
        self.admitted = false;
        self.next_window = None;
        idle.map(|(_, opens)| opens)
    }

    fn skipped(&mut self, opens: u32, distance: Duration) {
        if self
            .next_window
            .map_or(true, |(soonest, _)| distance < soonest)
        {
            self.next_window = Some((distance, opens));
        }
    }
}

pub struct ReplayScheduler<C> {
    config: Arc<ReplayConfig>,
    catalog: Arc<ColumnCatalog>,
    synchronizer: TimeSynchronizer,
    resolver: IdentityResolver,
    assembler: MessageAssembler,
    clock: C,
    plan: Option<ColumnPlan>,
    pass: PassTracker,
    state: ReplayState,
}

impl<C: ReplayClock> ReplayScheduler<C> {
    pub fn new(config: Arc<ReplayConfig>, catalog: Arc<ColumnCatalog>, clock: C) -> Self {
        let synchronizer = TimeSynchronizer::new(&config.csv, &config.replay);
        let resolver =
            IdentityResolver::new(config.mqtt.identity_salt(), config.thing_model.clone());
        let assembler = MessageAssembler::new(config.replay.non_numeric);

        Self {
            config,
            catalog,
            synchronizer,
            resolver,
            assembler,
            clock,
            plan: None,
            pass: PassTracker::default(),
            state: ReplayState::default(),
        }
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    /// Forgets the enrichment flag and cursor so the scheduler can start another run.
    pub fn reset(&mut self) {
        self.state.reset();
        self.plan = None;
        self.pass = PassTracker::default();
    }

    /// Streams `source` to `publisher` until it is exhausted, `shutdown` fires, or a fatal
    /// timestamp or transport error occurs. The publisher is closed in every case.
    pub async fn run<S, P>(
        &mut self,
        source: &mut S,
        publisher: &P,
        shutdown: &CancellationToken,
    ) -> Result<ReplayReport>
    where
        S: RowSource + ?Sized,
        P: Publisher + ?Sized,
    {
        let mut report = ReplayReport::default();
        let outcome = self.stream(source, publisher, shutdown, &mut report).await;

        self.state.phase = ReplayPhase::Draining;
        if let Err(err) = publisher.close().await {
            replay_event!(warn, "publisher_close_failed", error = err);
        }
        self.state.phase = ReplayPhase::Done;
        report.enrichment_sent = self.state.enrichment_sent;

        match outcome {
            Ok(RowOutcome::Cancelled) => {
                report.cancelled = true;
                replay_event!(
                    info,
                    "replay_cancelled",
                    cursor = self.state.cursor,
                    telemetry_published = report.telemetry_published
                );
                Ok(report)
            }
            Ok(RowOutcome::Continue) => {
                replay_event!(
                    info,
                    "replay_finished",
                    rows_read = report.rows_read,
                    rows_admitted = report.rows_admitted,
                    rows_skipped_past = report.rows_skipped_past,
                    rows_skipped_future = report.rows_skipped_future,
                    rows_malformed = report.rows_malformed,
                    telemetry_published = report.telemetry_published
                );
                Ok(report)
            }
            Err(err) => {
                replay_event!(error, "replay_aborted", cursor = self.state.cursor, error = err);
                Err(err)
            }
        }
    }

    async fn stream<S, P>(
        &mut self,
        source: &mut S,
        publisher: &P,
        shutdown: &CancellationToken,
        report: &mut ReplayReport,
    ) -> Result<RowOutcome>
    where
        S: RowSource + ?Sized,
        P: Publisher + ?Sized,
    {
        self.state.phase = ReplayPhase::Idle;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(RowOutcome::Cancelled),
            ready = publisher.ready() => ready.context("broker connection failed")?,
        }
        replay_event!(info, "broker_ready", realtime = self.config.replay.realtime);

        self.state.phase = ReplayPhase::Streaming;
        loop {
            if shutdown.is_cancelled() {
                return Ok(RowOutcome::Cancelled);
            }

            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(RowOutcome::Cancelled),
                item = source.next_row() => item,
            };
            let Some(item) = item else {
                return Ok(RowOutcome::Continue);
            };
            report.rows_read += 1;

            if self.config.replay.repeat {
                let line = match &item {
                    Ok(row) => row.line(),
                    Err(err) => err.line,
                };
                if let WaitOutcome::Cancelled =
                    self.idle_between_passes(line, publisher, shutdown).await?
                {
                    return Ok(RowOutcome::Cancelled);
                }
            }

            let row = match item {
                Ok(row) => row,
                Err(err) => {
                    report.rows_malformed += 1;
                    replay_event!(warn, "row_malformed", record = err.line, error = err.reason);
                    continue;
                }
            };
            self.state.cursor = row.line();

            if let RowOutcome::Cancelled =
                self.handle_row(&row, publisher, shutdown, report).await?
            {
                return Ok(RowOutcome::Cancelled);
            }
        }
    }

    /// Suspends a repeating replay whose last pass admitted nothing until the soonest
    /// skipped record comes back into the wait window.
    async fn idle_between_passes<P>(
        &mut self,
        line: u64,
        publisher: &P,
        shutdown: &CancellationToken,
    ) -> Result<WaitOutcome>
    where
        P: Publisher + ?Sized,
    {
        let Some(opens) = self.pass.advance(line) else {
            return Ok(WaitOutcome::Elapsed);
        };
        let delay = until_time_of_day(opens, self.clock.now().time());
        replay_event!(info, "pass_idle", record = line, sleep_ms = delay.as_millis());
        wait(delay, publisher, shutdown).await
    }

    async fn handle_row<P>(
        &mut self,
        row: &Row,
        publisher: &P,
        shutdown: &CancellationToken,
        report: &mut ReplayReport,
    ) -> Result<RowOutcome>
    where
        P: Publisher + ?Sized,
    {
        let line = row.line();
        let timestamp = if self.config.replay.realtime {
            let now = self.clock.now();
            let decision = match self.synchronizer.wall_time(row, now.date()) {
                Ok(record) => {
                    let decision = self.synchronizer.decide(record.time(), now.time());
                    if matches!(
                        decision,
                        ScheduleDecision::SkipPast | ScheduleDecision::SkipTooFarFuture
                    ) {
                        let opens = self.synchronizer.window_opens(time_of_day(record.time()));
                        self.pass.skipped(opens, until_time_of_day(opens, now.time()));
                    }
                    decision
                }
                Err(err) => ScheduleDecision::Abort(err),
            };

            match decision {
                ScheduleDecision::Wait(delay) => {
                    replay_event!(
                        debug,
                        "row_waiting",
                        record = line,
                        wait_ms = delay.as_millis()
                    );
                    if let WaitOutcome::Cancelled = wait(delay, publisher, shutdown).await? {
                        return Ok(RowOutcome::Cancelled);
                    }
                    None
                }
                ScheduleDecision::SkipPast => {
                    report.rows_skipped_past += 1;
                    replay_event!(debug, "row_skipped_past", record = line);
                    return Ok(RowOutcome::Continue);
                }
                ScheduleDecision::SkipTooFarFuture => {
                    report.rows_skipped_future += 1;
                    replay_event!(debug, "row_skipped_future", record = line);
                    return Ok(RowOutcome::Continue);
                }
                ScheduleDecision::Abort(err) => {
                    return Err(Error::from(err))
                        .with_context(|| format!("row {line} has no usable timestamp"));
                }
            }
        } else {
            let today = self.clock.now().date();
            let record = self
                .synchronizer
                .record_time(row, today)
                .map_err(Error::from)
                .with_context(|| format!("row {line} has no usable timestamp"))?;
            Some(record.epoch_ms)
        };

        self.pass.admitted = true;
        report.rows_admitted += 1;
        self.emit(row, timestamp, publisher, report).await?;
        Ok(RowOutcome::Continue)
    }

    async fn emit<P>(
        &mut self,
        row: &Row,
        timestamp: Option<i64>,
        publisher: &P,
        report: &mut ReplayReport,
    ) -> Result<()>
    where
        P: Publisher + ?Sized,
    {
        if !self.plan.as_ref().is_some_and(|plan| plan.matches(row)) {
            self.plan = None;
        }
        let plan = self.plan.get_or_insert_with(|| {
            ColumnPlan::build(row, &self.config.csv, &self.resolver, &self.catalog)
        });

        if !self.state.enrichment_sent {
            let connects = self.assembler.connect(plan);
            for connect in &connects {
                publish_instrumented(publisher, CONNECT_TOPIC, connect).await?;
            }
            let attributes = self.assembler.attributes(plan);
            publish_instrumented(publisher, ATTRIBUTES_TOPIC, &attributes).await?;

            self.state.enrichment_sent = true;
            replay_event!(
                info,
                "enrichment_published",
                record = row.line(),
                devices = connects.len()
            );
        }

        match self.assembler.telemetry(row, plan, timestamp) {
            Some(payload) => {
                publish_instrumented(publisher, TELEMETRY_TOPIC, &payload).await?;
                report.telemetry_published += 1;
                replay_event!(debug, "telemetry_published", record = row.line());
            }
            None => {
                replay_event!(debug, "telemetry_empty", record = row.line());
            }
        }
        Ok(())
    }
}

/// Single scheduled resumption; a transport failure during the wait ends the run.
async fn wait<P>(
    delay: Duration,
    publisher: &P,
    shutdown: &CancellationToken,
) -> Result<WaitOutcome>
where
    P: Publisher + ?Sized,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(WaitOutcome::Cancelled),
        err = publisher.failed() => {
            Err(Error::from(err)).context("broker connection lost while waiting")
        }
        _ = tokio::time::sleep(delay) => Ok(WaitOutcome::Elapsed),
    }
}
