//! One ingestion run: fetch, normalize, upsert
//!
//! Stages are strictly sequential. Every error is folded into the run's
//! [`RunOutcome`]; `execute` itself never fails.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::fetcher::PayloadSource;
use crate::models::{IngestionRun, RunOutcome, RunReport, RunStage};
use crate::normalizer::Normalizer;
use crate::upserter::{UpsertSummary, Upserter};

pub struct IngestPipeline {
    source: Arc<dyn PayloadSource>,
    normalizer: Normalizer,
    upserter: Upserter,
}

impl IngestPipeline {
    pub fn new(source: Arc<dyn PayloadSource>, normalizer: Normalizer, upserter: Upserter) -> Self {
        Self {
            source,
            normalizer,
            upserter,
        }
    }

    pub fn upserter(&self) -> &Upserter {
        &self.upserter
    }

    /// Execute `run` to completion or cancellation
    pub async fn execute(
        &self,
        mut run: IngestionRun,
        cancel: CancellationToken,
    ) -> (IngestionRun, RunReport) {
        let mut report = RunReport::default();

        info!(
            run_id = %run.run_id,
            trigger = run.trigger.as_str(),
            attempt = run.attempt,
            source = %self.source.describe(),
            "Starting ingestion run"
        );

        run.stage = RunStage::Fetching;
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.source.fetch() => Some(result),
        };

        let payload = match fetched {
            None => return finish(run, report, RunOutcome::Cancelled),
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                error!(run_id = %run.run_id, error = %e, "Fetch failed");
                return finish(run, report, RunOutcome::failure(e));
            },
        };

        info!(run_id = %run.run_id, bytes = payload.len(), "Fetched upstream payload");

        run.stage = RunStage::Normalizing;
        let batch = match self.normalizer.normalize(&payload, run.started_at) {
            Ok(batch) => batch,
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Payload could not be parsed");
                return finish(run, report, RunOutcome::failure(e));
            },
        };
        drop(payload);

        report.records_total = batch.total();
        report.rejected = batch.rejected.len();

        if !batch.rejected.is_empty() {
            warn!(
                run_id = %run.run_id,
                rejected = batch.rejected.len(),
                total = batch.total(),
                "Some upstream entries were rejected"
            );
        }

        if cancel.is_cancelled() {
            report.skipped = batch.records.len();
            report.records_failed = report.rejected + report.skipped;
            return finish(run, report, RunOutcome::Cancelled);
        }

        run.stage = RunStage::Upserting;
        let summary = self.upserter.upsert_batch(batch.records, &cancel).await;

        report.inserted = summary.inserted;
        report.replaced = summary.replaced;
        report.storage_failed = summary.failed;
        report.skipped = summary.skipped;
        report.records_failed = report.rejected + report.storage_failed + report.skipped;

        let outcome = if summary.cancelled {
            RunOutcome::Cancelled
        } else {
            aggregate(&report, &summary)
        };

        if report.records_total == 0 {
            warn!(run_id = %run.run_id, "Upstream snapshot contained no entries");
        }

        finish(run, report, outcome)
    }
}

fn aggregate(report: &RunReport, summary: &UpsertSummary) -> RunOutcome {
    let total = report.records_total;
    let failed = report.records_failed;

    if failed == 0 {
        return RunOutcome::Success;
    }
    if failed < total {
        return RunOutcome::Partial { failed, total };
    }

    let reason = if summary.short_circuited {
        format!(
            "store unavailable, batch short-circuited after {} failures",
            summary.failed
        )
    } else if let Some(e) = &summary.last_error {
        format!("all {} records failed, last error: {}", total, e)
    } else {
        format!("all {} entries were rejected", total)
    };
    RunOutcome::failure(reason)
}

fn finish(
    mut run: IngestionRun,
    report: RunReport,
    outcome: RunOutcome,
) -> (IngestionRun, RunReport) {
    run.stage = RunStage::Finished;

    info!(
        run_id = %run.run_id,
        attempt = run.attempt,
        outcome = outcome.as_str(),
        records_total = report.records_total,
        records_failed = report.records_failed,
        inserted = report.inserted,
        replaced = report.replaced,
        rejected = report.rejected,
        skipped = report.skipped,
        "Ingestion run finished: {}",
        outcome
    );

    run.outcome = Some(outcome);
    (run, report)
}
