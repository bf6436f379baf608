use std::collections::BTreeSet;

use anyhow::Result;

use crate::model::{
    ClaimedJob, Evaluation, EvaluationOutcome, EvaluationStatus, Run, RunId, SelectionPolicy,
};

mod schema;
mod sqlite;

pub use sqlite::{JobCounts, SqliteStore};

pub trait JobStore {
    /// Atomically claim one eligible pending job. Two callers never receive
    /// the same job. `None` means the backlog has nothing eligible left.
    fn claim_next(
        &mut self,
        restriction: Option<&BTreeSet<RunId>>,
        policy: SelectionPolicy,
        worker_id: &str,
    ) -> Result<Option<ClaimedJob>>;

    fn record_result(&mut self, job: &ClaimedJob, outcome: &EvaluationOutcome) -> Result<()>;

    /// Evaluations of one run ordered by creation time ascending.
    fn list_evaluations(
        &self,
        datarun_id: RunId,
        status: Option<EvaluationStatus>,
    ) -> Result<Vec<Evaluation>>;

    fn get_run(&self, datarun_id: RunId) -> Result<Run>;
}
