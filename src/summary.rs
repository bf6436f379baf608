use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{Evaluation, EvaluationStatus, ScoreDirection};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub errored: usize,
}

impl StatusCounts {
    fn add(&mut self, status: EvaluationStatus) {
        self.total += 1;
        match status {
            EvaluationStatus::Pending => self.pending += 1,
            EvaluationStatus::Running => self.running += 1,
            EvaluationStatus::Complete => self.complete += 1,
            EvaluationStatus::Errored => self.errored += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary<K> {
    pub key: K,
    pub counts: StatusCounts,
    pub best: Option<Evaluation>,
}

/// Counts and best record over every evaluation of a run.
pub fn summarize(evaluations: &[Evaluation], direction: ScoreDirection) -> GroupSummary<()> {
    let mut summary = GroupSummary {
        key: (),
        counts: StatusCounts::default(),
        best: None,
    };
    for evaluation in evaluations {
        fold_into(&mut summary, evaluation, direction);
    }
    summary
}

pub fn summarize_by_method(
    evaluations: &[Evaluation],
    direction: ScoreDirection,
) -> Vec<GroupSummary<String>> {
    summarize_by(evaluations, direction, |evaluation| evaluation.method.clone())
}

pub fn summarize_by_partition(
    evaluations: &[Evaluation],
    direction: ScoreDirection,
) -> Vec<GroupSummary<i64>> {
    summarize_by(evaluations, direction, |evaluation| evaluation.partition_id)
}

/// Groups are returned in key order.
pub fn summarize_by<K, F>(
    evaluations: &[Evaluation],
    direction: ScoreDirection,
    key_of: F,
) -> Vec<GroupSummary<K>>
where
    K: Ord + Clone,
    F: Fn(&Evaluation) -> K,
{
    let mut groups: BTreeMap<K, GroupSummary<K>> = BTreeMap::new();

    for evaluation in evaluations {
        let key = key_of(evaluation);
        let summary = groups.entry(key.clone()).or_insert_with(|| GroupSummary {
            key,
            counts: StatusCounts::default(),
            best: None,
        });
        fold_into(summary, evaluation, direction);
    }

    groups.into_values().collect()
}

fn fold_into<K>(summary: &mut GroupSummary<K>, evaluation: &Evaluation, direction: ScoreDirection) {
    summary.counts.add(evaluation.status);

    let Some(metric) = evaluation.scored_metric() else {
        return;
    };
    // Strict improvement keeps the first record on ties.
    let replace = match summary.best.as_ref().and_then(Evaluation::scored_metric) {
        Some(best) => direction.improves(metric, best),
        None => true,
    };
    if replace {
        summary.best = Some(evaluation.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluation(
        id: i64,
        method: &str,
        partition_id: i64,
        status: EvaluationStatus,
        metric: Option<f64>,
    ) -> Evaluation {
        Evaluation {
            id,
            datarun_id: 1,
            partition_id,
            method: method.to_string(),
            job_id: id,
            params: serde_json::json!({}),
            metric,
            metric_stdev: metric.map(|_| 0.02),
            status,
            error_message: None,
            worker_id: None,
            created_at: String::new(),
            completed_at: None,
        }
    }

    fn sample() -> Vec<Evaluation> {
        use EvaluationStatus::*;
        vec![
            evaluation(1, "svm", 1, Complete, Some(0.7)),
            evaluation(2, "svm", 2, Errored, None),
            evaluation(3, "knn", 3, Complete, Some(0.9)),
            evaluation(4, "svm", 1, Complete, Some(0.8)),
            evaluation(5, "knn", 3, Running, None),
            evaluation(6, "knn", 4, Complete, Some(0.9)),
            evaluation(7, "svm", 2, Pending, None),
        ]
    }

    #[test]
    fn method_groups_count_every_record() {
        let groups = summarize_by_method(&sample(), ScoreDirection::Maximize);
        let keys: Vec<&str> = groups.iter().map(|group| group.key.as_str()).collect();
        assert_eq!(keys, vec!["knn", "svm"]);

        for group in &groups {
            let counts = &group.counts;
            assert_eq!(
                counts.pending + counts.running + counts.complete + counts.errored,
                counts.total
            );
        }
        assert_eq!(groups.iter().map(|group| group.counts.total).sum::<usize>(), 7);

        let svm = &groups[1];
        assert_eq!(svm.counts.errored, 1);
        assert_eq!(svm.counts.complete, 2);
        assert_eq!(svm.best.as_ref().map(|best| best.id), Some(4));
    }

    #[test]
    fn ties_keep_first_encountered_record() {
        let groups = summarize_by_method(&sample(), ScoreDirection::Maximize);
        let knn = &groups[0];
        assert_eq!(knn.best.as_ref().map(|best| best.id), Some(3));
    }

    #[test]
    fn partition_groups_follow_direction() {
        let groups = summarize_by_partition(&sample(), ScoreDirection::Minimize);
        let keys: Vec<i64> = groups.iter().map(|group| group.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);

        assert_eq!(groups[0].best.as_ref().map(|best| best.id), Some(1));
        assert!(groups[1].best.is_none());
        assert_eq!(groups[1].counts.total, 2);
    }

    #[test]
    fn run_summary_totals_and_best() {
        let summary = summarize(&sample(), ScoreDirection::Maximize);
        assert_eq!(
            summary.counts,
            StatusCounts {
                total: 7,
                pending: 1,
                running: 1,
                complete: 4,
                errored: 1,
            }
        );
        assert_eq!(summary.best.map(|best| best.id), Some(3));
    }

    #[test]
    fn empty_input_has_no_groups() {
        assert!(summarize_by_method(&[], ScoreDirection::Maximize).is_empty());
        let summary = summarize(&[], ScoreDirection::Maximize);
        assert_eq!(summary.counts.total, 0);
        assert!(summary.best.is_none());
    }
}
