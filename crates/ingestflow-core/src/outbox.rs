// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job outbox relay.
//!
//! Units of work write jobs to the `job_outbox` table. Once the transaction
//! has committed, [`flush`] hands them to the publisher in id order and
//! deletes the published rows. A job whose transaction rolled back is never
//! seen here.

use tracing::debug;

use crate::error::EngineError;
use crate::persistence::{OutboxJob, StateStore};
use crate::publisher::Publisher;

/// Publish every pending outbox job.
///
/// Consecutive jobs on the same topic are published as one batch. Each batch
/// is acknowledged right after it is published, so a failure only leaves the
/// failed batch and the ones after it in the outbox. Returns the number of
/// jobs published.
pub async fn flush(
    store: &dyn StateStore,
    publisher: &dyn Publisher,
    batch_size: i64,
) -> Result<usize, EngineError> {
    let batch_size = batch_size.max(1);
    let mut published = 0;

    loop {
        let jobs = store.pending_jobs(batch_size).await?;
        if jobs.is_empty() {
            break;
        }
        let fetched = jobs.len();

        for run in topic_runs(jobs) {
            let topic = run[0].topic;
            let ids: Vec<i64> = run.iter().map(|j| j.id).collect();
            let payloads: Vec<Vec<u8>> = run.into_iter().map(|j| j.payload).collect();

            publisher.publish(topic, &payloads).await?;
            store.ack_jobs(&ids).await?;

            debug!(topic = %topic, count = ids.len(), "Published outbox jobs");
            published += ids.len();
        }

        if (fetched as i64) < batch_size {
            break;
        }
    }

    Ok(published)
}

/// Split jobs into runs of consecutive jobs sharing a topic.
fn topic_runs(jobs: Vec<OutboxJob>) -> Vec<Vec<OutboxJob>> {
    let mut runs: Vec<Vec<OutboxJob>> = Vec::new();
    for job in jobs {
        match runs.last_mut() {
            Some(run) if run[0].topic == job.topic => run.push(job),
            _ => runs.push(vec![job]),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Topic;

    fn job(id: i64, topic: Topic) -> OutboxJob {
        OutboxJob {
            id,
            topic,
            payload: format!("{{\"id\":{}}}", id).into_bytes(),
        }
    }

    #[test]
    fn test_topic_runs_keep_order() {
        let runs = topic_runs(vec![
            job(1, Topic::SceneJobs),
            job(2, Topic::TileJobs),
            job(3, Topic::TileJobs),
            job(4, Topic::SceneJobs),
        ]);
        let ids: Vec<Vec<i64>> = runs
            .iter()
            .map(|r| r.iter().map(|j| j.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_topic_runs_empty() {
        assert!(topic_runs(Vec::new()).is_empty());
    }
}
