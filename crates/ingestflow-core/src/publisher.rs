// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job publication.
//!
//! The engine never talks to a message bus directly. Jobs go through the
//! outbox and are handed to a [`Publisher`] after commit. Delivery is
//! at-least-once; workers tolerate duplicates.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::EngineError;
use crate::model::{SceneRef, TileJob};

/// Logical channel a job is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Topic {
    /// Download jobs, one per scene.
    #[serde(rename = "scene-jobs")]
    SceneJobs,
    /// Processing jobs, one per tile.
    #[serde(rename = "tile-jobs")]
    TileJobs,
}

impl Topic {
    /// Wire and storage name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SceneJobs => "scene-jobs",
            Topic::TileJobs => "tile-jobs",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scene-jobs" => Ok(Topic::SceneJobs),
            "tile-jobs" => Ok(Topic::TileJobs),
            other => Err(EngineError::ValidationError {
                field: "topic".to_string(),
                message: format!("unknown topic '{}'", other),
            }),
        }
    }
}

/// At-least-once message sink.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a batch of serialized jobs on one topic.
    ///
    /// An error means the batch may have been partially delivered; the
    /// caller publishes the whole batch again.
    async fn publish(&self, topic: Topic, payloads: &[Vec<u8>]) -> Result<(), EngineError>;
}

// ============================================================================
// In-memory publisher
// ============================================================================

/// Publisher that keeps every message in memory.
///
/// Used by tests and embedders that poll jobs themselves. It can be told to
/// fail in order to exercise the outbox redelivery path.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(Topic, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publish calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw payloads published on a topic, in publication order.
    pub fn published(&self, topic: Topic) -> Vec<Vec<u8>> {
        self.lock()
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Decoded scene jobs.
    pub fn scene_jobs(&self) -> Result<Vec<SceneRef>, EngineError> {
        self.published(Topic::SceneJobs)
            .iter()
            .map(|p| serde_json::from_slice(p).map_err(EngineError::from))
            .collect()
    }

    /// Decoded tile jobs.
    pub fn tile_jobs(&self) -> Result<Vec<TileJob>, EngineError> {
        self.published(Topic::TileJobs)
            .iter()
            .map(|p| serde_json::from_slice(p).map_err(EngineError::from))
            .collect()
    }

    /// Number of messages published on all topics.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was published.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every recorded message.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Topic, Vec<u8>)>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: Topic, payloads: &[Vec<u8>]) -> Result<(), EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::PublishError {
                operation: topic.to_string(),
                details: "publisher is set to fail".to_string(),
            });
        }
        self.lock().extend(payloads.iter().map(|p| (topic, p.clone())));
        Ok(())
    }
}

// ============================================================================
// JSON lines publisher
// ============================================================================

#[derive(Serialize)]
struct Envelope {
    topic: Topic,
    payload: serde_json::Value,
}

/// Publisher writing one `{"topic": ..., "payload": ...}` object per line.
pub struct JsonLinesPublisher<W> {
    out: tokio::sync::Mutex<W>,
}

impl<W> JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a writer (stdout, a file, a socket).
    pub fn new(out: W) -> Self {
        Self {
            out: tokio::sync::Mutex::new(out),
        }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> Publisher for JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, topic: Topic, payloads: &[Vec<u8>]) -> Result<(), EngineError> {
        let publish_err = |details: String| EngineError::PublishError {
            operation: topic.to_string(),
            details,
        };

        let mut buf = Vec::new();
        for payload in payloads {
            let payload = serde_json::from_slice(payload)
                .map_err(|e| publish_err(format!("payload is not JSON: {}", e)))?;
            serde_json::to_writer(&mut buf, &Envelope { topic, payload })
                .map_err(|e| publish_err(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut out = self.out.lock().await;
        out.write_all(&buf)
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        out.flush().await.map_err(|e| publish_err(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::SceneJobs.as_str(), "scene-jobs");
        assert_eq!("tile-jobs".parse::<Topic>().unwrap(), Topic::TileJobs);
        assert!("jobs".parse::<Topic>().is_err());
    }

    #[tokio::test]
    async fn test_recording_publisher_records_and_fails() {
        let publisher = RecordingPublisher::new();
        publisher
            .publish(Topic::TileJobs, &[b"{}".to_vec(), b"[]".to_vec()])
            .await
            .unwrap();
        assert_eq!(publisher.len(), 2);
        assert!(publisher.published(Topic::SceneJobs).is_empty());

        publisher.set_failing(true);
        let err = publisher
            .publish(Topic::SceneJobs, &[b"{}".to_vec()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PUBLISH_ERROR");
        assert_eq!(publisher.len(), 2);
    }

    #[tokio::test]
    async fn test_json_lines_publisher_writes_envelopes() {
        let publisher = JsonLinesPublisher::new(Vec::new());
        publisher
            .publish(
                Topic::SceneJobs,
                &[br#"{"id":1}"#.to_vec(), br#"{"id":2}"#.to_vec()],
            )
            .await
            .unwrap();

        let out = String::from_utf8(publisher.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"topic":"scene-jobs","payload":{"id":1}}"#);
        assert_eq!(lines[1], r#"{"topic":"scene-jobs","payload":{"id":2}}"#);
    }

    #[tokio::test]
    async fn test_json_lines_publisher_rejects_non_json() {
        let publisher = JsonLinesPublisher::new(Vec::new());
        let err = publisher
            .publish(Topic::TileJobs, &[b"not json".to_vec()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PUBLISH_ERROR");
        assert!(publisher.into_inner().is_empty());
    }
}
