// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingestflow Core - Satellite Ingestion Workflow Engine
//!
//! Reads worker results as JSON lines on stdin and writes the jobs that
//! become runnable as JSON lines on stdout. Logs go to stderr.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingestflow_core::config::Config;
use ingestflow_core::{
    JsonLinesPublisher, ResultConsumer, SqliteStore, WorkerResult, WorkflowEngine,
};

/// Results buffered between the stdin reader and the consumer
const RESULT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing; stdout carries the published jobs
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ingestflow_core=info".parse()?),
        )
        .init();

    info!("Starting Ingestflow Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        max_connections = config.max_connections,
        outbox_batch_size = config.outbox_batch_size,
        max_redeliveries = config.max_redeliveries,
        "Configuration loaded"
    );

    // Connect to database (runs migrations)
    info!("Connecting to database...");
    let store = Arc::new(SqliteStore::connect(&config.database_url, config.max_connections).await?);
    info!("Database ready");

    let publisher = Arc::new(JsonLinesPublisher::new(tokio::io::stdout()));
    let engine = Arc::new(
        WorkflowEngine::new(store.clone(), publisher)
            .with_outbox_batch_size(config.outbox_batch_size),
    );

    // Publish whatever a previous run committed but did not publish
    match engine.flush_outbox().await {
        Ok(0) => {}
        Ok(published) => info!(published, "Relayed jobs left by a previous run"),
        Err(e) => warn!(error = %e, "Failed to relay outbox at startup"),
    }

    let shutdown = CancellationToken::new();
    let (results_tx, results_rx) = mpsc::channel::<WorkerResult>(RESULT_CHANNEL_CAPACITY);

    // Read worker results from stdin
    let reader_shutdown = shutdown.clone();
    let reader_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = reader_shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<WorkerResult>(&line) {
                    Ok(result) => {
                        if results_tx.send(result).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %line, "Ignoring malformed worker result"),
                },
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read worker results");
                    break;
                }
            }
        }
    });

    let consumer = ResultConsumer::new(engine, config.consumer_config());
    let consumer_handle = tokio::spawn(consumer.run(results_rx, shutdown.clone()));

    info!("Ingestflow Core initialized successfully");

    // Wait for shutdown signal or for the input to drain
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            ctrl_c_shutdown.cancel();
        }
    });

    if let Err(e) = consumer_handle.await {
        error!("Result consumer task failed: {}", e);
    }
    shutdown.cancel();
    reader_handle.abort();

    store.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
