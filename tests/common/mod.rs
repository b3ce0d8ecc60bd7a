// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - `MockRemote`: in-memory authoritative server with failure injection
//! - `RecordingDiagnostics`: diagnostics sink that keeps every event
//! - Manager and payload helpers

#![allow(dead_code)]

pub mod mock_remote;

pub use mock_remote::*;

use parking_lot::Mutex;
use replica_engine::{
    Collaborators, DiagnosticEvent, DiagnosticsSink, Payload, ReplicationConfig, ReplicationManager, TableRegistration,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const TENANT: &str = "club-1";

/// Route engine logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Diagnostics sink that records every event for assertions.
#[derive(Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingDiagnostics {
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    pub fn count<F>(&self, f: F) -> usize
    where
        F: Fn(&DiagnosticEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| f(e)).count()
    }

    pub fn for_table(&self, table: &str) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.table() == Some(table))
            .cloned()
            .collect()
    }
}

impl DiagnosticsSink for RecordingDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        self.events.lock().push(event);
    }
}

/// Build a JSON-object payload from a `json!` literal.
pub fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

/// Test config with the background tasks slowed down so tests drive syncs
/// explicitly.
pub fn config(dir: &Path) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(TENANT, dir);
    config.settings.sync.auto_sync_interval = "1h".into();
    config.settings.eviction.interval = "1h".into();
    config.settings.backup.interval = "1h".into();
    config
}

pub struct Harness {
    pub manager: ReplicationManager<MockRemote>,
    pub remote: Arc<MockRemote>,
    pub diagnostics: Arc<RecordingDiagnostics>,
}

impl Harness {
    pub async fn open(config: ReplicationConfig) -> Self {
        Self::open_with(config, Arc::new(MockRemote::new(TENANT))).await
    }

    pub async fn open_with(config: ReplicationConfig, remote: Arc<MockRemote>) -> Self {
        init_tracing();
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let collaborators = Collaborators::default().with_diagnostics(diagnostics.clone());
        let manager = ReplicationManager::open(config, Arc::clone(&remote), collaborators)
            .await
            .unwrap();
        Self {
            manager,
            remote,
            diagnostics,
        }
    }

    /// Open, register `tables` and pass the barrier.
    pub async fn active(dir: &Path, tables: &[&str]) -> Self {
        let mut config = config(dir);
        config.tables = tables.iter().map(|t| TableRegistration::new(*t)).collect();
        let harness = Self::open(config).await;
        harness.manager.init().await.unwrap();
        harness
    }
}

/// Poll `f` until it returns true or `limit` passes.
pub async fn eventually<F>(limit: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    f()
}
