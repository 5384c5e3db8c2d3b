// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Usage Recorder (C12, spec §4.12): append-only, batched into a backing
//! store. Grounded on the upstream's `UsageTracker`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub api_key_id: i64,
    pub account_id: i64,
    pub model: String,
    pub endpoint: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub status_code: u16,
    pub request_duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Estimated upstream cost in USD (C18's `calculate_cost`), `None` when
    /// the model didn't match a known pricing family.
    pub estimated_cost_usd: Option<f64>,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsageAggregate {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub success_count: u64,
    pub fail_count: u64,
}

/// Persistence seam (C17) for usage records: a real backend only ever sees
/// batches, never one-at-a-time inserts.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn insert_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()>;
    async fn aggregate(&self, api_key_id: Option<i64>) -> anyhow::Result<UsageAggregate>;
    async fn recent(&self, api_key_id: Option<i64>, limit: usize) -> anyhow::Result<Vec<UsageRecord>>;
}

#[derive(Default)]
pub struct InMemoryUsageStore {
    records: Mutex<Vec<UsageRecord>>,
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn insert_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }

    async fn aggregate(&self, api_key_id: Option<i64>) -> anyhow::Result<UsageAggregate> {
        let records = self.records.lock().await;
        let mut agg = UsageAggregate::default();
        for r in records.iter().filter(|r| api_key_id.map(|id| id == r.api_key_id).unwrap_or(true)) {
            agg.total_requests += 1;
            agg.total_input_tokens += r.input_tokens;
            agg.total_output_tokens += r.output_tokens;
            agg.total_tokens += r.total_tokens();
            if (200..300).contains(&r.status_code) {
                agg.success_count += 1;
            } else if r.status_code >= 400 {
                agg.fail_count += 1;
            }
        }
        Ok(agg)
    }

    async fn recent(&self, api_key_id: Option<i64>, limit: usize) -> anyhow::Result<Vec<UsageRecord>> {
        let records = self.records.lock().await;
        let mut matching: Vec<UsageRecord> =
            records.iter().filter(|r| api_key_id.map(|id| id == r.api_key_id).unwrap_or(true)).cloned().collect();
        matching.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }
}

/// Accumulates records in memory under a lock and flushes to the backing
/// store either once `batch_size` is reached or on an explicit `flush()`
/// (stream end, shutdown). A failed flush puts the batch back in the
/// pending queue for the next attempt rather than dropping it.
pub struct UsageRecorder<S: UsageStore> {
    store: S,
    batch_size: usize,
    pending: Mutex<Vec<UsageRecord>>,
}

impl<S: UsageStore> UsageRecorder<S> {
    pub fn new(store: S, batch_size: usize) -> Self {
        Self { store, batch_size, pending: Mutex::new(Vec::new()) }
    }

    pub async fn record(&self, record: UsageRecord) {
        let mut pending = self.pending.lock().await;
        pending.push(record);
        if pending.len() >= self.batch_size {
            self.flush_locked(&mut pending).await;
        }
    }

    pub async fn flush(&self) {
        let mut pending = self.pending.lock().await;
        self.flush_locked(&mut pending).await;
    }

    async fn flush_locked(&self, pending: &mut Vec<UsageRecord>) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        if let Err(err) = self.store.insert_batch(&batch).await {
            tracing::error!(%err, count = batch.len(), "failed to flush usage records, re-queueing");
            pending.extend(batch);
        }
    }

    pub async fn aggregate(&self, api_key_id: Option<i64>) -> anyhow::Result<UsageAggregate> {
        self.store.aggregate(api_key_id).await
    }

    pub async fn recent(&self, api_key_id: Option<i64>, limit: usize) -> anyhow::Result<Vec<UsageRecord>> {
        self.store.recent(api_key_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: u16) -> UsageRecord {
        UsageRecord {
            api_key_id: 1,
            account_id: 1,
            model: "claude-sonnet-4-5".into(),
            endpoint: "/v1/chat/completions".into(),
            input_tokens: 100,
            output_tokens: 50,
            status_code: status,
            request_duration_ms: 250,
            timestamp: Utc::now(),
            estimated_cost_usd: None,
        }
    }

    #[tokio::test]
    async fn batch_flushes_automatically_at_threshold() {
        let recorder = UsageRecorder::new(InMemoryUsageStore::default(), 2);
        recorder.record(record(200)).await;
        assert_eq!(recorder.pending.lock().await.len(), 1);
        recorder.record(record(200)).await;
        assert_eq!(recorder.pending.lock().await.len(), 0);
        let agg = recorder.aggregate(None).await.unwrap();
        assert_eq!(agg.total_requests, 2);
    }

    #[tokio::test]
    async fn explicit_flush_drains_partial_batch() {
        let recorder = UsageRecorder::new(InMemoryUsageStore::default(), 100);
        recorder.record(record(200)).await;
        recorder.flush().await;
        let agg = recorder.aggregate(None).await.unwrap();
        assert_eq!(agg.total_requests, 1);
    }

    #[tokio::test]
    async fn aggregate_splits_success_and_failure_counts() {
        let recorder = UsageRecorder::new(InMemoryUsageStore::default(), 100);
        recorder.record(record(200)).await;
        recorder.record(record(500)).await;
        recorder.flush().await;
        let agg = recorder.aggregate(None).await.unwrap();
        assert_eq!(agg.success_count, 1);
        assert_eq!(agg.fail_count, 1);
    }
}
