//! Queue processor — the batched pipeline driver.
//!
//! Two trigger sources, coalesced: an interval timer and an explicit
//! "process now" signal from the host on session idle. One batch is in
//! flight at a time; triggers arriving mid-batch set a run-again bit instead
//! of stacking. Each item round-trips compress → conflict → persist → embed →
//! extract → events, and completes or fails its pending row. AI calls are the
//! only suspension points; all database work is synchronous under the
//! connection lock, which is never held across an await.

use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ai::{
    with_timeout, Capture, ChainedCompressor, Embedder, EntityExtractor, Extraction,
};
use crate::config::{PipelineConfig, RetrievalConfig};
use crate::error::{MemError, Result};
use crate::events::{EventBus, ObservationEvent};
use crate::memory::types::{
    Observation, ObservationDraft, ObservationPatch, ObservationType, PendingMessage,
};
use crate::memory::{graph, pending, sessions, store};
use crate::metrics::Metrics;
use crate::modes::Mode;

/// Conflict evaluator verdict for a new candidate against its neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    CreateNew,
    Supersede(String),
    Drop,
}

/// Compare a candidate to its embedding neighbours: near-duplicates are
/// dropped, close matches supersede the neighbour, everything else creates.
pub fn evaluate_conflict(
    neighbours: &[(Observation, f64)],
    duplicate_threshold: f64,
    supersede_threshold: f64,
) -> ConflictDecision {
    match neighbours.first() {
        Some((obs, similarity)) if *similarity >= duplicate_threshold => {
            tracing::debug!(target_id = %obs.id, similarity, "near-duplicate capture dropped");
            ConflictDecision::Drop
        }
        Some((obs, similarity)) if *similarity >= supersede_threshold => {
            ConflictDecision::Supersede(obs.id.clone())
        }
        _ => ConflictDecision::CreateNew,
    }
}

pub struct QueueProcessor {
    db: Arc<Mutex<Connection>>,
    compressor: Arc<ChainedCompressor>,
    embedder: Option<Arc<dyn Embedder>>,
    extractor: Option<Arc<dyn EntityExtractor>>,
    bus: EventBus,
    metrics: Arc<Metrics>,
    mode: Mode,
    config: PipelineConfig,
    retrieval: RetrievalConfig,
    vector_enabled: bool,
    notify: Arc<tokio::sync::Notify>,
    run_again: AtomicBool,
    running: AtomicBool,
}

impl QueueProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Mutex<Connection>>,
        compressor: Arc<ChainedCompressor>,
        embedder: Option<Arc<dyn Embedder>>,
        extractor: Option<Arc<dyn EntityExtractor>>,
        bus: EventBus,
        metrics: Arc<Metrics>,
        mode: Mode,
        config: PipelineConfig,
        retrieval: RetrievalConfig,
        vector_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            compressor,
            embedder,
            extractor,
            bus,
            metrics,
            mode,
            config,
            retrieval,
            vector_enabled,
            notify: Arc::new(tokio::sync::Notify::new()),
            run_again: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    /// "Process now" signal. Cheap and non-blocking; coalesces with any batch
    /// already in flight.
    pub fn trigger(&self) {
        self.run_again.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Long-running driver: wakes on the interval tick or an explicit
    /// trigger, drains the queue, and exits when `shutdown` flips. The item
    /// in flight finishes before the loop stops.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        {
            let conn = self.lock();
            if let Err(e) = pending::revert_stale(&conn, self.config.stale_claim_secs) {
                tracing::warn!(error = %e, "failed to revert stale claims");
            }
        }

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.process_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => break,
            }
            self.drain(Some(&shutdown)).await;
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("queue processor stopped");
    }

    /// Drain the queue until empty. Re-entrant calls while a drain is running
    /// just set the run-again bit.
    pub async fn drain(&self, shutdown: Option<&tokio::sync::watch::Receiver<bool>>) {
        if self.running.swap(true, Ordering::AcqRel) {
            self.run_again.store(true, Ordering::Release);
            return;
        }

        loop {
            self.run_again.store(false, Ordering::Release);
            let processed = self.process_batch(shutdown).await;
            let interrupted = shutdown.map(|s| *s.borrow()).unwrap_or(false);
            if interrupted || (processed == 0 && !self.run_again.load(Ordering::Acquire)) {
                break;
            }
        }

        self.running.store(false, Ordering::Release);
    }

    /// Claim and process one batch; returns the number of items handled.
    async fn process_batch(
        &self,
        shutdown: Option<&tokio::sync::watch::Receiver<bool>>,
    ) -> usize {
        let batch = {
            let mut conn = self.lock();
            match pending::claim(&mut conn, self.config.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "failed to claim batch");
                    return 0;
                }
            }
        };
        if batch.is_empty() {
            return 0;
        }

        let started = std::time::Instant::now();
        let count = batch.len();

        for item in batch {
            let item_id = item.id;
            match self.process_item(item).await {
                Ok(()) => {
                    let conn = self.lock();
                    if let Err(e) = pending::complete(&conn, item_id) {
                        tracing::error!(item = item_id, error = %e, "failed to complete pending item");
                    }
                }
                Err(e) => {
                    Metrics::incr(&self.metrics.items_failed);
                    let conn = self.lock();
                    match pending::fail(&conn, item_id, &e.to_string(), self.config.max_retries) {
                        Ok(status) => {
                            tracing::warn!(item = item_id, error = %e, ?status, "pending item failed")
                        }
                        Err(fail_err) => {
                            tracing::error!(item = item_id, error = %fail_err, "failed to record item failure")
                        }
                    }
                }
            }
            if shutdown.map(|s| *s.borrow()).unwrap_or(false) {
                break;
            }
        }

        Metrics::incr(&self.metrics.batches_processed);
        self.metrics.record_timing("batch", started.elapsed());
        count
    }

    async fn process_item(&self, item: PendingMessage) -> Result<()> {
        if item.tool_name == pending::SUMMARIZE_TOOL {
            return self.summarize_session(&item.session_id).await;
        }

        let capture = Capture {
            session_id: item.session_id.clone(),
            tool_name: item.tool_name.clone(),
            tool_output: item.tool_output.clone(),
        };

        let started = std::time::Instant::now();
        let draft = self.compressor.compress(&capture, &self.mode).await;
        self.metrics.record_timing("compress", started.elapsed());

        let embedding = self.embed_draft(&draft).await;

        let decision = if self.config.conflict_resolution {
            match &embedding {
                Some(vector) => {
                    let observation_type =
                        draft.observation_type.unwrap_or(ObservationType::Discovery);
                    let conn = self.lock();
                    let neighbours = store::find_similar(
                        &conn,
                        vector,
                        observation_type,
                        self.retrieval.supersede_threshold,
                        5,
                        self.retrieval.similar_recent_n,
                    )?;
                    evaluate_conflict(
                        &neighbours,
                        self.retrieval.duplicate_threshold,
                        self.retrieval.supersede_threshold,
                    )
                }
                None => ConflictDecision::CreateNew,
            }
        } else {
            ConflictDecision::CreateNew
        };

        let (observation, event) = match decision {
            ConflictDecision::Drop => {
                Metrics::incr(&self.metrics.observations_dropped);
                self.bus.emit(ObservationEvent::Dropped {
                    session_id: item.session_id.clone(),
                    reason: "near-duplicate".into(),
                });
                return Ok(());
            }
            ConflictDecision::CreateNew => {
                let mut conn = self.lock();
                let obs = store::create(&mut conn, &item.session_id, &draft)?;
                Metrics::incr(&self.metrics.observations_created);
                let event = ObservationEvent::Created {
                    id: obs.id.clone(),
                    session_id: item.session_id.clone(),
                };
                (obs, event)
            }
            ConflictDecision::Supersede(target_id) => {
                let patch = patch_from_draft(&draft);
                let mut conn = self.lock();
                let obs = store::update(&mut conn, &target_id, &patch)?;
                Metrics::incr(&self.metrics.observations_revised);
                let event = ObservationEvent::Revised {
                    id: obs.id.clone(),
                    revision_of: target_id,
                };
                (obs, event)
            }
        };

        if let Some(vector) = &embedding {
            let mut conn = self.lock();
            store::set_embedding(&conn, &observation.id, vector)?;
            if self.vector_enabled {
                if let Err(e) = store::vec_upsert(&mut conn, &observation.id, vector) {
                    tracing::warn!(id = %observation.id, error = %e, "vector index write failed");
                }
            }
        }

        if self.config.entity_extraction {
            if let Some(extractor) = &self.extractor {
                let timeout = Duration::from_secs(self.config.ai_timeout_secs);
                match with_timeout(timeout, extractor.extract(&observation, &self.mode)).await {
                    Ok(extraction) => {
                        let conn = self.lock();
                        if let Err(e) = persist_extraction(&conn, &observation.id, &extraction) {
                            tracing::warn!(id = %observation.id, error = %e, "entity extraction persist failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(id = %observation.id, error = %e, "entity extraction failed");
                    }
                }
            }
        }

        // The row is durable; only now does the event fan out.
        self.bus.emit(event);
        Ok(())
    }

    async fn summarize_session(&self, session_id: &str) -> Result<()> {
        let (session, observations) = {
            let conn = self.lock();
            let session = sessions::get(&conn, session_id)?
                .ok_or_else(|| MemError::NotFound(format!("session {session_id}")))?;
            let observations = store::list_by_project(
                &conn,
                &session.project_path,
                &store::ListOptions {
                    limit: 200,
                    session_id: Some(session_id.to_string()),
                    ..store::ListOptions::default()
                },
            )?;
            (session, observations)
        };

        let started = std::time::Instant::now();
        let draft = self.compressor.summarize(&session, &observations).await;
        self.metrics.record_timing("summarize", started.elapsed());

        let conn = self.lock();
        sessions::save_summary(&conn, session_id, &draft)?;
        tracing::info!(session = session_id, "session summary written");
        Ok(())
    }

    async fn embed_draft(&self, draft: &ObservationDraft) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let text = format!("{}\n{}", draft.title, draft.narrative);
        let timeout = Duration::from_secs(self.config.ai_timeout_secs);
        match with_timeout(timeout, embedder.embed(&text)).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, item proceeds without a vector");
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn patch_from_draft(draft: &ObservationDraft) -> ObservationPatch {
    ObservationPatch {
        observation_type: draft.observation_type,
        title: Some(draft.title.clone()),
        subtitle: draft.subtitle.clone(),
        narrative: Some(draft.narrative.clone()),
        facts: Some(draft.facts.clone()),
        concepts: Some(draft.concepts.clone()),
        files_read: Some(draft.files_read.clone()),
        files_modified: Some(draft.files_modified.clone()),
        importance: draft.importance,
    }
}

fn persist_extraction(conn: &Connection, observation_id: &str, extraction: &Extraction) -> Result<()> {
    let mut ids: std::collections::HashMap<(String, String), String> =
        std::collections::HashMap::new();

    for entity in &extraction.entities {
        let row = graph::upsert_entity(
            conn,
            &entity.entity_type,
            &entity.name,
            entity.description.as_deref(),
        )?;
        ids.insert(
            (entity.entity_type.clone(), entity.name.to_lowercase()),
            row.id,
        );
    }

    for rel in &extraction.relationships {
        let from = ids.get(&(rel.from.0.clone(), rel.from.1.to_lowercase()));
        let to = ids.get(&(rel.to.0.clone(), rel.to.1.to_lowercase()));
        if let (Some(from), Some(to)) = (from, to) {
            graph::link(conn, from, &rel.relationship_type, to, observation_id)?;
        }
    }
    Ok(())
}
