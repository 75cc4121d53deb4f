//! The engine facade: capture interface inbound from the host and the query
//! surface outbound to the dashboard.
//!
//! Wires the database, redactor, AI capability chain, queue processor, event
//! bus, and metrics into one handle. One engine per project database.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ai::{ChainedCompressor, Compressor, Embedder, EntityExtractor, Reranker};
use crate::config::{canonical_project_root, MemConfig};
use crate::context;
use crate::db::{self, lock::StorageLock, HealthReport};
use crate::error::{MemError, Result};
use crate::events::{EventBus, ObservationEvent};
use crate::memory::search::{self, SearchBackends, SearchRequest, SearchResult};
use crate::memory::store::{self, ListOptions};
use crate::memory::types::{
    Observation, ObservationDraft, ObservationPatch, ObservationType, Session, SessionSummary,
};
use crate::memory::{diff, pending, redact::Redactor, sessions, stats};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::modes::{self, Mode};
use crate::pipeline::QueueProcessor;

/// AI capabilities wired at startup. All optional: an empty set degrades to
/// the basic extractor with no vectors and no reranking.
#[derive(Default)]
pub struct Providers {
    pub compressors: Vec<Arc<dyn Compressor>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub extractor: Option<Arc<dyn EntityExtractor>>,
}

pub struct MemoryEngine {
    db: Arc<Mutex<Connection>>,
    config: MemConfig,
    project_path: String,
    db_path: PathBuf,
    redactor: Redactor,
    compressor: Arc<ChainedCompressor>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    mode: Mode,
    bus: EventBus,
    metrics: Arc<Metrics>,
    processor: Arc<QueueProcessor>,
    vector_enabled: bool,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl MemoryEngine {
    /// Open the engine for a project directory. The directory is
    /// canonicalised through the git-worktree resolver, so every worktree of
    /// a repository shares one database.
    pub fn open(project_dir: &Path, config: MemConfig, providers: Providers) -> Result<Self> {
        let root = canonical_project_root(project_dir);
        let project_path = root.to_string_lossy().into_owned();
        let db_path = config.db_path(&root);

        let opened = db::open_database(&db_path, config.retrieval.embedding_dimensions)
            .map_err(|e| MemError::Internal(e.to_string()))?;
        let vector_enabled = opened.vector_enabled && providers.embedder.is_some();
        let db = Arc::new(Mutex::new(opened.conn));

        let redactor = Redactor::new(&config.redaction);
        let mode = modes::resolve_mode(
            config.mode.modes_dir.as_deref().map(Path::new),
            &config.mode.mode_id,
        );

        if providers.compressors.is_empty() {
            tracing::warn!("no compression providers configured, captures use basic extraction");
        }
        let compressor = Arc::new(ChainedCompressor::new(
            providers.compressors,
            Duration::from_secs(config.pipeline.ai_timeout_secs),
        ));

        let extractor: Option<Arc<dyn EntityExtractor>> = providers
            .extractor
            .or_else(|| Some(Arc::new(crate::ai::BasicEntityExtractor) as Arc<dyn EntityExtractor>));

        let bus = EventBus::new();
        let metrics = Arc::new(Metrics::default());

        let processor = QueueProcessor::new(
            db.clone(),
            compressor.clone(),
            providers.embedder.clone(),
            extractor,
            bus.clone(),
            metrics.clone(),
            mode.clone(),
            config.pipeline.clone(),
            config.retrieval.clone(),
            vector_enabled,
        );

        {
            let conn = lock(&db)?;
            pending::revert_stale(&conn, config.pipeline.stale_claim_secs)?;
        }

        let (shutdown, _) = tokio::sync::watch::channel(false);

        Ok(Self {
            db,
            config,
            project_path,
            db_path,
            redactor,
            compressor,
            embedder: providers.embedder,
            reranker: providers.reranker,
            mode,
            bus,
            metrics,
            processor,
            vector_enabled,
            shutdown,
        })
    }

    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// `true` once a provider config error has degraded compression.
    pub fn compression_degraded(&self) -> bool {
        self.compressor.degraded()
    }

    /// Spawn the in-process queue processor. Refuses to run while another
    /// processor (in-process or external worker) holds the storage lock; the
    /// returned guard owns the lock and stops the loop on shutdown.
    pub fn start_processor(&self) -> Result<ProcessorGuard> {
        let db_dir = self
            .db_path
            .parent()
            .ok_or_else(|| MemError::Internal("database path has no parent".into()))?;
        let stale = Duration::from_secs(self.config.pipeline.stale_claim_secs.max(0) as u64);
        let lock = StorageLock::acquire(db_dir, stale)?;

        let handle = tokio::spawn(self.processor.clone().run(self.shutdown.subscribe()));
        Ok(ProcessorGuard {
            _lock: lock,
            handle,
        })
    }

    /// Signal the processor loop to stop after the item in flight.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    // ── Capture interface (inbound from host) ─────────────────────────────

    /// Fire-and-forget tool capture: Redactor → Pending store.
    pub fn on_tool_execute(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_output: &str,
        call_id: &str,
    ) -> Result<()> {
        let Some(redacted) = self.redactor.redact(tool_output) else {
            Metrics::incr(&self.metrics.captures_suppressed);
            return Ok(());
        };

        let conn = lock(&self.db)?;
        sessions::get_or_create(&conn, Some(session_id), &self.project_path)?;
        if pending::enqueue(&conn, session_id, tool_name, &redacted, call_id)?.is_some() {
            Metrics::incr(&self.metrics.captures_enqueued);
        }
        Ok(())
    }

    /// Only user chat messages are captured, as `discovery` observations
    /// truncated to the configured cap.
    pub fn on_chat_message(
        &self,
        session_id: &str,
        role: &str,
        text: &str,
    ) -> Result<Option<Observation>> {
        if role != "user" {
            return Ok(None);
        }

        let redacted = self.redactor.redact_unbounded(text);
        let narrative: String = redacted
            .chars()
            .take(self.config.redaction.chat_capture_cap)
            .collect();
        if narrative.trim().is_empty() {
            return Ok(None);
        }

        let mut conn = lock(&self.db)?;
        sessions::get_or_create(&conn, Some(session_id), &self.project_path)?;
        let title: String = narrative.chars().take(80).collect();
        let draft = ObservationDraft {
            observation_type: Some(ObservationType::Discovery),
            title,
            narrative,
            raw_tool_output: None,
            tool_name: Some("chat".into()),
            discovery_tokens: crate::memory::types::approx_tokens(text),
            ..ObservationDraft::default()
        };
        let obs = store::create(&mut conn, session_id, &draft)?;
        Metrics::incr(&self.metrics.observations_created);
        self.bus.emit(ObservationEvent::Created {
            id: obs.id.clone(),
            session_id: session_id.to_string(),
        });
        Ok(Some(obs))
    }

    /// Lifecycle signals from the host.
    pub fn on_event(&self, event_type: &str, session_id: &str) -> Result<()> {
        match event_type {
            "session-idle" => {
                {
                    let conn = lock(&self.db)?;
                    if sessions::get(&conn, session_id)?.is_some() {
                        sessions::set_status(
                            &conn,
                            session_id,
                            crate::memory::types::SessionStatus::Idle,
                        )?;
                    }
                }
                self.processor.trigger();
            }
            "session-end" => {
                {
                    let conn = lock(&self.db)?;
                    if sessions::get(&conn, session_id)?.is_some() {
                        sessions::set_status(
                            &conn,
                            session_id,
                            crate::memory::types::SessionStatus::Completed,
                        )?;
                        if self.config.pipeline.summarize_on_session_end {
                            pending::enqueue_summarize(&conn, session_id)?;
                        }
                    }
                }
                self.processor.trigger();
            }
            other => {
                tracing::debug!(event = other, "unhandled host event");
            }
        }
        Ok(())
    }

    /// Build the system-prompt appendix for a new session.
    pub fn on_session_start(&self, session_id: &str) -> Result<String> {
        let (observations, summary) = {
            let conn = lock(&self.db)?;
            sessions::get_or_create(&conn, Some(session_id), &self.project_path)?;
            let observations = store::list_by_project(
                &conn,
                &self.project_path,
                &ListOptions {
                    limit: self.config.context.max_index_entries,
                    ..ListOptions::default()
                },
            )?;
            let summary = sessions::latest_summary(&conn, &self.project_path)?;
            (observations, summary)
        };

        Metrics::incr(&self.metrics.context_assemblies);
        let fragment = context::assemble(&observations, summary.as_ref(), &self.config.context);
        Ok(fragment.text)
    }

    /// Compressed context blocks for mid-session compaction.
    pub fn on_session_compacting(&self, _session_id: &str) -> Result<Vec<String>> {
        let conn = lock(&self.db)?;
        let observations = store::list_by_project(
            &conn,
            &self.project_path,
            &ListOptions {
                limit: self.config.context.max_index_entries,
                ..ListOptions::default()
            },
        )?;
        let summary = sessions::latest_summary(&conn, &self.project_path)?;
        Ok(context::assemble_compacting(
            &observations,
            summary.as_ref(),
            self.config.context.max_context_tokens,
        ))
    }

    // ── Query surface ──────────────────────────────────────────────────────

    pub async fn search(&self, mut request: SearchRequest) -> Result<Vec<SearchResult>> {
        if request.project_path.is_empty() {
            request.project_path = self.project_path.clone();
        }
        if request.limit == 0 {
            request.limit = self.config.retrieval.default_limit;
        }

        let backends = SearchBackends {
            embedder: self.embedder.as_deref(),
            reranker: self.reranker.as_deref(),
            vector_enabled: self.vector_enabled,
            graph_enabled: self.config.pipeline.entity_extraction,
        };

        Metrics::incr(&self.metrics.searches);
        let started = std::time::Instant::now();
        let results = search::search(&self.db, &request, &backends, &self.config.retrieval).await;
        self.metrics.record_timing("search", started.elapsed());
        results
    }

    pub fn list_observations(&self, opts: &ListOptions) -> Result<Vec<Observation>> {
        let conn = lock(&self.db)?;
        store::list_by_project(&conn, &self.project_path, opts)
    }

    pub fn get_observation(&self, id: &str) -> Result<Option<Observation>> {
        let conn = lock(&self.db)?;
        store::get(&conn, id)
    }

    pub fn get_observation_archived(&self, id: &str) -> Result<Option<Observation>> {
        let conn = lock(&self.db)?;
        store::get_including_archived(&conn, id)
    }

    pub fn get_lineage(&self, id: &str) -> Result<Vec<Observation>> {
        let conn = lock(&self.db)?;
        store::get_lineage(&conn, id)
    }

    pub fn revision_diff(&self, old_id: &str, new_id: &str) -> Result<Vec<diff::FieldChange>> {
        let conn = lock(&self.db)?;
        let a = store::get_including_archived(&conn, old_id)?
            .ok_or_else(|| MemError::NotFound(format!("observation {old_id}")))?;
        let b = store::get_including_archived(&conn, new_id)?
            .ok_or_else(|| MemError::NotFound(format!("observation {new_id}")))?;
        diff::diff_revisions(&a, &b)
    }

    pub fn get_around_timestamp(
        &self,
        ts: &str,
        before: usize,
        after: usize,
    ) -> Result<Vec<Observation>> {
        let conn = lock(&self.db)?;
        store::get_around_timestamp(&conn, ts, before, after, &self.project_path)
    }

    pub fn create_observation(
        &self,
        session_id: &str,
        draft: &ObservationDraft,
    ) -> Result<Observation> {
        let mut conn = lock(&self.db)?;
        sessions::get_or_create(&conn, Some(session_id), &self.project_path)?;
        let obs = store::create(&mut conn, session_id, draft)?;
        Metrics::incr(&self.metrics.observations_created);
        self.bus.emit(ObservationEvent::Created {
            id: obs.id.clone(),
            session_id: session_id.to_string(),
        });
        Ok(obs)
    }

    pub fn update_observation(&self, id: &str, patch: &ObservationPatch) -> Result<Observation> {
        if patch.is_empty() {
            return Err(MemError::Validation("empty patch".into()));
        }
        let mut conn = lock(&self.db)?;
        let obs = store::update(&mut conn, id, patch)?;
        Metrics::incr(&self.metrics.observations_revised);
        self.bus.emit(ObservationEvent::Revised {
            id: obs.id.clone(),
            revision_of: id.to_string(),
        });
        Ok(obs)
    }

    pub fn delete_observation(&self, id: &str) -> Result<()> {
        let mut conn = lock(&self.db)?;
        store::delete(&mut conn, id)?;
        Metrics::incr(&self.metrics.observations_tombstoned);
        self.bus.emit(ObservationEvent::Tombstoned { id: id.to_string() });
        Ok(())
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = lock(&self.db)?;
        sessions::list_by_project(&conn, &self.project_path, limit)
    }

    /// A session with its active observations and summary.
    pub fn get_session_detail(
        &self,
        id: &str,
    ) -> Result<(Session, Vec<Observation>, Option<SessionSummary>)> {
        let conn = lock(&self.db)?;
        let session = sessions::get(&conn, id)?
            .ok_or_else(|| MemError::NotFound(format!("session {id}")))?;
        let observations = store::list_by_project(
            &conn,
            &session.project_path,
            &ListOptions {
                limit: 500,
                session_id: Some(id.to_string()),
                ..ListOptions::default()
            },
        )?;
        let summary = match &session.summary_id {
            Some(summary_id) => sessions::get_summary(&conn, summary_id)?,
            None => None,
        };
        Ok((session, observations, summary))
    }

    pub fn stats(&self) -> Result<stats::StatsResponse> {
        let conn = lock(&self.db)?;
        stats::memory_stats(&conn, Some(&self.project_path), Some(&self.db_path))
    }

    pub fn health(&self) -> Result<HealthReport> {
        let conn = lock(&self.db)?;
        db::check_database_health(&conn).map_err(|e| MemError::Internal(e.to_string()))
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn queue_status(&self) -> Result<pending::QueueStatus> {
        let conn = lock(&self.db)?;
        pending::queue_status(&conn)
    }

    /// Drain the pending queue once, in-process.
    pub async fn process_now(&self) {
        self.processor.drain(None).await;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ObservationEvent> {
        self.bus.subscribe()
    }

    pub fn graph_neighbours(
        &self,
        entity_name: &str,
        depth: usize,
    ) -> Result<Vec<crate::memory::graph::Neighbour>> {
        let conn = lock(&self.db)?;
        crate::memory::graph::neighbours(&conn, entity_name, depth)
    }

    // ── Export / import ───────────────────────────────────────────────────

    pub fn export(
        &self,
        observation_type: Option<ObservationType>,
        limit: Option<usize>,
    ) -> Result<ExportData> {
        let conn = lock(&self.db)?;
        let observations = store::list_by_project(
            &conn,
            &self.project_path,
            &ListOptions {
                limit: limit.unwrap_or(1_000_000),
                observation_type,
                ..ListOptions::default()
            },
        )?;

        let mut session_ids: Vec<String> = Vec::new();
        for obs in &observations {
            if !session_ids.contains(&obs.session_id) {
                session_ids.push(obs.session_id.clone());
            }
        }
        let mut export_sessions = Vec::new();
        for sid in session_ids {
            if let Some(session) = sessions::get(&conn, &sid)? {
                export_sessions.push(session);
            }
        }

        Ok(ExportData {
            version: 1,
            project_path: self.project_path.clone(),
            sessions: export_sessions,
            observations,
        })
    }

    pub fn import(&self, data: &ExportData, strategy: ImportStrategy) -> Result<ImportReport> {
        let mut conn = lock(&self.db)?;

        if strategy == ImportStrategy::Overwrite {
            conn.execute_batch(
                "DELETE FROM entity_relationships;
                 DELETE FROM entities;
                 DELETE FROM observations_fts;
                 DELETE FROM session_summaries;
                 DELETE FROM pending_messages;
                 DELETE FROM observations;
                 DELETE FROM sessions;",
            )
            .map_err(MemError::from)?;
            let _ = conn.execute("DELETE FROM observations_vec", []);
        }

        let mut report = ImportReport::default();

        for session in &data.sessions {
            // Imported sessions rebind to this engine's project.
            let mut session = session.clone();
            session.project_path = self.project_path.clone();
            session.summary_id = None;
            sessions::insert_raw(&conn, &session)?;
            report.sessions += 1;
        }

        for obs in &data.observations {
            let exists = store::get_including_archived(&conn, &obs.id)?.is_some();
            if exists {
                report.skipped += 1;
                continue;
            }
            store::insert_raw(&mut conn, obs)?;
            report.observations += 1;
        }

        Ok(report)
    }
}

fn lock(db: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| MemError::Internal(format!("connection lock poisoned: {e}")))
}

/// Owns the storage lock and the processor task.
#[derive(Debug)]
pub struct ProcessorGuard {
    _lock: StorageLock,
    pub handle: tokio::task::JoinHandle<()>,
}

/// JSON dump of active observations plus the sessions they reference.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportData {
    pub version: u32,
    pub project_path: String,
    pub sessions: Vec<Session>,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStrategy {
    /// Skip observations whose id already exists.
    Merge,
    /// Clear the database first, then insert preserving ids and lineage.
    Overwrite,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub sessions: u64,
    pub observations: u64,
    pub skipped: u64,
}
