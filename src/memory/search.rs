//! Search orchestrator — strategy dispatch, Reciprocal Rank Fusion, and
//! optional LLM reranking.
//!
//! Three strategies: `filter-only` (FTS gathering by concept/file terms or
//! general match), `semantic` (vector KNN, degrading to filter-only without
//! an embedder), and `hybrid` (FTS + KNN + graph signals fused via RRF).
//! Project isolation is mandatory: every result's session belongs to the
//! requested project. Ties break by importance, then recency, then id.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ai::{Embedder, Reranker, RerankCandidate};
use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::memory::graph;
use crate::memory::store::{self, SearchQuery};
use crate::memory::types::{Observation, ObservationType};

/// Retrieval strategy chosen by the caller; default `hybrid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchStrategy {
    FilterOnly,
    Semantic,
    #[default]
    Hybrid,
}

impl std::str::FromStr for SearchStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "filter-only" => Ok(Self::FilterOnly),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(format!("unknown search strategy: {s}")),
        }
    }
}

/// A search request. `project_path` is always applied; observations outside
/// it never appear in the result set.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub project_path: String,
    pub strategy: SearchStrategy,
    pub session_id: Option<String>,
    pub observation_type: Option<ObservationType>,
    pub importance_min: Option<u8>,
    pub importance_max: Option<u8>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub concept: Option<String>,
    pub concepts: Vec<String>,
    pub file: Option<String>,
    pub files: Vec<String>,
    pub limit: usize,
    pub offset: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, project_path: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            project_path: project_path.into(),
            strategy: SearchStrategy::default(),
            session_id: None,
            observation_type: None,
            importance_min: None,
            importance_max: None,
            created_after: None,
            created_before: None,
            concept: None,
            concepts: Vec::new(),
            file: None,
            files: Vec::new(),
            limit: 20,
            offset: 0,
        }
    }

    /// All concept terms: the singular shortcut plus the list.
    fn concept_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        if let Some(ref c) = self.concept {
            terms.push(c.clone());
        }
        for c in &self.concepts {
            if !terms.iter().any(|t| t.eq_ignore_ascii_case(c)) {
                terms.push(c.clone());
            }
        }
        terms
    }

    fn file_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        if let Some(ref f) = self.file {
            terms.push(f.clone());
        }
        for f in &self.files {
            if !terms.iter().any(|t| t == f) {
                terms.push(f.clone());
            }
        }
        terms
    }

    fn as_store_query(&self) -> SearchQuery {
        SearchQuery {
            query: self.query.clone(),
            project_path: Some(self.project_path.clone()),
            session_id: self.session_id.clone(),
            observation_type: self.observation_type,
            importance_min: self.importance_min,
            importance_max: self.importance_max,
            created_after: self.created_after.clone(),
            created_before: self.created_before.clone(),
            concepts: self.concept_terms(),
            files: self.file_terms(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Per-signal contribution recorded in the explain block.
#[derive(Debug, Clone, Serialize)]
pub struct SignalScore {
    pub signal: String,
    pub score: f64,
}

/// Which signals matched and how much each contributed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Explain {
    pub matched_by: Vec<String>,
    pub signals: Vec<SignalScore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub observation: Observation,
    /// 1-based position in the final ordering.
    pub rank: usize,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_similarity: Option<f64>,
    pub explain: Explain,
}

/// Capabilities the orchestrator dispatches over.
pub struct SearchBackends<'a> {
    pub embedder: Option<&'a dyn Embedder>,
    pub reranker: Option<&'a dyn Reranker>,
    pub vector_enabled: bool,
    pub graph_enabled: bool,
}

/// Execute a search. Suspends only for query embedding and reranking; all
/// database work happens synchronously under the connection lock.
pub async fn search(
    db: &Arc<Mutex<Connection>>,
    request: &SearchRequest,
    backends: &SearchBackends<'_>,
    config: &RetrievalConfig,
) -> Result<Vec<SearchResult>> {
    match request.strategy {
        SearchStrategy::FilterOnly => {
            let conn = lock(db)?;
            filter_only(&conn, request)
        }
        SearchStrategy::Semantic => semantic(db, request, backends).await,
        SearchStrategy::Hybrid => hybrid(db, request, backends, config).await,
    }
}

fn lock(db: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| crate::error::MemError::Internal(format!("connection lock poisoned: {e}")))
}

// ── filter-only ───────────────────────────────────────────────────────────────

/// Gather by concept terms (or file terms, or general FTS), then re-apply
/// the remaining filters as a conjunction and truncate to `limit`.
fn filter_only(conn: &Connection, request: &SearchRequest) -> Result<Vec<SearchResult>> {
    let concept_terms = request.concept_terms();
    let file_terms = request.file_terms();
    let gather_limit = (request.limit + request.offset).max(1) * 4;

    let (gathered, matched_by) = if !concept_terms.is_empty() {
        let mut seen = std::collections::HashSet::new();
        let mut rows: Vec<Observation> = Vec::new();
        for term in &concept_terms {
            for (obs, _) in
                store::search_by_concept(conn, term, gather_limit, Some(&request.project_path))?
            {
                if seen.insert(obs.id.clone()) {
                    rows.push(obs);
                }
            }
        }
        (rows, "concept-filter")
    } else if !file_terms.is_empty() {
        let mut seen = std::collections::HashSet::new();
        let mut rows: Vec<Observation> = Vec::new();
        for term in &file_terms {
            for (obs, _) in
                store::search_by_file(conn, term, gather_limit, Some(&request.project_path))?
            {
                if seen.insert(obs.id.clone()) {
                    rows.push(obs);
                }
            }
        }
        (rows, "file-filter")
    } else {
        let mut q = request.as_store_query();
        // Pagination happens once, below, after the residual filters.
        q.limit = gather_limit;
        q.offset = 0;
        let rows = store::search(conn, &q)?
            .into_iter()
            .map(|(obs, _)| obs)
            .collect();
        (rows, "fts")
    };

    // Terms already used for gathering are not re-applied as a conjunction.
    let residual_concepts: &[String] = if matched_by == "concept-filter" {
        &[]
    } else {
        &concept_terms
    };
    let residual_files: &[String] = if matched_by == "file-filter" {
        &[]
    } else {
        &file_terms
    };

    let results = gathered
        .into_iter()
        .filter(|obs| passes_scalar_filters(obs, request))
        .filter(|obs| store::matches_set_filters(obs, residual_concepts, residual_files))
        .skip(request.offset)
        .take(request.limit)
        .enumerate()
        .map(|(i, obs)| {
            let snippet = obs.title.clone();
            SearchResult {
                observation: obs,
                rank: i + 1,
                snippet,
                vector_distance: None,
                vector_similarity: None,
                explain: Explain {
                    matched_by: vec![matched_by.to_string()],
                    signals: Vec::new(),
                },
            }
        })
        .collect();
    Ok(results)
}

// ── semantic ──────────────────────────────────────────────────────────────────

async fn semantic(
    db: &Arc<Mutex<Connection>>,
    request: &SearchRequest,
    backends: &SearchBackends<'_>,
) -> Result<Vec<SearchResult>> {
    let Some(embedder) = backends.embedder.filter(|_| backends.vector_enabled) else {
        // No embedding capability: degrade to filter-only.
        let conn = lock(db)?;
        return filter_only(&conn, request);
    };

    let query_vector = match embedder.embed(&request.query).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "query embedding failed, degrading to filter-only");
            let conn = lock(db)?;
            return filter_only(&conn, request);
        }
    };

    let conn = lock(db)?;
    let k = (request.limit + request.offset).max(1) * 4;
    let hits = store::vec_search(&conn, &query_vector, k);

    let results = hits
        .into_iter()
        .filter_map(|(id, distance)| {
            fetch_in_project(&conn, &id, &request.project_path).map(|obs| (obs, distance))
        })
        .filter(|(obs, _)| passes_all_filters(obs, request))
        .skip(request.offset)
        .take(request.limit)
        .enumerate()
        .map(|(i, (obs, distance))| {
            let snippet = obs.title.clone();
            SearchResult {
                observation: obs,
                rank: i + 1,
                snippet,
                vector_distance: Some(distance),
                vector_similarity: Some(1.0 - distance),
                explain: Explain {
                    matched_by: vec!["vector".to_string()],
                    signals: vec![SignalScore {
                        signal: "vector".into(),
                        score: 1.0 - distance,
                    }],
                },
            }
        })
        .collect();
    Ok(results)
}

// ── hybrid ────────────────────────────────────────────────────────────────────

async fn hybrid(
    db: &Arc<Mutex<Connection>>,
    request: &SearchRequest,
    backends: &SearchBackends<'_>,
    config: &RetrievalConfig,
) -> Result<Vec<SearchResult>> {
    // Embed before taking the lock: the only suspension points are AI calls.
    let query_vector = match backends.embedder.filter(|_| backends.vector_enabled) {
        Some(embedder) => match embedder.embed(&request.query).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, hybrid loses the vector signal");
                None
            }
        },
        None => None,
    };

    let fused = {
        let conn = lock(db)?;
        let candidate_limit = (request.limit + request.offset).max(1) * config.candidate_multiplier;

        let fts_ranked: Vec<(Observation, f64)> = {
            let mut q = request.as_store_query();
            q.limit = candidate_limit;
            q.offset = 0;
            store::search(&conn, &q)?
        };

        let vec_ranked: Vec<(Observation, f64)> = match &query_vector {
            Some(vector) => store::vec_search(&conn, vector, candidate_limit)
                .into_iter()
                .filter_map(|(id, distance)| {
                    fetch_in_project(&conn, &id, &request.project_path)
                        .map(|obs| (obs, distance))
                })
                .filter(|(obs, _)| passes_all_filters(obs, request))
                .collect(),
            None => Vec::new(),
        };

        let graph_ranked: Vec<Observation> = if backends.graph_enabled {
            let mut seen = std::collections::HashSet::new();
            let mut rows = Vec::new();
            for term in request.concept_terms() {
                for obs_id in graph::observation_ids_near(&conn, &term, 2)? {
                    if !seen.insert(obs_id.clone()) {
                        continue;
                    }
                    if let Some(obs) = fetch_in_project(&conn, &obs_id, &request.project_path) {
                        // Concept terms seed the graph walk here, so only the
                        // scalar filters re-apply to its results.
                        if passes_scalar_filters(&obs, request) {
                            rows.push(obs);
                        }
                    }
                }
            }
            rows
        } else {
            Vec::new()
        };

        fuse(fts_ranked, vec_ranked, graph_ranked, config.rrf_k)
    };

    let mut ordered: Vec<Fused> = fused;
    ordered.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.observation.importance.cmp(&a.observation.importance))
            .then_with(|| b.observation.created_at.cmp(&a.observation.created_at))
            .then_with(|| a.observation.id.cmp(&b.observation.id))
    });

    let page: Vec<Fused> = ordered
        .into_iter()
        .skip(request.offset)
        .take(request.limit)
        .collect();

    let page = maybe_rerank(page, request, backends, config).await;

    Ok(page
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            let snippet = f.observation.title.clone();
            SearchResult {
                observation: f.observation,
                rank: i + 1,
                snippet,
                vector_distance: f.vector_distance,
                vector_similarity: f.vector_distance.map(|d| 1.0 - d),
                explain: f.explain,
            }
        })
        .collect())
}

struct Fused {
    observation: Observation,
    score: f64,
    vector_distance: Option<f64>,
    explain: Explain,
}

/// Reciprocal Rank Fusion: `score(o) = Σ_rankers 1/(k + rank_r(o))`.
fn fuse(
    fts: Vec<(Observation, f64)>,
    vec: Vec<(Observation, f64)>,
    graph: Vec<Observation>,
    k: usize,
) -> Vec<Fused> {
    let mut by_id: HashMap<String, Fused> = HashMap::new();

    let mut contribute =
        |obs: Observation, rank: usize, signal: &str, distance: Option<f64>| {
            let rrf = 1.0 / (k as f64 + rank as f64);
            let entry = by_id.entry(obs.id.clone()).or_insert_with(|| Fused {
                observation: obs,
                score: 0.0,
                vector_distance: None,
                explain: Explain::default(),
            });
            entry.score += rrf;
            if distance.is_some() {
                entry.vector_distance = distance;
            }
            entry.explain.matched_by.push(signal.to_string());
            entry.explain.signals.push(SignalScore {
                signal: signal.to_string(),
                score: rrf,
            });
        };

    for (rank, (obs, _fts_rank)) in fts.into_iter().enumerate() {
        contribute(obs, rank, "fts", None);
    }
    for (rank, (obs, distance)) in vec.into_iter().enumerate() {
        contribute(obs, rank, "vector", Some(distance));
    }
    for (rank, obs) in graph.into_iter().enumerate() {
        contribute(obs, rank, "graph", None);
    }

    by_id.into_values().collect()
}

/// Rerank the top candidates via the LLM reranker; failures revert to the
/// fused order.
async fn maybe_rerank(
    page: Vec<Fused>,
    request: &SearchRequest,
    backends: &SearchBackends<'_>,
    config: &RetrievalConfig,
) -> Vec<Fused> {
    let Some(reranker) = backends.reranker.filter(|_| config.reranking_enabled) else {
        return page;
    };
    if page.len() < 2 {
        return page;
    }

    let cutoff = config.reranking_max_candidates.min(page.len());
    let candidates: Vec<RerankCandidate> = page[..cutoff]
        .iter()
        .map(|f| RerankCandidate {
            id: f.observation.id.clone(),
            title: f.observation.title.clone(),
            snippet: f.observation.narrative.chars().take(200).collect(),
        })
        .collect();

    match reranker.rerank(&request.query, &candidates).await {
        Ok(order) if order.len() == cutoff => {
            let mut head: Vec<Option<Fused>> = page
                .into_iter()
                .map(Some)
                .collect();
            let mut reordered = Vec::with_capacity(head.len());
            for idx in order {
                if idx < cutoff {
                    if let Some(f) = head[idx].take() {
                        reordered.push(f);
                    }
                }
            }
            // Anything the reranker skipped, then the tail, keep fused order.
            for slot in head.into_iter().flatten() {
                reordered.push(slot);
            }
            reordered
        }
        Ok(_) | Err(_) => {
            tracing::debug!("reranker unavailable or returned a bad ordering, keeping RRF order");
            page
        }
    }
}

// ── Shared filtering ──────────────────────────────────────────────────────────

fn passes_scalar_filters(obs: &Observation, request: &SearchRequest) -> bool {
    if let Some(t) = request.observation_type {
        if obs.observation_type != t {
            return false;
        }
    }
    if let Some(ref sid) = request.session_id {
        if &obs.session_id != sid {
            return false;
        }
    }
    if let Some(min) = request.importance_min {
        if obs.importance < min {
            return false;
        }
    }
    if let Some(max) = request.importance_max {
        if obs.importance > max {
            return false;
        }
    }
    if let Some(ref after) = request.created_after {
        if obs.created_at.as_str() < after.as_str() {
            return false;
        }
    }
    if let Some(ref before) = request.created_before {
        if obs.created_at.as_str() > before.as_str() {
            return false;
        }
    }
    true
}

fn passes_all_filters(obs: &Observation, request: &SearchRequest) -> bool {
    passes_scalar_filters(obs, request)
        && store::matches_set_filters(obs, &request.concept_terms(), &request.file_terms())
}

/// Hydrate an active observation only when its session belongs to the
/// requested project.
fn fetch_in_project(conn: &Connection, id: &str, project_path: &str) -> Option<Observation> {
    conn.query_row(
        "SELECT o.id, o.session_id, o.scope, o.type, o.title, o.subtitle, o.narrative, \
         o.facts, o.concepts, o.files_read, o.files_modified, o.raw_tool_output, o.tool_name, \
         o.created_at, o.token_count, o.discovery_tokens, o.importance, o.revision_of, \
         o.superseded_by, o.superseded_at, o.deleted_at \
         FROM observations o JOIN sessions s ON s.id = o.session_id \
         WHERE o.id = ?1 AND s.project_path = ?2 \
           AND o.superseded_by IS NULL AND o.deleted_at IS NULL",
        params![id, project_path],
        store::row_to_observation,
    )
    .optional()
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::EMBEDDING_DIM;
    use crate::db;
    use crate::error::MemError;
    use crate::memory::sessions;
    use crate::memory::types::ObservationDraft;
    use async_trait::async_trait;

    fn test_db() -> Arc<Mutex<Connection>> {
        Arc::new(Mutex::new(db::open_memory_database().unwrap()))
    }

    fn seed(
        db: &Arc<Mutex<Connection>>,
        project: &str,
        title: &str,
        concepts: &[&str],
        files: &[&str],
    ) -> Observation {
        let mut conn = db.lock().unwrap();
        let sid = sessions::get_or_create(&conn, Some(project), project)
            .unwrap()
            .id;
        let draft = ObservationDraft {
            observation_type: Some(ObservationType::Discovery),
            title: title.into(),
            narrative: format!("{title} narrative"),
            concepts: concepts.iter().map(|s| s.to_string()).collect(),
            files_modified: files.iter().map(|s| s.to_string()).collect(),
            discovery_tokens: 50,
            ..ObservationDraft::default()
        };
        store::create(&mut conn, &sid, &draft).unwrap()
    }

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    struct SpikeEmbedder(usize);

    #[async_trait]
    impl Embedder for SpikeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(spike(self.0))
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(MemError::Retryable("down".into()))
        }
    }

    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(
            &self,
            _query: &str,
            candidates: &[RerankCandidate],
        ) -> Result<Vec<usize>> {
            Ok((0..candidates.len()).rev().collect())
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn rerank(&self, _: &str, _: &[RerankCandidate]) -> Result<Vec<usize>> {
            Err(MemError::Retryable("rerank model offline".into()))
        }
    }

    fn backends<'a>() -> SearchBackends<'a> {
        SearchBackends {
            embedder: None,
            reranker: None,
            vector_enabled: true,
            graph_enabled: false,
        }
    }

    #[tokio::test]
    async fn project_isolation_holds() {
        let db = test_db();
        seed(&db, "/project/alpha", "Alpha JWT authentication pattern", &["JWT", "authentication"], &["src/auth.ts"]);
        seed(&db, "/project/beta", "Beta JWT token validation", &["JWT", "validation"], &[]);

        let request = SearchRequest::new("JWT", "/project/alpha");
        let results = search(&db, &request, &backends(), &RetrievalConfig::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].observation.title.starts_with("Alpha"));
        assert_eq!(results[0].rank, 1);
    }

    #[tokio::test]
    async fn filter_only_concept_terms_union_and_dedupe() {
        let db = test_db();
        let a = seed(&db, "/p", "Auth setup", &["authentication"], &[]);
        let b = seed(&db, "/p", "Hook refactor", &["hooks"], &[]);
        seed(&db, "/p", "Unrelated", &["caching"], &[]);

        let mut request = SearchRequest::new("anything", "/p");
        request.strategy = SearchStrategy::FilterOnly;
        request.concept = Some("authentication".into());
        request.concepts = vec!["hooks".into()];

        let results = search(&db, &request, &backends(), &RetrievalConfig::default())
            .await
            .unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.observation.id.as_str()).collect();
        assert_eq!(results.len(), 2);
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&b.id.as_str()));
        for r in &results {
            assert_eq!(r.explain.matched_by, vec!["concept-filter".to_string()]);
        }
    }

    #[tokio::test]
    async fn filter_only_by_file_terms() {
        let db = test_db();
        let a = seed(&db, "/p", "Auth change", &[], &["src/auth.ts"]);
        seed(&db, "/p", "Other change", &[], &["src/other.ts"]);

        let mut request = SearchRequest::new("anything", "/p");
        request.strategy = SearchStrategy::FilterOnly;
        request.files = vec!["src/auth.ts".into()];

        let results = search(&db, &request, &backends(), &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].observation.id, a.id);
        assert_eq!(results[0].explain.matched_by, vec!["file-filter".to_string()]);
    }

    #[tokio::test]
    async fn semantic_degrades_without_embedder() {
        let db = test_db();
        seed(&db, "/p", "Token parsing", &[], &[]);

        let mut request = SearchRequest::new("token", "/p");
        request.strategy = SearchStrategy::Semantic;

        let results = search(&db, &request, &backends(), &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].explain.matched_by, vec!["fts".to_string()]);
    }

    #[tokio::test]
    async fn semantic_annotates_distance_and_similarity() {
        let db = test_db();
        let a = seed(&db, "/p", "Near doc", &[], &[]);
        let b = seed(&db, "/p", "Far doc", &[], &[]);
        {
            let mut conn = db.lock().unwrap();
            store::vec_upsert(&mut conn, &a.id, &spike(0)).unwrap();
            store::vec_upsert(&mut conn, &b.id, &spike(5)).unwrap();
        }

        let embedder = SpikeEmbedder(0);
        let b = SearchBackends {
            embedder: Some(&embedder),
            ..backends()
        };
        let mut request = SearchRequest::new("near", "/p");
        request.strategy = SearchStrategy::Semantic;

        let results = search(&db, &request, &b, &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results[0].observation.id, a.id);
        let sim = results[0].vector_similarity.unwrap();
        assert!(sim > 0.99, "similarity was {sim}");
    }

    #[tokio::test]
    async fn hybrid_fuses_fts_and_vector_signals() {
        let db = test_db();
        // `both` matches the query text AND sits nearest in vector space.
        let both = seed(&db, "/p", "Retry logic in queue", &[], &[]);
        let _fts_only = seed(&db, "/p", "Retry documentation", &[], &[]);
        let vec_only = seed(&db, "/p", "Unrelated title", &[], &[]);
        {
            let mut conn = db.lock().unwrap();
            store::vec_upsert(&mut conn, &both.id, &spike(0)).unwrap();
            store::vec_upsert(&mut conn, &vec_only.id, &spike(1)).unwrap();
            // fts_only has no vector entry, so it carries a single signal.
        }

        let embedder = SpikeEmbedder(0);
        let b = SearchBackends {
            embedder: Some(&embedder),
            ..backends()
        };
        let request = SearchRequest::new("retry", "/p");
        let results = search(&db, &request, &b, &RetrievalConfig::default())
            .await
            .unwrap();

        assert_eq!(results[0].observation.id, both.id);
        assert!(results[0]
            .explain
            .matched_by
            .contains(&"fts".to_string()));
        assert!(results[0]
            .explain
            .matched_by
            .contains(&"vector".to_string()));
        assert_eq!(results[0].explain.signals.len(), 2);
    }

    #[tokio::test]
    async fn hybrid_includes_graph_signal() {
        let db = test_db();
        let tagged = seed(&db, "/p", "Session store work", &["sessions"], &[]);
        {
            let conn = db.lock().unwrap();
            let a = graph::upsert_entity(&conn, "concept", "auth", None).unwrap();
            let b = graph::upsert_entity(&conn, "file", "src/auth.rs", None).unwrap();
            graph::link(&conn, &a.id, "relates_to", &b.id, &tagged.id).unwrap();
        }

        let b = SearchBackends {
            graph_enabled: true,
            ..backends()
        };
        let mut request = SearchRequest::new("nomatchword", "/p");
        request.concept = Some("auth".into());
        request.strategy = SearchStrategy::Hybrid;

        let results = search(&db, &request, &b, &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].observation.id, tagged.id);
        assert_eq!(results[0].explain.matched_by, vec!["graph".to_string()]);
    }

    #[tokio::test]
    async fn hybrid_survives_embedder_failure() {
        let db = test_db();
        seed(&db, "/p", "Parser cleanup", &[], &[]);

        let embedder = FailingEmbedder;
        let b = SearchBackends {
            embedder: Some(&embedder),
            ..backends()
        };
        let request = SearchRequest::new("parser", "/p");
        let results = search(&db, &request, &b, &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn reranker_reorders_and_failures_revert() {
        let db = test_db();
        seed(&db, "/p", "Cache invalidation first", &[], &[]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        seed(&db, "/p", "Cache invalidation second", &[], &[]);

        let reranker = ReversingReranker;
        let b = SearchBackends {
            reranker: Some(&reranker),
            ..backends()
        };
        let config = RetrievalConfig {
            reranking_enabled: true,
            ..RetrievalConfig::default()
        };
        let request = SearchRequest::new("cache invalidation", "/p");

        let baseline = search(&db, &request, &backends(), &config).await.unwrap();
        let reranked = search(&db, &request, &b, &config).await.unwrap();
        assert_eq!(baseline.len(), 2);
        assert_eq!(
            baseline[0].observation.id,
            reranked[1].observation.id
        );
        assert_eq!(reranked[0].rank, 1);

        // A failing reranker reverts to the fused order.
        let broken = BrokenReranker;
        let b = SearchBackends {
            reranker: Some(&broken),
            ..backends()
        };
        let reverted = search(&db, &request, &b, &config).await.unwrap();
        assert_eq!(reverted[0].observation.id, baseline[0].observation.id);
    }

    #[tokio::test]
    async fn tombstoned_rows_never_surface() {
        let db = test_db();
        let obs = seed(&db, "/p", "hide-me completely", &[], &[]);
        {
            let mut conn = db.lock().unwrap();
            store::delete(&mut conn, &obs.id).unwrap();
        }

        let request = SearchRequest::new("hide-me", "/p");
        let results = search(&db, &request, &backends(), &RetrievalConfig::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn filters_compose_conjunctively() {
        let db = test_db();
        let mut keep = SearchRequest::new("work", "/p");
        let a = seed(&db, "/p", "Important auth work", &["auth"], &[]);
        {
            let mut conn = db.lock().unwrap();
            // Raise importance of `a` via a revision.
            store::update(
                &mut conn,
                &a.id,
                &crate::memory::types::ObservationPatch {
                    importance: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        seed(&db, "/p", "Minor auth work", &["auth"], &[]);

        keep.importance_min = Some(4);
        let results = search(&db, &keep, &backends(), &RetrievalConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].observation.importance, 5);
    }
}
