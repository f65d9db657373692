//! SQLite storage implementation.
//!
//! All durable pipeline state lives in one file-backed database. The
//! schema is created idempotently at open; columns added after the
//! first release (`alignment_status`, `aligned_problem_id`,
//! `evidence_sources`, `comments_used`) are applied best-effort so
//! older files keep working. Every write path is an upsert or an
//! insert-or-ignore, which is what makes stage restarts safe.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{MinerError, Result};
use crate::traits::store::{
    ClusterStore, EventStore, FilterStore, OpportunityStore, PostStore,
};
use crate::types::{
    AlignedProblem, AlignmentEvidence, AlignmentStatus, Cluster, Comment, EvidenceSource,
    FetchedPost, FilterReason, FilteredPost, Opportunity, PainEvent, PainType, Post,
};

/// SQLite-backed pipeline store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database at the given URL.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - in-memory (tests)
    /// - `sqlite://painmine.db` - file-based
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(MinerError::storage)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives inside its connection; a wider
        // pool would hand out empty databases.
        let is_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 5 });
        if is_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(MinerError::storage)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                source_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                platform_data TEXT NOT NULL DEFAULT '{}',
                score INTEGER NOT NULL DEFAULT 0,
                num_comments INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                author TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                raw TEXT NOT NULL DEFAULT '{}',
                UNIQUE(source, source_id)
            );

            CREATE INDEX IF NOT EXISTS idx_posts_source ON posts(source);
            CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                source TEXT NOT NULL,
                source_comment_id TEXT NOT NULL,
                author TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                score INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(source, source_comment_id)
            );

            CREATE INDEX IF NOT EXISTS idx_comments_post_id ON comments(post_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS filtered_posts (
                post_id TEXT PRIMARY KEY REFERENCES posts(id) ON DELETE CASCADE,
                pain_score REAL NOT NULL,
                matched_keywords TEXT NOT NULL DEFAULT '[]',
                matched_patterns TEXT NOT NULL DEFAULT '[]',
                emotional_intensity REAL NOT NULL DEFAULT 0,
                filter_reason TEXT NOT NULL DEFAULT '{}',
                extracted_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pain_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                actor TEXT NOT NULL DEFAULT '',
                context TEXT NOT NULL DEFAULT '',
                problem TEXT NOT NULL,
                current_workaround TEXT,
                frequency TEXT,
                emotional_signal TEXT,
                mentioned_tools TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL DEFAULT 0,
                evidence_sources TEXT NOT NULL DEFAULT '[]',
                comments_used INTEGER NOT NULL DEFAULT 0,
                pain_types TEXT NOT NULL DEFAULT '[]',
                primary_pain_type TEXT,
                frequency_score INTEGER NOT NULL DEFAULT 5,
                post_title TEXT NOT NULL DEFAULT '',
                post_category TEXT NOT NULL DEFAULT '',
                post_pain_score REAL NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_pain_events_post_id ON pain_events(post_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pain_embeddings (
                pain_event_id INTEGER PRIMARY KEY REFERENCES pain_events(id) ON DELETE CASCADE,
                model TEXT NOT NULL,
                vector BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source_type TEXT NOT NULL,
                centroid_summary TEXT NOT NULL DEFAULT '',
                common_pain TEXT NOT NULL DEFAULT '',
                common_context TEXT NOT NULL DEFAULT '',
                example_events TEXT NOT NULL DEFAULT '[]',
                coherence_score REAL NOT NULL DEFAULT 0,
                pain_event_ids TEXT NOT NULL DEFAULT '[]',
                size INTEGER NOT NULL DEFAULT 0,
                workflow_confidence REAL NOT NULL DEFAULT 0,
                alignment_status TEXT NOT NULL DEFAULT 'unprocessed',
                aligned_problem_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clusters_source_type ON clusters(source_type);
            CREATE INDEX IF NOT EXISTS idx_clusters_alignment ON clusters(alignment_status);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aligned_problems (
                id TEXT PRIMARY KEY,
                sources TEXT NOT NULL DEFAULT '[]',
                core_problem TEXT NOT NULL,
                why_they_look_different TEXT NOT NULL DEFAULT '',
                evidence TEXT NOT NULL DEFAULT '[]',
                cluster_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id TEXT NOT NULL UNIQUE,
                source_type TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                target_users TEXT NOT NULL DEFAULT '',
                current_tools TEXT NOT NULL DEFAULT '[]',
                missing_capability TEXT NOT NULL DEFAULT '',
                why_existing_fail TEXT NOT NULL DEFAULT '',
                pain_frequency REAL NOT NULL DEFAULT 0,
                market_size REAL NOT NULL DEFAULT 0,
                mvp_complexity REAL NOT NULL DEFAULT 0,
                competition_risk REAL NOT NULL DEFAULT 0,
                integration_complexity REAL NOT NULL DEFAULT 0,
                total_score REAL NOT NULL DEFAULT 0,
                killer_risks TEXT NOT NULL DEFAULT '[]',
                recommendation TEXT NOT NULL DEFAULT ''
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        // Additive columns for databases created before these landed.
        for statement in [
            "ALTER TABLE clusters ADD COLUMN alignment_status TEXT NOT NULL DEFAULT 'unprocessed'",
            "ALTER TABLE clusters ADD COLUMN aligned_problem_id TEXT",
            "ALTER TABLE pain_events ADD COLUMN evidence_sources TEXT NOT NULL DEFAULT '[]'",
            "ALTER TABLE pain_events ADD COLUMN comments_used INTEGER NOT NULL DEFAULT 0",
        ] {
            sqlx::query(statement).execute(&self.pool).await.ok();
        }

        Ok(())
    }
}

// Row types for sqlx queries

#[derive(Debug, FromRow)]
struct PostRow {
    id: String,
    source: String,
    source_id: String,
    title: String,
    body: String,
    url: String,
    platform_data: String,
    score: i64,
    num_comments: i64,
    created_at: String,
    author: String,
    category: String,
    raw: String,
}

const POST_COLUMNS: &str = "id, source, source_id, title, body, url, platform_data, score, \
                            num_comments, created_at, author, category, raw";

impl PostRow {
    fn into_post(self) -> Result<Post> {
        Ok(Post {
            id: self.id,
            source: self.source,
            source_id: self.source_id,
            title: self.title,
            body: self.body,
            url: self.url,
            platform_data: serde_json::from_str(&self.platform_data)?,
            score: self.score,
            num_comments: self.num_comments,
            created_at: parse_utc(&self.created_at)?,
            author: self.author,
            category: self.category,
            raw: serde_json::from_str(&self.raw)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct CommentRow {
    id: i64,
    post_id: String,
    source: String,
    source_comment_id: String,
    author: String,
    body: String,
    score: i64,
    created_at: String,
}

impl CommentRow {
    fn into_comment(self) -> Result<Comment> {
        Ok(Comment {
            id: Some(self.id),
            post_id: self.post_id,
            source: self.source,
            source_comment_id: self.source_comment_id,
            author: self.author,
            body: self.body,
            score: self.score,
            created_at: parse_utc(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct FilteredRow {
    post_id: String,
    pain_score: f64,
    matched_keywords: String,
    matched_patterns: String,
    emotional_intensity: f64,
    filter_reason: String,
}

impl FilteredRow {
    fn into_filtered(self) -> Result<FilteredPost> {
        let filter_reason: FilterReason = serde_json::from_str(&self.filter_reason)?;
        Ok(FilteredPost {
            post_id: self.post_id,
            pain_score: self.pain_score as f32,
            matched_keywords: serde_json::from_str(&self.matched_keywords)?,
            matched_patterns: serde_json::from_str(&self.matched_patterns)?,
            emotional_intensity: self.emotional_intensity as f32,
            filter_reason,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    post_id: String,
    actor: String,
    context: String,
    problem: String,
    current_workaround: Option<String>,
    frequency: Option<String>,
    emotional_signal: Option<String>,
    mentioned_tools: String,
    confidence: f64,
    evidence_sources: String,
    pain_types: String,
    primary_pain_type: Option<String>,
    frequency_score: i64,
    post_title: String,
    post_category: String,
    post_pain_score: f64,
}

const EVENT_COLUMNS: &str = "id, post_id, actor, context, problem, current_workaround, \
                             frequency, emotional_signal, mentioned_tools, confidence, \
                             evidence_sources, pain_types, primary_pain_type, frequency_score, \
                             post_title, post_category, post_pain_score";

impl EventRow {
    fn into_event(self) -> Result<PainEvent> {
        let evidence_sources: Vec<EvidenceSource> =
            serde_json::from_str(&self.evidence_sources)?;
        let pain_types: Vec<PainType> = serde_json::from_str(&self.pain_types)?;
        let primary_pain_type = match self.primary_pain_type {
            Some(raw) => serde_json::from_str(&format!("\"{}\"", raw)).ok(),
            None => None,
        };
        Ok(PainEvent {
            id: Some(self.id),
            post_id: self.post_id,
            actor: self.actor,
            context: self.context,
            problem: self.problem,
            current_workaround: self.current_workaround,
            frequency: self.frequency,
            emotional_signal: self.emotional_signal,
            mentioned_tools: serde_json::from_str(&self.mentioned_tools)?,
            confidence: self.confidence as f32,
            evidence_sources,
            pain_types,
            primary_pain_type,
            frequency_score: self.frequency_score.clamp(1, 10) as u8,
            post_title: self.post_title,
            post_category: self.post_category,
            post_pain_score: self.post_pain_score as f32,
        })
    }
}

#[derive(Debug, FromRow)]
struct ClusterRow {
    id: String,
    name: String,
    source_type: String,
    centroid_summary: String,
    common_pain: String,
    common_context: String,
    example_events: String,
    coherence_score: f64,
    pain_event_ids: String,
    size: i64,
    workflow_confidence: f64,
    alignment_status: String,
    aligned_problem_id: Option<String>,
    created_at: String,
}

const CLUSTER_COLUMNS: &str = "id, name, source_type, centroid_summary, common_pain, \
                               common_context, example_events, coherence_score, pain_event_ids, \
                               size, workflow_confidence, alignment_status, aligned_problem_id, \
                               created_at";

impl ClusterRow {
    fn into_cluster(self) -> Result<Cluster> {
        Ok(Cluster {
            id: self.id,
            name: self.name,
            source_type: self.source_type,
            centroid_summary: self.centroid_summary,
            common_pain: self.common_pain,
            common_context: self.common_context,
            example_events: serde_json::from_str(&self.example_events)?,
            coherence_score: self.coherence_score as f32,
            pain_event_ids: serde_json::from_str(&self.pain_event_ids)?,
            size: self.size as usize,
            workflow_confidence: self.workflow_confidence as f32,
            alignment_status: AlignmentStatus::parse(&self.alignment_status),
            aligned_problem_id: self.aligned_problem_id,
            created_at: parse_utc(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct AlignedRow {
    id: String,
    sources: String,
    core_problem: String,
    why_they_look_different: String,
    evidence: String,
    cluster_ids: String,
    created_at: String,
}

impl AlignedRow {
    fn into_problem(self) -> Result<AlignedProblem> {
        let evidence: Vec<AlignmentEvidence> = serde_json::from_str(&self.evidence)?;
        Ok(AlignedProblem {
            id: self.id,
            sources: serde_json::from_str(&self.sources)?,
            core_problem: self.core_problem,
            why_they_look_different: self.why_they_look_different,
            evidence,
            cluster_ids: serde_json::from_str(&self.cluster_ids)?,
            created_at: parse_utc(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct OpportunityRow {
    id: i64,
    cluster_id: String,
    source_type: String,
    name: String,
    description: String,
    target_users: String,
    current_tools: String,
    missing_capability: String,
    why_existing_fail: String,
    pain_frequency: f64,
    market_size: f64,
    mvp_complexity: f64,
    competition_risk: f64,
    integration_complexity: f64,
    total_score: f64,
    killer_risks: String,
    recommendation: String,
}

const OPPORTUNITY_COLUMNS: &str = "id, cluster_id, source_type, name, description, target_users, \
                                   current_tools, missing_capability, why_existing_fail, \
                                   pain_frequency, market_size, mvp_complexity, competition_risk, \
                                   integration_complexity, total_score, killer_risks, \
                                   recommendation";

impl OpportunityRow {
    fn into_opportunity(self) -> Result<Opportunity> {
        Ok(Opportunity {
            id: Some(self.id),
            cluster_id: self.cluster_id,
            source_type: self.source_type,
            name: self.name,
            description: self.description,
            target_users: self.target_users,
            current_tools: serde_json::from_str(&self.current_tools)?,
            missing_capability: self.missing_capability,
            why_existing_fail: self.why_existing_fail,
            pain_frequency: self.pain_frequency as f32,
            market_size: self.market_size as f32,
            mvp_complexity: self.mvp_complexity as f32,
            competition_risk: self.competition_risk as f32,
            integration_complexity: self.integration_complexity as f32,
            total_score: self.total_score as f32,
            killer_risks: serde_json::from_str(&self.killer_risks)?,
            recommendation: self.recommendation,
        })
    }
}

fn parse_utc(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| MinerError::storage(format!("invalid date {raw:?}: {e}")))
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?")
        .take(count)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn seen_ids(&self, source: &str) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM posts WHERE source = ?")
            .bind(source)
            .fetch_all(&self.pool)
            .await
            .map_err(MinerError::storage)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_post(&self, fetched: &FetchedPost) -> Result<bool> {
        let post = &fetched.post;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO posts
                (id, source, source_id, title, body, url, platform_data, score,
                 num_comments, created_at, author, category, raw)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.source)
        .bind(&post.source_id)
        .bind(&post.title)
        .bind(&post.body)
        .bind(&post.url)
        .bind(post.platform_data.to_string())
        .bind(post.score)
        .bind(post.num_comments)
        .bind(post.created_at.to_rfc3339())
        .bind(&post.author)
        .bind(&post.category)
        .bind(post.raw.to_string())
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            for comment in &fetched.comments {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO comments
                        (post_id, source, source_comment_id, author, body, score, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&comment.post_id)
                .bind(&comment.source)
                .bind(&comment.source_comment_id)
                .bind(&comment.author)
                .bind(&comment.body)
                .bind(comment.score)
                .bind(comment.created_at.to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(MinerError::storage)?;
            }
        }
        Ok(inserted)
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {} FROM posts WHERE id = ?",
            POST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        row.map(PostRow::into_post).transpose()
    }

    async fn comments_for(&self, post_id: &str, limit: usize) -> Result<Vec<Comment>> {
        let rows = sqlx::query_as::<_, CommentRow>(
            "SELECT id, post_id, source, source_comment_id, author, body, score, created_at \
             FROM comments WHERE post_id = ? ORDER BY score DESC LIMIT ?",
        )
        .bind(post_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        rows.into_iter().map(CommentRow::into_comment).collect()
    }

    async fn unfiltered_posts(&self, limit: usize) -> Result<Vec<Post>> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {} FROM posts p \
             WHERE NOT EXISTS (SELECT 1 FROM filtered_posts f WHERE f.post_id = p.id) \
             ORDER BY p.created_at DESC LIMIT ?",
            POST_COLUMNS
                .split(", ")
                .map(|c| format!("p.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        rows.into_iter().map(PostRow::into_post).collect()
    }

    async fn count_posts(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await
            .map_err(MinerError::storage)?;
        Ok(count.0 as usize)
    }
}

#[async_trait]
impl FilterStore for SqliteStore {
    async fn upsert_filtered(&self, filtered: &FilteredPost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO filtered_posts
                (post_id, pain_score, matched_keywords, matched_patterns,
                 emotional_intensity, filter_reason)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(post_id) DO UPDATE SET
                pain_score = excluded.pain_score,
                matched_keywords = excluded.matched_keywords,
                matched_patterns = excluded.matched_patterns,
                emotional_intensity = excluded.emotional_intensity,
                filter_reason = excluded.filter_reason
            "#,
        )
        .bind(&filtered.post_id)
        .bind(filtered.pain_score as f64)
        .bind(serde_json::to_string(&filtered.matched_keywords)?)
        .bind(serde_json::to_string(&filtered.matched_patterns)?)
        .bind(filtered.emotional_intensity as f64)
        .bind(serde_json::to_string(&filtered.filter_reason)?)
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        Ok(())
    }

    async fn get_filtered(&self, post_id: &str) -> Result<Option<FilteredPost>> {
        let row = sqlx::query_as::<_, FilteredRow>(
            "SELECT post_id, pain_score, matched_keywords, matched_patterns, \
             emotional_intensity, filter_reason FROM filtered_posts WHERE post_id = ?",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        row.map(FilteredRow::into_filtered).transpose()
    }

    async fn filtered_pending_extraction(
        &self,
        limit: usize,
    ) -> Result<Vec<(Post, FilteredPost)>> {
        let post_ids: Vec<(String,)> = sqlx::query_as(
            "SELECT f.post_id FROM filtered_posts f \
             JOIN posts p ON p.id = f.post_id \
             WHERE f.extracted_at IS NULL \
             ORDER BY p.created_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        let mut pairs = Vec::with_capacity(post_ids.len());
        for (post_id,) in post_ids {
            let post = self.get_post(&post_id).await?;
            let filtered = self.get_filtered(&post_id).await?;
            if let (Some(post), Some(filtered)) = (post, filtered) {
                pairs.push((post, filtered));
            }
        }
        Ok(pairs)
    }

    async fn mark_extracted(&self, post_id: &str) -> Result<()> {
        sqlx::query("UPDATE filtered_posts SET extracted_at = ? WHERE post_id = ?")
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(MinerError::storage)?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn insert_events(&self, events: &[PainEvent]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let comments_used = event
                .evidence_sources
                .iter()
                .any(|s| *s == EvidenceSource::Comments);
            let result = sqlx::query(
                r#"
                INSERT INTO pain_events
                    (post_id, actor, context, problem, current_workaround, frequency,
                     emotional_signal, mentioned_tools, confidence, evidence_sources,
                     comments_used, pain_types, primary_pain_type, frequency_score,
                     post_title, post_category, post_pain_score)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.post_id)
            .bind(&event.actor)
            .bind(&event.context)
            .bind(&event.problem)
            .bind(&event.current_workaround)
            .bind(&event.frequency)
            .bind(&event.emotional_signal)
            .bind(serde_json::to_string(&event.mentioned_tools)?)
            .bind(event.confidence as f64)
            .bind(serde_json::to_string(&event.evidence_sources)?)
            .bind(comments_used)
            .bind(serde_json::to_string(&event.pain_types)?)
            .bind(event.primary_pain_type.map(|t| t.as_str().to_string()))
            .bind(event.frequency_score as i64)
            .bind(&event.post_title)
            .bind(&event.post_category)
            .bind(event.post_pain_score as f64)
            .execute(&self.pool)
            .await
            .map_err(MinerError::storage)?;
            ids.push(result.last_insert_rowid());
        }
        Ok(ids)
    }

    async fn events_without_embedding(
        &self,
        model: &str,
        limit: usize,
    ) -> Result<Vec<PainEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM pain_events e \
             WHERE NOT EXISTS (SELECT 1 FROM pain_embeddings emb \
                               WHERE emb.pain_event_id = e.id AND emb.model = ?) \
             ORDER BY e.id LIMIT ?",
            EVENT_COLUMNS
                .split(", ")
                .map(|c| format!("e.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(model)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn store_embedding(&self, event_id: i64, model: &str, vector: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pain_embeddings (pain_event_id, model, vector)
            VALUES (?, ?, ?)
            ON CONFLICT(pain_event_id) DO UPDATE SET
                model = excluded.model,
                vector = excluded.vector
            "#,
        )
        .bind(event_id)
        .bind(model)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        Ok(())
    }

    async fn embedded_events(
        &self,
        model: &str,
    ) -> Result<Vec<(PainEvent, String, Vec<f32>)>> {
        let event_columns = EVENT_COLUMNS
            .split(", ")
            .map(|c| format!("e.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows: Vec<(i64, String, Vec<u8>)> = sqlx::query_as(
            "SELECT e.id, p.source, emb.vector FROM pain_events e \
             JOIN pain_embeddings emb ON emb.pain_event_id = e.id AND emb.model = ? \
             JOIN posts p ON p.id = e.post_id \
             ORDER BY e.id",
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        let mut result = Vec::with_capacity(rows.len());
        for (event_id, source, blob) in rows {
            let row = sqlx::query_as::<_, EventRow>(&format!(
                "SELECT {} FROM pain_events e WHERE e.id = ?",
                event_columns
            ))
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .map_err(MinerError::storage)?;
            result.push((row.into_event()?, source, blob_to_vec(&blob)));
        }
        Ok(result)
    }

    async fn all_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let rows: Vec<(i64, Vec<u8>)> =
            sqlx::query_as("SELECT pain_event_id, vector FROM pain_embeddings ORDER BY pain_event_id")
                .fetch_all(&self.pool)
                .await
                .map_err(MinerError::storage)?;
        Ok(rows
            .into_iter()
            .map(|(id, blob)| (id, blob_to_vec(&blob)))
            .collect())
    }

    async fn events_by_ids(&self, ids: &[i64]) -> Result<Vec<PainEvent>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let query = format!(
            "SELECT {} FROM pain_events WHERE id IN ({}) ORDER BY id",
            EVENT_COLUMNS,
            placeholders(ids.len())
        );
        let mut q = sqlx::query_as::<_, EventRow>(&query);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(MinerError::storage)?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn posts_for_events(&self, ids: &[i64]) -> Result<Vec<Post>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let query = format!(
            "SELECT DISTINCT {} FROM posts p \
             JOIN pain_events e ON e.post_id = p.id WHERE e.id IN ({})",
            POST_COLUMNS
                .split(", ")
                .map(|c| format!("p.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders(ids.len())
        );
        let mut q = sqlx::query_as::<_, PostRow>(&query);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(MinerError::storage)?;
        rows.into_iter().map(PostRow::into_post).collect()
    }
}

#[async_trait]
impl ClusterStore for SqliteStore {
    async fn cluster_count(&self, source: &str) -> Result<usize> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM clusters WHERE source_type = ?")
                .bind(source)
                .fetch_one(&self.pool)
                .await
                .map_err(MinerError::storage)?;
        Ok(count.0 as usize)
    }

    async fn store_cluster(&self, cluster: &Cluster) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clusters
                (id, name, source_type, centroid_summary, common_pain, common_context,
                 example_events, coherence_score, pain_event_ids, size,
                 workflow_confidence, alignment_status, aligned_problem_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                source_type = excluded.source_type,
                centroid_summary = excluded.centroid_summary,
                common_pain = excluded.common_pain,
                common_context = excluded.common_context,
                example_events = excluded.example_events,
                coherence_score = excluded.coherence_score,
                pain_event_ids = excluded.pain_event_ids,
                size = excluded.size,
                workflow_confidence = excluded.workflow_confidence,
                alignment_status = excluded.alignment_status,
                aligned_problem_id = excluded.aligned_problem_id,
                created_at = excluded.created_at
            "#,
        )
        .bind(&cluster.id)
        .bind(&cluster.name)
        .bind(&cluster.source_type)
        .bind(&cluster.centroid_summary)
        .bind(&cluster.common_pain)
        .bind(&cluster.common_context)
        .bind(serde_json::to_string(&cluster.example_events)?)
        .bind(cluster.coherence_score as f64)
        .bind(serde_json::to_string(&cluster.pain_event_ids)?)
        .bind(cluster.size as i64)
        .bind(cluster.workflow_confidence as f64)
        .bind(cluster.alignment_status.as_str())
        .bind(&cluster.aligned_problem_id)
        .bind(cluster.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        Ok(())
    }

    async fn clear_clusters_for_source(&self, source: &str) -> Result<()> {
        sqlx::query("DELETE FROM clusters WHERE source_type = ?")
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(MinerError::storage)?;
        Ok(())
    }

    async fn get_cluster(&self, id: &str) -> Result<Option<Cluster>> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {} FROM clusters WHERE id = ?",
            CLUSTER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        row.map(ClusterRow::into_cluster).transpose()
    }

    async fn clusters(&self) -> Result<Vec<Cluster>> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {} FROM clusters ORDER BY created_at, id",
            CLUSTER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        rows.into_iter().map(ClusterRow::into_cluster).collect()
    }

    async fn clusters_with_status(
        &self,
        status: AlignmentStatus,
        min_size: usize,
    ) -> Result<Vec<Cluster>> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {} FROM clusters WHERE alignment_status = ? AND size >= ? \
             ORDER BY created_at, id",
            CLUSTER_COLUMNS
        ))
        .bind(status.as_str())
        .bind(min_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        rows.into_iter().map(ClusterRow::into_cluster).collect()
    }

    async fn set_alignment(
        &self,
        cluster_id: &str,
        status: AlignmentStatus,
        aligned_problem_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE clusters SET alignment_status = ?, aligned_problem_id = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(aligned_problem_id)
        .bind(cluster_id)
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        Ok(())
    }

    async fn store_aligned_problem(&self, problem: &AlignedProblem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO aligned_problems
                (id, sources, core_problem, why_they_look_different, evidence,
                 cluster_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                sources = excluded.sources,
                core_problem = excluded.core_problem,
                why_they_look_different = excluded.why_they_look_different,
                evidence = excluded.evidence,
                cluster_ids = excluded.cluster_ids
            "#,
        )
        .bind(&problem.id)
        .bind(serde_json::to_string(&problem.sources)?)
        .bind(&problem.core_problem)
        .bind(&problem.why_they_look_different)
        .bind(serde_json::to_string(&problem.evidence)?)
        .bind(serde_json::to_string(&problem.cluster_ids)?)
        .bind(problem.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        Ok(())
    }

    async fn aligned_problems(&self) -> Result<Vec<AlignedProblem>> {
        let rows = sqlx::query_as::<_, AlignedRow>(
            "SELECT id, sources, core_problem, why_they_look_different, evidence, \
             cluster_ids, created_at FROM aligned_problems ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        rows.into_iter().map(AlignedRow::into_problem).collect()
    }
}

#[async_trait]
impl OpportunityStore for SqliteStore {
    async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO opportunities
                (cluster_id, source_type, name, description, target_users, current_tools,
                 missing_capability, why_existing_fail, pain_frequency, market_size,
                 mvp_complexity, competition_risk, integration_complexity, total_score,
                 killer_risks, recommendation)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cluster_id) DO UPDATE SET
                source_type = excluded.source_type,
                name = excluded.name,
                description = excluded.description,
                target_users = excluded.target_users,
                current_tools = excluded.current_tools,
                missing_capability = excluded.missing_capability,
                why_existing_fail = excluded.why_existing_fail,
                pain_frequency = excluded.pain_frequency,
                market_size = excluded.market_size,
                mvp_complexity = excluded.mvp_complexity,
                competition_risk = excluded.competition_risk,
                integration_complexity = excluded.integration_complexity,
                total_score = excluded.total_score,
                killer_risks = excluded.killer_risks,
                recommendation = excluded.recommendation
            "#,
        )
        .bind(&opportunity.cluster_id)
        .bind(&opportunity.source_type)
        .bind(&opportunity.name)
        .bind(&opportunity.description)
        .bind(&opportunity.target_users)
        .bind(serde_json::to_string(&opportunity.current_tools)?)
        .bind(&opportunity.missing_capability)
        .bind(&opportunity.why_existing_fail)
        .bind(opportunity.pain_frequency as f64)
        .bind(opportunity.market_size as f64)
        .bind(opportunity.mvp_complexity as f64)
        .bind(opportunity.competition_risk as f64)
        .bind(opportunity.integration_complexity as f64)
        .bind(opportunity.total_score as f64)
        .bind(serde_json::to_string(&opportunity.killer_risks)?)
        .bind(&opportunity.recommendation)
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;

        let id: (i64,) = sqlx::query_as("SELECT id FROM opportunities WHERE cluster_id = ?")
            .bind(&opportunity.cluster_id)
            .fetch_one(&self.pool)
            .await
            .map_err(MinerError::storage)?;
        Ok(id.0)
    }

    async fn opportunities(&self, limit: usize) -> Result<Vec<Opportunity>> {
        let rows = sqlx::query_as::<_, OpportunityRow>(&format!(
            "SELECT {} FROM opportunities ORDER BY id DESC LIMIT ?",
            OPPORTUNITY_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        rows.into_iter()
            .map(OpportunityRow::into_opportunity)
            .collect()
    }

    async fn update_assessment(&self, opportunity: &Opportunity) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE opportunities SET
                pain_frequency = ?, market_size = ?, mvp_complexity = ?,
                competition_risk = ?, integration_complexity = ?,
                total_score = ?, killer_risks = ?, recommendation = ?
            WHERE cluster_id = ?
            "#,
        )
        .bind(opportunity.pain_frequency as f64)
        .bind(opportunity.market_size as f64)
        .bind(opportunity.mvp_complexity as f64)
        .bind(opportunity.competition_risk as f64)
        .bind(opportunity.integration_complexity as f64)
        .bind(opportunity.total_score as f64)
        .bind(serde_json::to_string(&opportunity.killer_risks)?)
        .bind(&opportunity.recommendation)
        .bind(&opportunity.cluster_id)
        .execute(&self.pool)
        .await
        .map_err(MinerError::storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn test_store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn post_insert_is_idempotent() {
        let store = test_store().await;
        let fetched = testing::fetched_post("reddit", "abc", 2);

        assert!(store.insert_post(&fetched).await.unwrap());
        assert!(!store.insert_post(&fetched).await.unwrap());
        assert_eq!(store.count_posts().await.unwrap(), 1);

        let seen = store.seen_ids("reddit").await.unwrap();
        assert!(seen.contains("reddit_abc"));

        let comments = store.comments_for("reddit_abc", 10).await.unwrap();
        assert_eq!(comments.len(), 2);
        // Highest score first
        assert!(comments[0].score >= comments[1].score);
    }

    #[tokio::test]
    async fn unfiltered_posts_excludes_examined_ones() {
        let store = test_store().await;
        store
            .insert_post(&testing::fetched_post("reddit", "a", 0))
            .await
            .unwrap();
        store
            .insert_post(&testing::fetched_post("reddit", "b", 0))
            .await
            .unwrap();

        store
            .upsert_filtered(&testing::filtered_post("reddit_a", 0.6))
            .await
            .unwrap();

        let pending = store.unfiltered_posts(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "reddit_b");
    }

    #[tokio::test]
    async fn extraction_marker_removes_post_from_queue() {
        let store = test_store().await;
        store
            .insert_post(&testing::fetched_post("reddit", "a", 0))
            .await
            .unwrap();
        store
            .upsert_filtered(&testing::filtered_post("reddit_a", 0.6))
            .await
            .unwrap();

        assert_eq!(store.filtered_pending_extraction(10).await.unwrap().len(), 1);
        store.mark_extracted("reddit_a").await.unwrap();
        assert!(store.filtered_pending_extraction(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embeddings_round_trip_and_model_change_requeues() {
        let store = test_store().await;
        store
            .insert_post(&testing::fetched_post("reddit", "a", 0))
            .await
            .unwrap();
        let ids = store
            .insert_events(&[testing::pain_event("reddit_a", "exports crash on big files")])
            .await
            .unwrap();
        let event_id = ids[0];

        assert_eq!(
            store.events_without_embedding("model-a", 10).await.unwrap().len(),
            1
        );
        store
            .store_embedding(event_id, "model-a", &[0.1, 0.2, 0.3])
            .await
            .unwrap();
        assert!(store
            .events_without_embedding("model-a", 10)
            .await
            .unwrap()
            .is_empty());

        // A model change requeues the event; storing replaces the row.
        assert_eq!(
            store.events_without_embedding("model-b", 10).await.unwrap().len(),
            1
        );
        store
            .store_embedding(event_id, "model-b", &[0.4, 0.5, 0.6])
            .await
            .unwrap();

        let all = store.all_embeddings().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!((all[0].1[0] - 0.4).abs() < 1e-6);

        let embedded = store.embedded_events("model-b").await.unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].1, "reddit");
    }

    #[tokio::test]
    async fn cluster_upsert_and_alignment_status() {
        let store = test_store().await;
        let cluster = testing::cluster("reddit_00", "reddit", &[1, 2, 3, 4]);
        store.store_cluster(&cluster).await.unwrap();
        assert_eq!(store.cluster_count("reddit").await.unwrap(), 1);

        store
            .set_alignment("reddit_00", AlignmentStatus::Aligned, Some("AP_01"))
            .await
            .unwrap();
        let reloaded = store.get_cluster("reddit_00").await.unwrap().unwrap();
        assert_eq!(reloaded.alignment_status, AlignmentStatus::Aligned);
        assert_eq!(reloaded.aligned_problem_id.as_deref(), Some("AP_01"));
        assert_eq!(reloaded.size, 4);
        assert_eq!(reloaded.pain_event_ids.len(), 4);

        let unprocessed = store
            .clusters_with_status(AlignmentStatus::Unprocessed, 3)
            .await
            .unwrap();
        assert!(unprocessed.is_empty());
    }

    #[tokio::test]
    async fn opportunity_rerun_overwrites_per_cluster() {
        let store = test_store().await;
        let mut opportunity = testing::opportunity("reddit_00", "Export Fixer");
        let first_id = store.upsert_opportunity(&opportunity).await.unwrap();

        opportunity.name = "Export Fixer v2".into();
        opportunity.total_score = 7.5;
        let second_id = store.upsert_opportunity(&opportunity).await.unwrap();
        assert_eq!(first_id, second_id);

        let all = store.opportunities(10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Export Fixer v2");

        let mut rescored = all[0].clone();
        rescored.total_score = 8.2;
        rescored.recommendation = "pursue".into();
        store.update_assessment(&rescored).await.unwrap();
        let all = store.opportunities(10).await.unwrap();
        assert!((all[0].total_score - 8.2).abs() < 1e-6);
        assert_eq!(all[0].recommendation, "pursue");
    }

    #[tokio::test]
    async fn aligned_problem_round_trips() {
        let store = test_store().await;
        let problem = testing::aligned_problem("AP_01", &["reddit", "hn_ask"]);
        store.store_aligned_problem(&problem).await.unwrap();

        let all = store.aligned_problems().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sources.len(), 2);
    }
}
