//! SQLite persistence for agent loops and their runs.

use {
    serde::{Deserialize, Serialize},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
};

use berth_common::{
    Error, Result, time,
    types::{LoopStatus, RunStatus, TriggerType},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoop {
    pub id: String,
    pub user_id: String,
    pub git_integration_id: String,
    pub sandbox_provider_id: String,
    pub repository_owner: String,
    pub repository_name: String,
    pub branch: String,
    pub plan_file_path: String,
    pub progress_file_path: Option<String>,
    pub model_provider_id: String,
    pub model_id: String,
    pub credential_id: Option<String>,
    pub automation_enabled: bool,
    pub max_runs: i64,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub status: LoopStatus,
    pub prompt: Option<String>,
    pub last_run_id: Option<String>,
    pub last_run_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopRun {
    pub id: String,
    pub loop_id: String,
    pub run_number: i64,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub model_provider_id: String,
    pub model_id: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub sandbox_id: Option<String>,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AgentLoopRun {
    /// A run is stalled when it has been in flight longer than the stall
    /// threshold.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        if !self.status.is_in_flight() {
            return false;
        }
        let Some(started) = self.started_at.as_deref().and_then(time::parse_rfc3339) else {
            return false;
        };
        time::now() - started > chrono::Duration::minutes(berth_protocol::RUN_STALL_MINUTES)
    }
}

const LOOP_COLUMNS: &str = "id, user_id, git_integration_id, sandbox_provider_id, \
     repository_owner, repository_name, branch, plan_file_path, progress_file_path, \
     model_provider_id, model_id, credential_id, automation_enabled, max_runs, total_runs, \
     successful_runs, failed_runs, status, prompt, last_run_id, last_run_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, loop_id, run_number, status, trigger_type, model_provider_id, \
     model_id, started_at, completed_at, duration_seconds, sandbox_id, commit_sha, \
     commit_message, error_message, created_at, updated_at";

pub(crate) fn row_to_loop(row: &SqliteRow) -> Result<AgentLoop> {
    let status: String = row.get("status");
    Ok(AgentLoop {
        id: row.get("id"),
        user_id: row.get("user_id"),
        git_integration_id: row.get("git_integration_id"),
        sandbox_provider_id: row.get("sandbox_provider_id"),
        repository_owner: row.get("repository_owner"),
        repository_name: row.get("repository_name"),
        branch: row.get("branch"),
        plan_file_path: row.get("plan_file_path"),
        progress_file_path: row.get("progress_file_path"),
        model_provider_id: row.get("model_provider_id"),
        model_id: row.get("model_id"),
        credential_id: row.get("credential_id"),
        automation_enabled: row.get("automation_enabled"),
        max_runs: row.get("max_runs"),
        total_runs: row.get("total_runs"),
        successful_runs: row.get("successful_runs"),
        failed_runs: row.get("failed_runs"),
        status: LoopStatus::parse(&status).ok_or_else(|| Error::internal("malformed loop status"))?,
        prompt: row.get("prompt"),
        last_run_id: row.get("last_run_id"),
        last_run_at: row.get("last_run_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn row_to_run(row: &SqliteRow) -> Result<AgentLoopRun> {
    let status: String = row.get("status");
    let trigger: String = row.get("trigger_type");
    Ok(AgentLoopRun {
        id: row.get("id"),
        loop_id: row.get("loop_id"),
        run_number: row.get("run_number"),
        status: RunStatus::parse(&status).ok_or_else(|| Error::internal("malformed run status"))?,
        trigger_type: if trigger == "automated" {
            TriggerType::Automated
        } else {
            TriggerType::Manual
        },
        model_provider_id: row.get("model_provider_id"),
        model_id: row.get("model_id"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration_seconds: row.get("duration_seconds"),
        sandbox_id: row.get("sandbox_id"),
        commit_sha: row.get("commit_sha"),
        commit_message: row.get("commit_message"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub struct LoopStore {
    pool: SqlitePool,
}

impl LoopStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_loops (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                git_integration_id TEXT NOT NULL,
                sandbox_provider_id TEXT NOT NULL,
                repository_owner TEXT NOT NULL,
                repository_name TEXT NOT NULL,
                branch TEXT NOT NULL,
                plan_file_path TEXT NOT NULL,
                progress_file_path TEXT,
                model_provider_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                credential_id TEXT,
                automation_enabled INTEGER NOT NULL DEFAULT 0,
                max_runs INTEGER NOT NULL,
                total_runs INTEGER NOT NULL DEFAULT 0,
                successful_runs INTEGER NOT NULL DEFAULT 0,
                failed_runs INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                prompt TEXT,
                last_run_id TEXT,
                last_run_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_loop_runs (
                id TEXT PRIMARY KEY,
                loop_id TEXT NOT NULL,
                run_number INTEGER NOT NULL,
                status TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                model_provider_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration_seconds INTEGER,
                sandbox_id TEXT,
                commit_sha TEXT,
                commit_message TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (loop_id, run_number)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::other)?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<AgentLoop>> {
        let row = sqlx::query(&format!("SELECT {LOOP_COLUMNS} FROM agent_loops WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::other)?;
        row.as_ref().map(row_to_loop).transpose()
    }

    pub async fn get_owned(&self, id: &str, user_id: &str) -> Result<AgentLoop> {
        let lp = self
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("loop not found"))?;
        if lp.user_id != user_id {
            return Err(Error::not_found("loop not found"));
        }
        Ok(lp)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<AgentLoop>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOOP_COLUMNS} FROM agent_loops
             WHERE user_id = ? AND status != 'archived' ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::other)?;
        rows.iter().map(row_to_loop).collect()
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<AgentLoopRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM agent_loop_runs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::other)?;
        row.as_ref().map(row_to_run).transpose()
    }

    pub async fn runs_for_loop(&self, loop_id: &str) -> Result<Vec<AgentLoopRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM agent_loop_runs WHERE loop_id = ? ORDER BY run_number"
        ))
        .bind(loop_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::other)?;
        rows.iter().map(row_to_run).collect()
    }

    pub(crate) const fn loop_columns() -> &'static str {
        LOOP_COLUMNS
    }

    pub(crate) const fn run_columns() -> &'static str {
        RUN_COLUMNS
    }
}
