//! The run scheduler.
//!
//! Guarantees, in order of importance:
//! 1. No zombie `pending` rows: a dispatch that is not acknowledged deletes
//!    the row and restores the loop's counters.
//! 2. At most one in-flight run per loop, enforced under a transaction.
//! 3. Counters and loop status reflect observable reality after every
//!    acknowledged callback, and re-delivered callbacks change nothing.

use std::{collections::HashMap, sync::Arc};

use {
    secrecy::ExposeSecret,
    serde::Deserialize,
    sqlx::{Row, SqliteConnection},
    tokio::sync::broadcast,
    tracing::{info, warn},
};

use berth_common::{
    Error, Result,
    ids::new_id,
    time,
    types::{LoopStatus, Plan, RunStatus, TriggerType},
};
use berth_compute::{ProviderRegistry, RunDescriptor};
use berth_metering::RunQuotaStore;
use berth_protocol::{ControlEvent, RunStatusEvent};
use berth_vault::CredentialStore;

use crate::store::{AgentLoop, AgentLoopRun, LoopStore, row_to_loop};

const MAX_RUNS_CEILING: i64 = 20;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Where the sandbox executor reports completion.
    pub callback_url: String,
    pub callback_secret: String,
    /// Monthly run grants per plan.
    pub monthly_runs: HashMap<Plan, i64>,
}

impl SchedulerConfig {
    fn grant(&self, plan: Plan) -> i64 {
        self.monthly_runs.get(&plan).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewLoopParams {
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
    pub prompt: Option<String>,
}

/// Body of the executor's completion callback.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackParams {
    pub run_id: String,
    pub success: bool,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub is_list_complete: bool,
}

enum DispatchFailure {
    /// The run never effectively existed; delete it and restore counters.
    DeleteRow,
    /// Chained runs stay on the books as failed.
    MarkFailed,
}

pub struct Scheduler {
    store: Arc<LoopStore>,
    quotas: Arc<RunQuotaStore>,
    vault: Arc<CredentialStore>,
    registry: Arc<ProviderRegistry>,
    events: broadcast::Sender<ControlEvent>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        store: Arc<LoopStore>,
        quotas: Arc<RunQuotaStore>,
        vault: Arc<CredentialStore>,
        registry: Arc<ProviderRegistry>,
        events: broadcast::Sender<ControlEvent>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            quotas,
            vault,
            registry,
            events,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LoopStore> {
        &self.store
    }

    fn emit_run(&self, lp: &AgentLoop, run: &AgentLoopRun) {
        let _ = self.events.send(ControlEvent::RunStatus(RunStatusEvent {
            loop_id: lp.id.clone(),
            run_id: run.id.clone(),
            run_number: run.run_number,
            status: run.status,
            user_id: lp.user_id.clone(),
            updated_at: time::now_rfc3339(),
        }));
    }

    // ── Loop CRUD ────────────────────────────────────────────────────────

    /// Create a loop. Does not dispatch anything.
    pub async fn create_loop(
        &self,
        user_id: &str,
        plan: Plan,
        params: NewLoopParams,
    ) -> Result<AgentLoop> {
        if params.max_runs < 1 || params.max_runs > MAX_RUNS_CEILING {
            return Err(Error::bad_request(format!(
                "max_runs must be between 1 and {MAX_RUNS_CEILING}"
            )));
        }

        let quota = self
            .quotas
            .ensure(user_id, plan, self.config.grant(plan))
            .await?;
        if quota.available() < params.max_runs {
            return Err(Error::quota_exceeded(
                "monthly run quota does not cover max_runs",
            ));
        }

        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO agent_loops
                 (id, user_id, git_integration_id, sandbox_provider_id, repository_owner,
                  repository_name, branch, plan_file_path, progress_file_path,
                  model_provider_id, model_id, credential_id, automation_enabled, max_runs,
                  total_runs, successful_runs, failed_runs, status, prompt, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 'active', ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&params.git_integration_id)
        .bind(&params.sandbox_provider_id)
        .bind(&params.repository_owner)
        .bind(&params.repository_name)
        .bind(&params.branch)
        .bind(&params.plan_file_path)
        .bind(&params.progress_file_path)
        .bind(&params.model_provider_id)
        .bind(&params.model_id)
        .bind(&params.credential_id)
        .bind(params.automation_enabled)
        .bind(params.max_runs)
        .bind(&params.prompt)
        .bind(&now)
        .bind(&now)
        .execute(self.store.pool())
        .await
        .map_err(Error::other)?;

        info!(loop_id = %id, user_id, "agent loop created");
        self.store
            .get(&id)
            .await?
            .ok_or_else(|| Error::internal("loop vanished after insert"))
    }

    pub async fn pause_loop(&self, loop_id: &str, user_id: &str) -> Result<()> {
        let lp = self.store.get_owned(loop_id, user_id).await?;
        if lp.status != LoopStatus::Active {
            return Err(Error::bad_request("only active loops can be paused"));
        }
        self.set_loop_status(loop_id, LoopStatus::Paused).await
    }

    pub async fn resume_loop(&self, loop_id: &str, user_id: &str) -> Result<()> {
        let lp = self.store.get_owned(loop_id, user_id).await?;
        if lp.status != LoopStatus::Paused {
            return Err(Error::bad_request("only paused loops can be resumed"));
        }
        self.set_loop_status(loop_id, LoopStatus::Active).await
    }

    pub async fn complete_loop(&self, loop_id: &str, user_id: &str) -> Result<()> {
        let lp = self.store.get_owned(loop_id, user_id).await?;
        if lp.status == LoopStatus::Archived {
            return Err(Error::bad_request("loop is archived"));
        }
        self.set_loop_status(loop_id, LoopStatus::Completed).await
    }

    /// Archive the loop, cancelling any pending runs.
    pub async fn archive_loop(&self, loop_id: &str, user_id: &str) -> Result<()> {
        self.store.get_owned(loop_id, user_id).await?;

        let mut tx = self.store.pool().begin().await.map_err(Error::other)?;
        sqlx::query("UPDATE agent_loops SET status = 'archived', updated_at = ? WHERE id = ?")
            .bind(time::now_rfc3339())
            .bind(loop_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::other)?;
        sqlx::query(
            "UPDATE agent_loop_runs SET status = 'cancelled', updated_at = ?
             WHERE loop_id = ? AND status = 'pending'",
        )
        .bind(time::now_rfc3339())
        .bind(loop_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;
        tx.commit().await.map_err(Error::other)?;

        info!(loop_id, "agent loop archived");
        Ok(())
    }

    /// Delete the loop and all of its runs.
    pub async fn delete_loop(&self, loop_id: &str, user_id: &str) -> Result<()> {
        self.store.get_owned(loop_id, user_id).await?;

        let mut tx = self.store.pool().begin().await.map_err(Error::other)?;
        sqlx::query("DELETE FROM agent_loop_runs WHERE loop_id = ?")
            .bind(loop_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::other)?;
        sqlx::query("DELETE FROM agent_loops WHERE id = ?")
            .bind(loop_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::other)?;
        tx.commit().await.map_err(Error::other)?;
        Ok(())
    }

    async fn set_loop_status(&self, loop_id: &str, status: LoopStatus) -> Result<()> {
        sqlx::query("UPDATE agent_loops SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(time::now_rfc3339())
            .bind(loop_id)
            .execute(self.store.pool())
            .await
            .map_err(Error::other)?;
        Ok(())
    }

    // ── Start run ────────────────────────────────────────────────────────

    /// Manually start the next run of a loop.
    pub async fn start_run(
        &self,
        loop_id: &str,
        user_id: &str,
        plan: Plan,
    ) -> Result<AgentLoopRun> {
        let lp = self.store.get_owned(loop_id, user_id).await?;
        if lp.status != LoopStatus::Active {
            return Err(Error::bad_request("loop is not active"));
        }
        if lp.total_runs >= lp.max_runs {
            return Err(Error::bad_request("loop has reached its run limit"));
        }

        let quota = self
            .quotas
            .ensure(user_id, plan, self.config.grant(plan))
            .await?;
        let has_quota = quota.available() >= 1;

        // Resolve the credential (and refresh OAuth) before any run row
        // exists; a failure here must leave no trace.
        let token = if has_quota {
            self.resolve_model_token(&lp, lp.credential_id.as_deref(), true)
                .await?
        } else {
            None
        };

        // Short transaction under the loop row.
        let mut tx = self.store.pool().begin().await.map_err(Error::other)?;
        let locked = Self::lock_loop(&mut tx, loop_id).await?;
        if locked.status != LoopStatus::Active {
            return Err(Error::bad_request("loop is not active"));
        }
        if locked.total_runs >= locked.max_runs {
            return Err(Error::bad_request("loop has reached its run limit"));
        }
        if Self::in_flight_count(&mut tx, loop_id).await? > 0 {
            return Err(Error::conflict("a run is already in flight"));
        }

        let run_number = locked.total_runs + 1;
        if !has_quota {
            // Monthly quota exhausted: the loop parks a halted run for later
            // top-up instead of erroring.
            let run = Self::insert_run(
                &mut tx,
                loop_id,
                run_number,
                RunStatus::Halted,
                TriggerType::Automated,
                &locked.model_provider_id,
                &locked.model_id,
            )
            .await?;
            tx.commit().await.map_err(Error::other)?;
            info!(loop_id, run_id = %run.id, "run halted on exhausted quota");
            self.emit_run(&locked, &run);
            return Ok(run);
        }

        let run = Self::insert_run(
            &mut tx,
            loop_id,
            run_number,
            RunStatus::Pending,
            TriggerType::Manual,
            &locked.model_provider_id,
            &locked.model_id,
        )
        .await?;
        tx.commit().await.map_err(Error::other)?;

        // External dispatch strictly after commit.
        self.dispatch(&locked, run, token, DispatchFailure::DeleteRow)
            .await
    }

    /// Restart a halted or stalled run through the normal dispatch path.
    pub async fn restart_run(
        &self,
        run_id: &str,
        user_id: &str,
        plan: Plan,
    ) -> Result<AgentLoopRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::not_found("run not found"))?;
        let lp = self.store.get_owned(&run.loop_id, user_id).await?;

        if run.status != RunStatus::Halted && !run.is_stalled() {
            return Err(Error::bad_request(
                "only halted or stalled runs can be restarted",
            ));
        }

        if run.status == RunStatus::Halted {
            let quota = self
                .quotas
                .ensure(user_id, plan, self.config.grant(plan))
                .await?;
            if quota.available() < 1 {
                return Err(Error::quota_exceeded("monthly run quota exhausted"));
            }
        }

        let token = self
            .resolve_model_token(&lp, lp.credential_id.as_deref(), true)
            .await?;

        let descriptor = self.descriptor(&lp, &run, token).await?;
        let backend = self
            .registry
            .backend(&lp.sandbox_provider_id)
            .await
            .map_err(Error::from)?;
        let ack = backend.start_sandbox_run(&descriptor).await;

        match ack {
            Ok(ack) if ack.acknowledged => {
                self.promote_to_running(&run.id, ack.sandbox_id.as_deref())
                    .await?;
                self.quotas.debit_run(&lp.user_id).await?;
                let run = self
                    .store
                    .get_run(&run.id)
                    .await?
                    .ok_or_else(|| Error::internal("run vanished"))?;
                self.emit_run(&lp, &run);
                Ok(run)
            },
            Ok(_) => Err(Error::upstream("sandbox dispatch not acknowledged")),
            Err(e) => Err(Error::from(e)),
        }
    }

    // ── Callback processing ──────────────────────────────────────────────

    /// Apply the executor's completion report. Safe to re-deliver.
    pub async fn process_callback(&self, params: CallbackParams) -> Result<()> {
        let run = self
            .store
            .get_run(&params.run_id)
            .await?
            .ok_or_else(|| Error::not_found("run not found"))?;
        if !run.status.is_in_flight() {
            // Duplicate delivery; the first application already settled it.
            return Ok(());
        }
        let lp = self
            .store
            .get(&run.loop_id)
            .await?
            .ok_or_else(|| Error::not_found("loop not found"))?;

        let now = time::now();
        let duration_seconds = run
            .started_at
            .as_deref()
            .and_then(time::parse_rfc3339)
            .map(|started| (now - started).num_seconds().max(0));

        if !params.success {
            self.settle_run(
                &run.id,
                RunStatus::Failed,
                duration_seconds,
                params.sandbox_id.as_deref().or(run.sandbox_id.as_deref()),
                None,
                None,
                params.error.as_deref(),
            )
            .await?;
            sqlx::query(
                "UPDATE agent_loops SET failed_runs = failed_runs + 1, updated_at = ? WHERE id = ?",
            )
            .bind(time::now_rfc3339())
            .bind(&lp.id)
            .execute(self.store.pool())
            .await
            .map_err(Error::other)?;

            let run = self.reload_run(&run.id).await?;
            self.emit_run(&lp, &run);
            info!(run_id = %run.id, "run failed");
            return Ok(());
        }

        self.settle_run(
            &run.id,
            RunStatus::Completed,
            duration_seconds,
            params.sandbox_id.as_deref().or(run.sandbox_id.as_deref()),
            params.commit_sha.as_deref(),
            params.commit_message.as_deref(),
            None,
        )
        .await?;

        if params.is_list_complete {
            // The plan file has no unchecked items left; the loop is done
            // even if runs remain.
            self.set_loop_status(&lp.id, LoopStatus::Completed).await?;
            let run = self.reload_run(&run.id).await?;
            self.emit_run(&lp, &run);
            info!(loop_id = %lp.id, "loop completed: list complete");
            return Ok(());
        }

        sqlx::query(
            "UPDATE agent_loops SET successful_runs = successful_runs + 1, updated_at = ? WHERE id = ?",
        )
        .bind(time::now_rfc3339())
        .bind(&lp.id)
        .execute(self.store.pool())
        .await
        .map_err(Error::other)?;

        let mut loop_completed = false;
        if run.run_number >= lp.max_runs {
            self.set_loop_status(&lp.id, LoopStatus::Completed).await?;
            loop_completed = true;
            info!(loop_id = %lp.id, "loop completed: run limit reached");
        }

        let settled = self.reload_run(&run.id).await?;
        self.emit_run(&lp, &settled);

        if lp.automation_enabled && !loop_completed {
            self.chain_next(&lp, &run).await;
        }
        Ok(())
    }

    /// Create and dispatch the automated follow-up run. All failures settle
    /// into run rows; nothing propagates to the callback response.
    async fn chain_next(&self, lp: &AgentLoop, prev: &AgentLoopRun) {
        if let Err(e) = self.try_chain_next(lp, prev).await {
            warn!(loop_id = %lp.id, error = %e, "automation chain failed");
        }
    }

    async fn try_chain_next(&self, lp: &AgentLoop, prev: &AgentLoopRun) -> Result<()> {
        let available = self.quotas.available(&lp.user_id).await?;

        let mut tx = self.store.pool().begin().await.map_err(Error::other)?;
        let locked = Self::lock_loop(&mut tx, &lp.id).await?;
        if locked.status != LoopStatus::Active || locked.total_runs >= locked.max_runs {
            return Ok(());
        }
        if Self::in_flight_count(&mut tx, &lp.id).await? > 0 {
            return Ok(());
        }

        let run_number = prev.run_number + 1;
        let status = if available >= 1 {
            RunStatus::Pending
        } else {
            RunStatus::Halted
        };
        let run = Self::insert_run(
            &mut tx,
            &lp.id,
            run_number,
            status,
            TriggerType::Automated,
            &locked.model_provider_id,
            &locked.model_id,
        )
        .await?;
        tx.commit().await.map_err(Error::other)?;
        self.emit_run(&lp, &run);

        if status == RunStatus::Halted {
            info!(loop_id = %lp.id, run_id = %run.id, "chained run halted on exhausted quota");
            return Ok(());
        }

        // Automated runs use the credential bound to the loop; there is no
        // interactive fallback.
        let token = match self.resolve_model_token(lp, lp.credential_id.as_deref(), false).await {
            Ok(token) => token,
            Err(e) => {
                self.fail_run(lp, &run, &format!("credential unavailable: {e}"))
                    .await?;
                return Ok(());
            },
        };

        if let Err(e) = self
            .dispatch(&locked, run.clone(), token, DispatchFailure::MarkFailed)
            .await
        {
            warn!(loop_id = %lp.id, run_id = %run.id, error = %e, "chained dispatch failed");
        }
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    async fn dispatch(
        &self,
        lp: &AgentLoop,
        run: AgentLoopRun,
        token: Option<String>,
        on_failure: DispatchFailure,
    ) -> Result<AgentLoopRun> {
        let outcome = async {
            let descriptor = self.descriptor(lp, &run, token).await?;
            let backend = self
                .registry
                .backend(&lp.sandbox_provider_id)
                .await
                .map_err(Error::from)?;
            let ack = backend.start_sandbox_run(&descriptor).await.map_err(Error::from)?;
            if !ack.acknowledged {
                return Err(Error::upstream("sandbox dispatch not acknowledged"));
            }
            Ok(ack)
        }
        .await;

        match outcome {
            Ok(ack) => {
                self.promote_to_running(&run.id, ack.sandbox_id.as_deref())
                    .await?;
                self.quotas.debit_run(&lp.user_id).await?;
                let run = self.reload_run(&run.id).await?;
                info!(run_id = %run.id, run_number = run.run_number, "run dispatched");
                self.emit_run(lp, &run);
                Ok(run)
            },
            Err(e) => {
                match on_failure {
                    DispatchFailure::DeleteRow => {
                        self.erase_run(&lp.id, &run.id).await?;
                        info!(run_id = %run.id, "unacknowledged dispatch, run erased");
                    },
                    DispatchFailure::MarkFailed => {
                        self.fail_run(lp, &run, &format!("dispatch failed: {e}"))
                            .await?;
                    },
                }
                Err(e)
            },
        }
    }

    async fn descriptor(
        &self,
        lp: &AgentLoop,
        run: &AgentLoopRun,
        token: Option<String>,
    ) -> Result<RunDescriptor> {
        let provider_name = self
            .vault
            .provider_name(&lp.model_provider_id)
            .await
            .map_err(Error::from)?;
        Ok(RunDescriptor {
            run_id: run.id.clone(),
            loop_id: lp.id.clone(),
            repository_owner: lp.repository_owner.clone(),
            repository_name: lp.repository_name.clone(),
            branch: lp.branch.clone(),
            plan_file_path: lp.plan_file_path.clone(),
            progress_file_path: lp.progress_file_path.clone(),
            model_provider: provider_name,
            model_id: lp.model_id.clone(),
            model_token: token,
            prompt: lp.prompt.clone(),
            callback_url: self.config.callback_url.clone(),
            callback_secret: self.config.callback_secret.clone(),
        })
    }

    /// Resolve the model token for a run. Free models need none. When
    /// `allow_fallback` is set and the loop has no bound credential, the
    /// user's active credential for the provider is used instead.
    async fn resolve_model_token(
        &self,
        lp: &AgentLoop,
        credential_id: Option<&str>,
        allow_fallback: bool,
    ) -> Result<Option<String>> {
        let is_free = self
            .vault
            .model_is_free(&lp.model_provider_id, &lp.model_id)
            .await
            .map_err(Error::from)?;
        if is_free {
            return Ok(None);
        }

        let credential_id = match credential_id {
            Some(id) => id.to_string(),
            None if allow_fallback => self
                .vault
                .find_active(&lp.user_id, &lp.model_provider_id)
                .await
                .map_err(Error::from)?
                .ok_or_else(|| Error::bad_request("credential required for this model"))?,
            None => return Err(Error::bad_request("credential required for this model")),
        };

        let credential = self
            .vault
            .credential_for_run(&credential_id, &lp.user_id)
            .await
            .map_err(Error::from)?;
        Ok(Some(credential.token.expose_secret().clone()))
    }

    // ── Row helpers ──────────────────────────────────────────────────────

    async fn lock_loop(tx: &mut SqliteConnection, loop_id: &str) -> Result<AgentLoop> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM agent_loops WHERE id = ?",
            LoopStore::loop_columns()
        ))
        .bind(loop_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::other)?
        .ok_or_else(|| Error::not_found("loop not found"))?;
        row_to_loop(&row)
    }

    async fn in_flight_count(tx: &mut SqliteConnection, loop_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM agent_loop_runs
             WHERE loop_id = ? AND status IN ('pending', 'running')",
        )
        .bind(loop_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::other)?;
        Ok(row.get("n"))
    }

    async fn insert_run(
        tx: &mut SqliteConnection,
        loop_id: &str,
        run_number: i64,
        status: RunStatus,
        trigger: TriggerType,
        model_provider_id: &str,
        model_id: &str,
    ) -> Result<AgentLoopRun> {
        let id = new_id();
        let now = time::now_rfc3339();
        sqlx::query(
            "INSERT INTO agent_loop_runs
                 (id, loop_id, run_number, status, trigger_type, model_provider_id, model_id,
                  created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(loop_id)
        .bind(run_number)
        .bind(status.as_str())
        .bind(trigger.as_str())
        .bind(model_provider_id)
        .bind(model_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;

        sqlx::query(
            "UPDATE agent_loops
             SET total_runs = total_runs + 1, last_run_id = ?, last_run_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&id)
        .bind(&now)
        .bind(&now)
        .bind(loop_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;

        Ok(AgentLoopRun {
            id,
            loop_id: loop_id.to_string(),
            run_number,
            status,
            trigger_type: trigger,
            model_provider_id: model_provider_id.to_string(),
            model_id: model_id.to_string(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            sandbox_id: None,
            commit_sha: None,
            commit_message: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Remove an unacknowledged run as if it never existed.
    async fn erase_run(&self, loop_id: &str, run_id: &str) -> Result<()> {
        let mut tx = self.store.pool().begin().await.map_err(Error::other)?;
        sqlx::query("DELETE FROM agent_loop_runs WHERE id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::other)?;

        let prev = sqlx::query(
            "SELECT id, created_at FROM agent_loop_runs
             WHERE loop_id = ? ORDER BY run_number DESC LIMIT 1",
        )
        .bind(loop_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::other)?;
        let (last_run_id, last_run_at) = prev
            .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("created_at")))
            .map_or((None, None), |(id, at)| (Some(id), Some(at)));

        sqlx::query(
            "UPDATE agent_loops
             SET total_runs = total_runs - 1, last_run_id = ?, last_run_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(last_run_id)
        .bind(last_run_at)
        .bind(time::now_rfc3339())
        .bind(loop_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::other)?;
        tx.commit().await.map_err(Error::other)?;
        Ok(())
    }

    async fn promote_to_running(&self, run_id: &str, sandbox_id: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE agent_loop_runs
             SET status = 'running', sandbox_id = ?, started_at = ?, error_message = NULL,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(sandbox_id)
        .bind(time::now_rfc3339())
        .bind(time::now_rfc3339())
        .bind(run_id)
        .execute(self.store.pool())
        .await
        .map_err(Error::other)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_run(
        &self,
        run_id: &str,
        status: RunStatus,
        duration_seconds: Option<i64>,
        sandbox_id: Option<&str>,
        commit_sha: Option<&str>,
        commit_message: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agent_loop_runs
             SET status = ?, completed_at = ?, duration_seconds = ?, sandbox_id = ?,
                 commit_sha = ?, commit_message = ?, error_message = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(time::now_rfc3339())
        .bind(duration_seconds)
        .bind(sandbox_id)
        .bind(commit_sha)
        .bind(commit_message)
        .bind(error_message)
        .bind(time::now_rfc3339())
        .bind(run_id)
        .execute(self.store.pool())
        .await
        .map_err(Error::other)?;
        Ok(())
    }

    /// Mark a chained run failed and account for it.
    async fn fail_run(&self, lp: &AgentLoop, run: &AgentLoopRun, message: &str) -> Result<()> {
        self.settle_run(
            &run.id,
            RunStatus::Failed,
            None,
            run.sandbox_id.as_deref(),
            None,
            None,
            Some(message),
        )
        .await?;
        sqlx::query(
            "UPDATE agent_loops SET failed_runs = failed_runs + 1, updated_at = ? WHERE id = ?",
        )
        .bind(time::now_rfc3339())
        .bind(&lp.id)
        .execute(self.store.pool())
        .await
        .map_err(Error::other)?;

        let run = self.reload_run(&run.id).await?;
        self.emit_run(lp, &run);
        Ok(())
    }

    async fn reload_run(&self, run_id: &str) -> Result<AgentLoopRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::internal("run vanished"))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use {
        axum::{Json, Router, routing::post},
        berth_compute::{BackendSettings, CatalogStore},
        berth_vault::derive_process_key,
        sqlx::SqlitePool,
    };

    struct Harness {
        scheduler: Scheduler,
        vault: Arc<CredentialStore>,
        quotas: Arc<RunQuotaStore>,
        sandbox_provider_id: String,
        model_provider_id: String,
        /// Toggles the mock executor between ack and non-ack.
        acknowledge: Arc<AtomicBool>,
        dispatches: Arc<AtomicU32>,
    }

    async fn harness() -> Harness {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();

        let acknowledge = Arc::new(AtomicBool::new(true));
        let dispatches = Arc::new(AtomicU32::new(0));
        let ack_flag = Arc::clone(&acknowledge);
        let dispatch_count = Arc::clone(&dispatches);
        let app = Router::new().route(
            "/dispatch",
            post(move |Json(_body): Json<serde_json::Value>| {
                let ack_flag = Arc::clone(&ack_flag);
                let dispatch_count = Arc::clone(&dispatch_count);
                async move {
                    dispatch_count.fetch_add(1, Ordering::SeqCst);
                    if ack_flag.load(Ordering::SeqCst) {
                        Json(serde_json::json!({"acknowledged": true, "sandbox_id": "sbx-1"}))
                    } else {
                        Json(serde_json::json!({"acknowledged": false}))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = Arc::new(LoopStore::new(pool.clone()).await.unwrap());
        let quotas = Arc::new(RunQuotaStore::new(pool.clone()).await.unwrap());
        let vault = Arc::new(
            CredentialStore::new(
                pool.clone(),
                derive_process_key("test"),
                HashMap::new(),
            )
            .await
            .unwrap(),
        );
        let model_provider_id = vault.upsert_provider("anthropic").await.unwrap();
        vault
            .upsert_model(&model_provider_id, "claude-free", "Claude Free", true)
            .await
            .unwrap();
        vault
            .upsert_model(&model_provider_id, "claude-pro", "Claude Pro", false)
            .await
            .unwrap();

        let catalog = Arc::new(CatalogStore::new(pool.clone()).await.unwrap());
        let sandbox_provider_id = catalog.add_provider("modal", true).await.unwrap();
        let registry = Arc::new(ProviderRegistry::new(catalog, BackendSettings {
            sandbox_dispatch_url: format!("http://{addr}/dispatch"),
            sandbox_api_token: "token".into(),
            ..Default::default()
        }));

        let (events, _) = broadcast::channel(64);
        let scheduler = Scheduler::new(
            store,
            Arc::clone(&quotas),
            Arc::clone(&vault),
            registry,
            events,
            SchedulerConfig {
                callback_url: "http://control-plane/trpc/agentLoop.handleWebhook".into(),
                callback_secret: "cb-secret".into(),
                monthly_runs: HashMap::from([(Plan::Free, 30), (Plan::Pro, 500)]),
            },
        );

        Harness {
            scheduler,
            vault,
            quotas,
            sandbox_provider_id,
            model_provider_id,
            acknowledge,
            dispatches,
        }
    }

    fn loop_params(h: &Harness, max_runs: i64, automation: bool) -> NewLoopParams {
        NewLoopParams {
            git_integration_id: "git-1".into(),
            sandbox_provider_id: h.sandbox_provider_id.clone(),
            repository_owner: "acme".into(),
            repository_name: "app".into(),
            branch: "main".into(),
            plan_file_path: "PLAN.md".into(),
            progress_file_path: None,
            model_provider_id: h.model_provider_id.clone(),
            model_id: "claude-free".into(),
            credential_id: None,
            automation_enabled: automation,
            max_runs,
            prompt: None,
        }
    }

    fn callback(run_id: &str, success: bool) -> CallbackParams {
        CallbackParams {
            run_id: run_id.into(),
            success,
            sandbox_id: Some("sbx-1".into()),
            commit_sha: success.then(|| "abc123".into()),
            commit_message: success.then(|| "apply plan step".into()),
            error: (!success).then(|| "tests failed".into()),
            is_list_complete: false,
        }
    }

    async fn assert_invariants(h: &Harness, loop_id: &str) {
        let lp = h.scheduler.store().get(loop_id).await.unwrap().unwrap();
        let runs = h.scheduler.store().runs_for_loop(loop_id).await.unwrap();
        assert_eq!(lp.total_runs, runs.len() as i64, "total_runs matches rows");
        for (i, run) in runs.iter().enumerate() {
            assert_eq!(run.run_number, i as i64 + 1, "run numbers contiguous");
        }
        let successes = runs.iter().filter(|r| r.status == RunStatus::Completed).count() as i64;
        let failures = runs.iter().filter(|r| r.status == RunStatus::Failed).count() as i64;
        assert_eq!(lp.successful_runs, successes);
        assert_eq!(lp.failed_runs, failures);
    }

    #[tokio::test]
    async fn create_loop_validates_max_runs() {
        let h = harness().await;
        let mut params = loop_params(&h, 0, false);
        assert!(h.scheduler.create_loop("user-1", Plan::Free, params.clone()).await.is_err());
        params.max_runs = 21;
        assert!(h.scheduler.create_loop("user-1", Plan::Free, params.clone()).await.is_err());
        params.max_runs = 20;
        assert!(h.scheduler.create_loop("user-1", Plan::Free, params).await.is_ok());
    }

    #[tokio::test]
    async fn create_loop_rejects_past_quota() {
        let h = harness().await;
        // Burn the grant down to 3.
        h.quotas.ensure("user-1", Plan::Free, 30).await.unwrap();
        for _ in 0..27 {
            assert!(h.quotas.debit_run("user-1").await.unwrap());
        }
        let err = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 4, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), berth_common::ErrorKind::QuotaExceeded);
        assert!(h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn start_run_dispatches_and_debits() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();

        let run = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.run_number, 1);
        assert_eq!(run.sandbox_id.as_deref(), Some("sbx-1"));
        assert!(run.started_at.is_some());

        let lp = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(lp.total_runs, 1);
        assert_eq!(lp.last_run_id.as_deref(), Some(run.id.as_str()));
        assert_eq!(h.quotas.available("user-1").await.unwrap(), 29);
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn unacknowledged_dispatch_leaves_no_trace() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();

        h.acknowledge.store(false, Ordering::SeqCst);
        let err = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap_err();
        assert_eq!(err.kind(), berth_common::ErrorKind::UpstreamUnavailable);

        let lp_after = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(lp_after.total_runs, 0);
        assert!(lp_after.last_run_id.is_none());
        assert!(h.scheduler.store().runs_for_loop(&lp.id).await.unwrap().is_empty());
        assert_eq!(h.quotas.available("user-1").await.unwrap(), 30);

        // Retrying after the flake succeeds with run number 1.
        h.acknowledge.store(true, Ordering::SeqCst);
        let run = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();
        assert_eq!(run.run_number, 1);
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn second_start_conflicts_while_in_flight() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();

        h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();
        let err = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap_err();
        assert_eq!(err.kind(), berth_common::ErrorKind::Conflict);
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn exhausted_quota_parks_a_halted_run() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();
        // Drain the full grant after loop creation.
        while h.quotas.debit_run("user-1").await.unwrap() {}

        let run = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();
        assert_eq!(run.status, RunStatus::Halted);
        assert_eq!(run.trigger_type, TriggerType::Automated);
        assert_eq!(run.run_number, 1);
        assert_eq!(h.dispatches.load(Ordering::SeqCst), 0);
        assert_invariants(&h, &lp.id).await;

        // Top-up makes the halted run restartable.
        h.quotas.add_extra_runs("user-1", 5).await.unwrap();
        let restarted = h
            .scheduler
            .restart_run(&run.id, "user-1", Plan::Free)
            .await
            .unwrap();
        assert_eq!(restarted.status, RunStatus::Running);
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn callback_completion_is_idempotent() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();
        let run = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();

        h.scheduler.process_callback(callback(&run.id, true)).await.unwrap();
        let first = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(first.successful_runs, 1);

        // Re-delivery changes nothing.
        h.scheduler.process_callback(callback(&run.id, true)).await.unwrap();
        let second = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(second.successful_runs, 1);
        assert_eq!(second.updated_at, first.updated_at);

        let settled = h.scheduler.store().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(settled.status, RunStatus::Completed);
        assert_eq!(settled.commit_sha.as_deref(), Some("abc123"));
        assert!(settled.duration_seconds.is_some());
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn loop_completes_at_run_limit_without_chaining() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 1, true))
            .await
            .unwrap();
        let run = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();
        h.scheduler.process_callback(callback(&run.id, true)).await.unwrap();

        let lp = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(lp.status, LoopStatus::Completed);
        assert_eq!(lp.total_runs, 1);
        // One manual dispatch and nothing after completion.
        assert_eq!(h.dispatches.load(Ordering::SeqCst), 1);
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn automation_chains_until_a_failure() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, true))
            .await
            .unwrap();

        let run1 = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();
        h.scheduler.process_callback(callback(&run1.id, true)).await.unwrap();

        // Run 2 was chained automatically and is running.
        let runs = h.scheduler.store().runs_for_loop(&lp.id).await.unwrap();
        assert_eq!(runs.len(), 2);
        let run2 = &runs[1];
        assert_eq!(run2.run_number, 2);
        assert_eq!(run2.status, RunStatus::Running);
        assert_eq!(run2.trigger_type, TriggerType::Automated);

        // Its failure stops the chain.
        h.scheduler.process_callback(callback(&run2.id, false)).await.unwrap();
        let lp_after = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(lp_after.status, LoopStatus::Active);
        assert_eq!(lp_after.failed_runs, 1);
        assert_eq!(lp_after.successful_runs, 1);
        assert_eq!(lp_after.total_runs, 2);
        let run2_after = h.scheduler.store().get_run(&run2.id).await.unwrap().unwrap();
        assert_eq!(run2_after.error_message.as_deref(), Some("tests failed"));
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn list_complete_finishes_early() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, true))
            .await
            .unwrap();
        let run = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();

        let mut params = callback(&run.id, true);
        params.is_list_complete = true;
        h.scheduler.process_callback(params).await.unwrap();

        let lp = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(lp.status, LoopStatus::Completed);
        // No chained dispatch.
        assert_eq!(h.dispatches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chained_run_without_credential_fails_cleanly() {
        let h = harness().await;
        let mut params = loop_params(&h, 3, true);
        params.model_id = "claude-pro".into();
        // The manual start falls back to the user's active credential...
        h.vault
            .store_api_key("user-1", "anthropic", "sk-live", None)
            .await
            .unwrap();
        let lp = h.scheduler.create_loop("user-1", Plan::Free, params).await.unwrap();
        let run1 = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();

        // ...but the chain requires the loop-bound credential, which is absent.
        h.scheduler.process_callback(callback(&run1.id, true)).await.unwrap();

        let runs = h.scheduler.store().runs_for_loop(&lp.id).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].status, RunStatus::Failed);
        assert!(runs[1]
            .error_message
            .as_deref()
            .unwrap()
            .contains("credential"));
        assert_invariants(&h, &lp.id).await;
    }

    #[tokio::test]
    async fn archive_cancels_pending_runs() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();
        // Leave a pending row behind by parking one directly.
        let mut tx = h.scheduler.store().pool().begin().await.unwrap();
        let run = Scheduler::insert_run(
            &mut tx,
            &lp.id,
            1,
            RunStatus::Pending,
            TriggerType::Manual,
            &lp.model_provider_id,
            &lp.model_id,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        h.scheduler.archive_loop(&lp.id, "user-1").await.unwrap();

        let lp_after = h.scheduler.store().get(&lp.id).await.unwrap().unwrap();
        assert_eq!(lp_after.status, LoopStatus::Archived);
        let run_after = h.scheduler.store().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run_after.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn restart_rejects_settled_runs() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();
        let run = h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.unwrap();
        h.scheduler.process_callback(callback(&run.id, true)).await.unwrap();

        let err = h
            .scheduler
            .restart_run(&run.id, "user-1", Plan::Free)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), berth_common::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn pause_resume_guard_states() {
        let h = harness().await;
        let lp = h
            .scheduler
            .create_loop("user-1", Plan::Free, loop_params(&h, 3, false))
            .await
            .unwrap();

        assert!(h.scheduler.resume_loop(&lp.id, "user-1").await.is_err());
        h.scheduler.pause_loop(&lp.id, "user-1").await.unwrap();
        assert!(h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.is_err());
        h.scheduler.resume_loop(&lp.id, "user-1").await.unwrap();
        assert!(h.scheduler.start_run(&lp.id, "user-1", Plan::Free).await.is_ok());
    }
}
