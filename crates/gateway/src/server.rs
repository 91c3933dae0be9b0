//! Service wiring and the HTTP listener.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    axum::Router,
    sqlx::SqlitePool,
    tokio::sync::broadcast,
    tower_http::trace::TraceLayer,
    tracing::info,
};

use berth_common::types::Plan;
use berth_compute::{BackendSettings, CatalogStore, ProviderRegistry};
use berth_config::BerthConfig;
use berth_loops::{LoopStore, Scheduler, SchedulerConfig};
use berth_metering::{QuotaPolicy, RunQuotaStore, SystemConfigStore, UsageStore};
use berth_protocol::TokenKeys;
use berth_tunnel::{DeviceLoginBroker, SqliteDeviceCodeStore, TunnelSessions};
use berth_vault::{CredentialStore, DeviceFlowBroker, OAuthEndpoints, derive_process_key};
use berth_workspaces::{
    NoopGitTokens, Orchestrator, OrchestratorConfig, PlanLookup, Reapers, WorkspaceStore,
};

use crate::{identity::IdentityStore, routes_api, routes_internal, routes_tunnel, state::AppState};

/// Interval between reaper passes.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Build every domain service against one database pool.
pub async fn build_services(config: BerthConfig) -> anyhow::Result<Arc<AppState>> {
    let pool = SqlitePool::connect(&config.database.url).await?;
    build_services_with_pool(config, pool).await
}

/// Pool-injected variant used by tests.
pub async fn build_services_with_pool(
    config: BerthConfig,
    pool: SqlitePool,
) -> anyhow::Result<Arc<AppState>> {
    let identity = Arc::new(IdentityStore::new(pool.clone()).await?);
    let catalog = Arc::new(CatalogStore::new(pool.clone()).await?);
    let system_config = Arc::new(SystemConfigStore::new(pool.clone()).await?);

    let policy = QuotaPolicy {
        enforce_daily_quota: config.quotas.enforce_daily_quota,
        self_hosted: config.quotas.self_hosted,
    };
    let usage = Arc::new(UsageStore::new(pool.clone(), policy).await?);
    let run_quotas = Arc::new(RunQuotaStore::new(pool.clone()).await?);

    let oauth_endpoints: HashMap<String, OAuthEndpoints> = config
        .oauth_providers
        .iter()
        .map(|(name, p)| {
            (name.clone(), OAuthEndpoints {
                client_id: p.client_id.clone(),
                device_code_url: p.device_code_url.clone(),
                token_url: p.token_url.clone(),
            })
        })
        .collect();
    let vault = Arc::new(
        CredentialStore::new(
            pool.clone(),
            derive_process_key(&config.secrets.vault_secret),
            oauth_endpoints,
        )
        .await?,
    );

    let keys = TokenKeys::new(config.secrets.token_secret.as_bytes());
    let registry = Arc::new(ProviderRegistry::new(
        Arc::clone(&catalog),
        BackendSettings {
            cloud_api_url: config.providers.cloud_api_url.clone(),
            cloud_api_token: config.providers.cloud_api_token.clone(),
            sandbox_dispatch_url: config.providers.sandbox_dispatch_url.clone(),
            sandbox_api_token: config.providers.sandbox_api_token.clone(),
        },
    ));

    let (events, _) = broadcast::channel(256);

    let workspace_store = Arc::new(WorkspaceStore::new(pool.clone()).await?);
    let orchestrator = Arc::new(Orchestrator::new(
        workspace_store,
        Arc::clone(&catalog),
        Arc::clone(&usage),
        Arc::clone(&system_config),
        Arc::clone(&registry),
        keys.clone(),
        Arc::new(NoopGitTokens),
        events.clone(),
        OrchestratorConfig {
            base_domain: config.server.base_domain.clone(),
            public_api_url: config.server.public_api_url.clone(),
            admin_emails: config.quotas.admin_emails.clone(),
        },
    ));

    let monthly_runs: HashMap<Plan, i64> = config
        .quotas
        .monthly_runs
        .iter()
        .filter_map(|(name, grant)| Plan::parse(name).map(|plan| (plan, *grant)))
        .collect();
    let loop_store = Arc::new(LoopStore::new(pool.clone()).await?);
    let scheduler = Arc::new(Scheduler::new(
        loop_store,
        Arc::clone(&run_quotas),
        Arc::clone(&vault),
        Arc::clone(&registry),
        events.clone(),
        SchedulerConfig {
            callback_url: format!(
                "{}/trpc/agentLoop.handleWebhook",
                config.server.public_api_url.trim_end_matches('/')
            ),
            callback_secret: config.secrets.callback_secret.clone(),
            monthly_runs,
        },
    ));

    let plans: Arc<dyn PlanLookup> = Arc::clone(&identity) as Arc<dyn PlanLookup>;
    let reapers = Arc::new(
        Reapers::new(
            Arc::clone(&orchestrator),
            Arc::clone(&usage),
            Arc::clone(&system_config),
            plans,
            policy,
            pool.clone(),
        )
        .await?,
    );

    let device_login = Arc::new(DeviceLoginBroker::new(
        SqliteDeviceCodeStore::new(pool.clone()).await?,
    ));

    Ok(Arc::new(AppState {
        throttle: crate::throttle::RequestThrottle::new(),
        config,
        identity,
        orchestrator,
        scheduler,
        vault,
        oauth_flows: Arc::new(DeviceFlowBroker::new()),
        device_login,
        tunnels: Arc::new(TunnelSessions::new()),
        keys,
        events,
        system_config,
        reapers,
    }))
}

/// Assemble the full router. Requests whose host is a workspace subdomain
/// fall through to the tunnel proxy.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", routes_api::router())
        .nest("/internal", routes_internal::router(Arc::clone(&state)))
        .nest("/workspace", routes_internal::workspace_router())
        .merge(routes_internal::webhook_router())
        .merge(routes_tunnel::router())
        .fallback(routes_tunnel::subdomain_proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind, start the reapers, and serve until the process exits.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.bind, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, base_domain = %state.config.server.base_domain, "berth gateway listening");

    let _reaper_handle = Arc::clone(&state.reapers).start(REAPER_INTERVAL);

    let app = build_app(state);
    axum::serve(listener, app).await?;
    Ok(())
}
