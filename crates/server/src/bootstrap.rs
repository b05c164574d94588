use std::sync::Arc;
use std::time::Duration;

use dona_agent::{
    AgentRuntime, AgentSettings, DisabledLlmClient, LlmClient, LlmError, OpenAiCompatibleClient,
};
use dona_core::audit::{AuditWriter, TracingAuditGateway};
use dona_core::clock::{Clock, SystemClock};
use dona_core::config::{AppConfig, AuditDestination, ConfigError, LlmProvider, LoadOptions};
use dona_core::gateway::AuditGateway;
use dona_core::lifecycle::{TaskLifecycleManager, TimeEntryLifecycleManager};
use dona_core::rate_limit::RateLimiter;
use dona_core::retry::RetryPolicy;
use dona_db::{
    connect_with_settings, migrations, DbPool, SqlAuditRepository, SqlConversationRepository,
    SqlTaskRepository, SqlTimeEntryRepository, SqlUserRepository,
};
use dona_slack::handlers::{build_router, Services};
use dona_slack::metrics::{register_metrics, RequestMetrics};
use dona_slack::middleware::{ChainSettings, MiddlewareChain};
use dona_slack::socket::{NoopSocketTransport, ReconnectPolicy, SocketModeRunner};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<RequestMetrics>,
    pub audit: AuditWriter,
    pub audit_worker: JoinHandle<()>,
    pub slack_runner: SocketModeRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("language model client could not be built: {0}")]
    Llm(#[source] LlmError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let audit_gateway: Arc<dyn AuditGateway> = match config.audit.destination {
        AuditDestination::Database => Arc::new(SqlAuditRepository::new(db_pool.clone())),
        AuditDestination::Log => Arc::new(TracingAuditGateway),
    };
    let (audit, audit_worker) = AuditWriter::spawn(audit_gateway, config.audit.writer_config());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let retry = RetryPolicy::default();
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.policy()));
    register_metrics();
    let metrics = Arc::new(RequestMetrics::with_settings(
        config.middleware.metrics_window(),
        config.middleware.slow_request(),
    ));
    let agent = Arc::new(agent_runtime(&config)?);

    let services = Arc::new(Services {
        users: Arc::new(SqlUserRepository::new(db_pool.clone())),
        conversations: Arc::new(SqlConversationRepository::new(db_pool.clone())),
        tasks: Arc::new(TaskLifecycleManager::new(
            Arc::new(SqlTaskRepository::new(db_pool.clone())),
            clock.clone(),
            retry.clone(),
        )),
        time_entries: Arc::new(TimeEntryLifecycleManager::new(
            Arc::new(SqlTimeEntryRepository::new(db_pool.clone())),
            clock.clone(),
            retry.clone(),
        )),
        agent,
        limiter: limiter.clone(),
        metrics: metrics.clone(),
        audit: Arc::new(audit.clone()),
        access: config.access.clone(),
        clock,
        retry,
    });

    let chain = MiddlewareChain::new(
        Arc::new(build_router(services)),
        limiter.clone(),
        Arc::new(audit.clone()),
        metrics.clone(),
        ChainSettings::from(&config.middleware),
    );

    // no websocket client is linked in yet; events arrive through the trait seam
    let slack_runner = SocketModeRunner::new(
        Arc::new(NoopSocketTransport),
        Arc::new(chain),
        ReconnectPolicy::default(),
        config.middleware.response_bound,
    );

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        audit_destination = ?config.audit.destination,
        llm_provider = ?config.llm.provider,
        rate_limit_enabled = config.rate_limit.enabled,
        "application wired"
    );

    Ok(Application { config, db_pool, limiter, metrics, audit, audit_worker, slack_runner })
}

fn agent_runtime(config: &AppConfig) -> Result<AgentRuntime, BootstrapError> {
    let llm = &config.llm;
    let base_url = config.llm_base_url();

    let client: Arc<dyn LlmClient> = match (llm.provider, base_url) {
        (LlmProvider::Disabled, _) | (_, None) => Arc::new(DisabledLlmClient),
        (_, Some(base_url)) => Arc::new(
            OpenAiCompatibleClient::new(
                &base_url,
                llm.model.clone(),
                llm.api_key.clone(),
                Duration::from_secs(llm.timeout_secs),
            )
            .map_err(BootstrapError::Llm)?,
        ),
    };

    let settings = AgentSettings {
        enabled: llm.provider != LlmProvider::Disabled,
        reply_timeout: Duration::from_secs(llm.timeout_secs),
        intent_timeout: Duration::from_secs(llm.intent_timeout_secs),
        retry: RetryPolicy { max_retries: llm.max_retries, ..RetryPolicy::default() },
    };
    Ok(AgentRuntime::new(client, settings))
}
