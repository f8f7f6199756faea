use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::{Api, Client, ResourceExt};
use kube_runtime::watcher::{watcher, Config as WatchConfig, Event};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tekton_pruner_gc::clock::{Clock, SystemClock};
use tekton_pruner_gc::crd::{PipelineRun, PrunerConfig, TaskRun};
use tekton_pruner_gc::error::PrunerError;
use tekton_pruner_gc::metrics::{PrometheusReporter, Reporter};
use tekton_pruner_gc::policy::PolicyStore;
use tekton_pruner_gc::reconciler::{self, ReconcileOutcome};
use tekton_pruner_gc::resource::{PipelineRunAdapter, RunAdapter, TaskRunAdapter};
use tekton_pruner_gc::sweeper::Sweeper;
use tekton_pruner_gc::ttl::TtlOutcome;

use crate::commands::observability;

/// The global configuration document lives in this well-known ConfigMap,
/// under the key named below.
const CONFIG_MAP_NAME: &str = "tekton-pruner-config";
const CONFIG_MAP_NAMESPACE: &str = "tekton-pipelines";
const CONFIG_MAP_KEY: &str = "config.yaml";

const REQUEUE_FALLBACK: Duration = Duration::from_secs(300);
const RETRYABLE_BACKOFF: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

struct RunContext {
    pipeline_adapter: Arc<dyn RunAdapter>,
    task_adapter: Arc<dyn RunAdapter>,
    policy: Arc<PolicyStore>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
    /// Reconciles currently in flight across both controllers, reported as
    /// `queue_depth` — the closest proxy available without reaching into
    /// kube-runtime's internal scheduler.
    in_flight: AtomicI64,
}

struct ServerState {
    ready: bool,
}

pub async fn run() -> Result<()> {
    observability::init_tracing();

    println!("Starting tekton-pruner-gc...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = Arc::new(PolicyStore::new(clock.as_ref()));
    let reporter: Arc<dyn Reporter> = Arc::new(PrometheusReporter);
    tekton_pruner_gc::metrics::init();

    let pipeline_adapter: Arc<dyn RunAdapter> = Arc::new(PipelineRunAdapter::new(client.clone()));
    let task_adapter: Arc<dyn RunAdapter> = Arc::new(TaskRunAdapter::new(client.clone()));

    let cancel = CancellationToken::new();

    let sweeper = Arc::new(Sweeper::new(
        client.clone(),
        Arc::clone(&pipeline_adapter),
        Arc::clone(&task_adapter),
        Arc::clone(&policy),
        Arc::clone(&clock),
        Arc::clone(&reporter),
        cancel.clone(),
    ));

    let ctx = Arc::new(RunContext {
        pipeline_adapter: Arc::clone(&pipeline_adapter),
        task_adapter: Arc::clone(&task_adapter),
        policy: Arc::clone(&policy),
        clock: Arc::clone(&clock),
        reporter: Arc::clone(&reporter),
        cancel: cancel.clone(),
        in_flight: AtomicI64::new(0),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  PipelineRun watch ............ tekton.dev/v1 PipelineRun");
    println!("  TaskRun watch ................ tekton.dev/v1 TaskRun");
    println!("  Config watch ................. ConfigMap {CONFIG_MAP_NAMESPACE}/{CONFIG_MAP_NAME}, PrunerConfig (all namespaces)");
    println!("  Metrics server ............... http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until initial sync, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Pruner running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("pruner_started");

    let state = Arc::new(Mutex::new(ServerState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = Arc::clone(&state);
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move { start_http_server(http_state, http_shutdown, addr).await });

    let config_state = Arc::clone(&state);
    let config_sweeper = Arc::clone(&sweeper);
    let config_client = client.clone();
    let config_shutdown = shutdown_tx.subscribe();
    let config_handle = tokio::spawn(async move {
        watch_config_map(config_client, config_sweeper, config_state, config_shutdown).await
    });

    let override_policy = Arc::clone(&policy);
    let override_client = client.clone();
    let override_shutdown = shutdown_tx.subscribe();
    let override_handle = tokio::spawn(async move {
        watch_pruner_configs(override_client, override_policy, override_shutdown).await
    });

    let pipeline_runs: Api<PipelineRun> = Api::all(client.clone());
    let task_runs: Api<TaskRun> = Api::all(client.clone());

    let pipeline_ctx = Arc::clone(&ctx);
    let pipeline_controller = Controller::new(pipeline_runs, Default::default())
        .run(reconcile_pipeline_run, error_policy_pipeline_run, pipeline_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "pipelinerun_reconcile_dispatch_error");
            }
        });

    let task_ctx = Arc::clone(&ctx);
    let task_controller = Controller::new(task_runs, Default::default())
        .run(reconcile_task_run, error_policy_task_run, task_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "taskrun_reconcile_dispatch_error");
            }
        });

    {
        let mut s = state.lock().await;
        s.ready = true;
    }

    // No built-in shutdown hook on either controller; dropping the futures
    // on the first branch to complete is the only way to stop them.
    tokio::select! {
        _ = pipeline_controller => {
            info!("pipelinerun_controller_stream_ended");
        }
        _ = task_controller => {
            info!("taskrun_controller_stream_ended");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping pruner...");
            println!("{}", "=".repeat(70));
        }
    }

    cancel.cancel();
    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    let _ = config_handle.await?;
    let _ = override_handle.await?;

    info!("pruner_stopped");
    println!("Pruner stopped.");

    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile_pipeline_run(pr: Arc<PipelineRun>, ctx: Arc<RunContext>) -> Result<Action, PrunerError> {
    let depth = ctx.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    ctx.reporter.queue_depth(depth);
    let run = (*pr).clone().into();
    let result = reconciler::reconcile_run(
        ctx.pipeline_adapter.as_ref(),
        ctx.policy.as_ref(),
        ctx.clock.as_ref(),
        ctx.reporter.as_ref(),
        &run,
        &ctx.cancel,
    )
    .await;
    ctx.reporter.queue_depth(ctx.in_flight.fetch_sub(1, Ordering::SeqCst) - 1);
    Ok(action_for(&result?, ctx.clock.as_ref()))
}

async fn reconcile_task_run(tr: Arc<TaskRun>, ctx: Arc<RunContext>) -> Result<Action, PrunerError> {
    let depth = ctx.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    ctx.reporter.queue_depth(depth);
    let run = (*tr).clone().into();
    let result = reconciler::reconcile_run(
        ctx.task_adapter.as_ref(),
        ctx.policy.as_ref(),
        ctx.clock.as_ref(),
        ctx.reporter.as_ref(),
        &run,
        &ctx.cancel,
    )
    .await;
    ctx.reporter.queue_depth(ctx.in_flight.fetch_sub(1, Ordering::SeqCst) - 1);
    Ok(action_for(&result?, ctx.clock.as_ref()))
}

fn action_for(outcome: &ReconcileOutcome, clock: &dyn Clock) -> Action {
    match outcome {
        ReconcileOutcome::Skipped { .. } => Action::await_change(),
        ReconcileOutcome::Processed { ttl, .. } => match ttl {
            TtlOutcome::Requeue { delay } => Action::requeue(*delay),
            TtlOutcome::Scheduled { due_at } => {
                let delay = (*due_at - clock.now()).to_std().unwrap_or(Duration::ZERO);
                Action::requeue(delay)
            }
            TtlOutcome::Deleted { .. } | TtlOutcome::Ignored | TtlOutcome::Unchanged => {
                Action::requeue(REQUEUE_FALLBACK)
            }
        },
    }
}

fn error_policy_pipeline_run(_pr: Arc<PipelineRun>, err: &PrunerError, ctx: Arc<RunContext>) -> Action {
    report_reconcile_error(&ctx, tekton_pruner_gc::policy::RunKind::PipelineRun, err)
}

fn error_policy_task_run(_tr: Arc<TaskRun>, err: &PrunerError, ctx: Arc<RunContext>) -> Action {
    report_reconcile_error(&ctx, tekton_pruner_gc::policy::RunKind::TaskRun, err)
}

fn report_reconcile_error(ctx: &RunContext, kind: tekton_pruner_gc::policy::RunKind, err: &PrunerError) -> Action {
    if matches!(err, PrunerError::Cancelled) {
        return Action::requeue(ERROR_BACKOFF);
    }
    ctx.reporter.resource_error("", kind, err.reason());
    if err.is_retryable() {
        Action::requeue(RETRYABLE_BACKOFF)
    } else {
        warn!(kind = kind.as_str(), error = %err, "reconcile_error");
        Action::requeue(ERROR_BACKOFF)
    }
}

/* ============================= CONFIG MAP WATCH ============================= */

async fn watch_config_map(
    client: Client,
    sweeper: Arc<Sweeper>,
    state: Arc<Mutex<ServerState>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let config_maps: Api<k8s_openapi::api::core::v1::ConfigMap> = Api::namespaced(client, CONFIG_MAP_NAMESPACE);
    let watch_config = WatchConfig::default().fields(&format!("metadata.name={CONFIG_MAP_NAME}"));
    let mut stream = watcher(config_maps, watch_config).boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("config_map_watch_shutdown");
                return Ok(());
            }
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(cm) => apply_config_map(&sweeper, &state, &cm).await,
                    Event::Restarted(cms) => {
                        if let Some(cm) = cms.into_iter().find(|cm| cm.name_any() == CONFIG_MAP_NAME) {
                            apply_config_map(&sweeper, &state, &cm).await;
                        }
                    }
                    Event::Deleted(_) => {
                        warn!("config_map_deleted_retaining_previous_document");
                    }
                }
            }
        }
    }
}

async fn apply_config_map(sweeper: &Sweeper, state: &Arc<Mutex<ServerState>>, cm: &k8s_openapi::api::core::v1::ConfigMap) {
    let Some(data) = cm.data.as_ref().and_then(|d| d.get(CONFIG_MAP_KEY)) else {
        warn!(key = CONFIG_MAP_KEY, "config_map_missing_key");
        return;
    };

    match sweeper.trigger(data).await {
        Ok(report) if report.coalesced => {
            info!("sweep_coalesced");
        }
        Ok(report) => {
            info!(namespaces_swept = report.namespaces_swept, "sweep_completed");
            let mut s = state.lock().await;
            s.ready = true;
        }
        Err(err) => {
            warn!(error = %err, "sweep_failed");
        }
    }
}

/* ============================= PRUNER CONFIG WATCH ============================= */

async fn watch_pruner_configs(client: Client, policy: Arc<PolicyStore>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let configs: Api<PrunerConfig> = Api::all(client);
    let mut stream = watcher(configs, WatchConfig::default()).boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("pruner_config_watch_shutdown");
                return Ok(());
            }
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(pc) => {
                        if let Some(ns) = pc.namespace() {
                            policy.set_namespace_override(&ns, pc.spec.clone());
                        }
                    }
                    Event::Deleted(pc) => {
                        if let Some(ns) = pc.namespace() {
                            policy.remove_namespace(&ns);
                        }
                    }
                    Event::Restarted(pcs) => {
                        for pc in pcs {
                            if let Some(ns) = pc.namespace() {
                                policy.set_namespace_override(&ns, pc.spec.clone());
                            }
                        }
                    }
                }
            }
        }
    }
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_router(state: Arc<Mutex<ServerState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn start_http_server(state: Arc<Mutex<ServerState>>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server on :9090")?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ServerState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match tekton_pruner_gc::metrics::gather() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}
