//! The narrow control surface: peer validation and creation, flow
//! creation, shutdown and mirror status, served over HTTP with an
//! embedded worker runtime executing the flows.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use catalog::Catalog;
use connectors::{get_cdc_pull_connector, get_cdc_sync_connector};
use flow::{CdcFlowWorkflow, FlowActivities, QRepFlowWorkflow};
use pt::{
    CdcFlowStatus, DbType, FlowConnectionConfigs, FlowJobConfig, Peer, QRepConfig, ShutdownRequest,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct FlowHandle {
    workflow_id: String,
    shutdown: CancellationToken,
    status: Option<Arc<RwLock<CdcFlowStatus>>>,
    task: tokio::task::JoinHandle<()>,
}

struct ApiState {
    catalog: Arc<Catalog>,
    activities: Arc<dyn FlowActivities>,
    flows: Mutex<HashMap<String, FlowHandle>>,
}

pub async fn serve(
    catalog: Arc<Catalog>,
    activities: Arc<dyn FlowActivities>,
    port: u16,
) -> anyhow::Result<()> {
    let state = Arc::new(ApiState {
        catalog,
        activities,
        flows: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/v1/peers/validate", post(validate_peer))
        .route("/v1/peers/create", post(create_peer))
        .route("/v1/flows/cdc/create", post(create_cdc_flow))
        .route("/v1/flows/qrep/create", post(create_qrep_flow))
        .route("/v1/flows/shutdown", post(shutdown_flow))
        .route("/v1/mirrors/:job", get(mirror_status))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("control api listening on {}", addr);
    axum::serve(listener, app)
        .await
        .context("control api server failed")
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    message: String,
}

async fn validate_peer(Json(peer): Json<Peer>) -> Json<StatusResponse> {
    let result = match peer.r#type {
        DbType::Postgres => match get_cdc_pull_connector(&peer).await {
            Ok(conn) => conn.check_connection().await,
            Err(err) => Err(err.into()),
        },
        _ => match get_cdc_sync_connector(&peer).await {
            Ok(conn) => conn.check_connection().await,
            Err(err) => Err(err.into()),
        },
    };
    Json(match result {
        Ok(()) => StatusResponse {
            status: "VALID".to_owned(),
            message: String::new(),
        },
        Err(err) => StatusResponse {
            status: "INVALID".to_owned(),
            message: format!("{:#}", err),
        },
    })
}

async fn create_peer(
    State(state): State<Arc<ApiState>>,
    Json(peer): Json<Peer>,
) -> Json<StatusResponse> {
    Json(match state.catalog.create_peer(&peer).await {
        Ok(_) => StatusResponse {
            status: "CREATED".to_owned(),
            message: String::new(),
        },
        Err(err) => StatusResponse {
            status: "FAILED".to_owned(),
            message: format!("{:#}", err),
        },
    })
}

#[derive(Serialize)]
struct CreateFlowResponse {
    workflow_id: String,
}

async fn create_cdc_flow(
    State(state): State<Arc<ApiState>>,
    Json(configs): Json<FlowConnectionConfigs>,
) -> Json<CreateFlowResponse> {
    let workflow_id = format!("{}-peerflow-{}", configs.flow_job_name, uuid::Uuid::new_v4());
    let _ = state
        .catalog
        .create_flow_entry(
            &configs.flow_job_name,
            &workflow_id,
            &configs.source.name,
            &configs.destination.name,
            &serde_json::to_value(FlowJobConfig::Cdc(configs.clone())).unwrap_or_default(),
        )
        .await;

    let shutdown = CancellationToken::new();
    let status: Arc<RwLock<CdcFlowStatus>> = Default::default();
    let workflow =
        CdcFlowWorkflow::new(state.activities.clone(), shutdown.clone(), status.clone());
    let job = configs.flow_job_name.clone();
    let task = tokio::spawn(async move {
        if let Err(err) = workflow.run(&configs).await {
            tracing::error!(flow = %configs.flow_job_name, "cdc flow failed: {:#}", err);
        }
    });
    state.flows.lock().await.insert(
        job,
        FlowHandle {
            workflow_id: workflow_id.clone(),
            shutdown,
            status: Some(status),
            task,
        },
    );
    Json(CreateFlowResponse { workflow_id })
}

async fn create_qrep_flow(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<QRepConfig>,
) -> Json<CreateFlowResponse> {
    let workflow_id = format!("{}-qrepflow-{}", config.flow_job_name, uuid::Uuid::new_v4());
    let _ = state
        .catalog
        .create_flow_entry(
            &config.flow_job_name,
            &workflow_id,
            &config.source_peer.name,
            &config.destination_peer.name,
            &serde_json::to_value(FlowJobConfig::QRep(config.clone())).unwrap_or_default(),
        )
        .await;

    let shutdown = CancellationToken::new();
    let workflow = QRepFlowWorkflow::new(state.activities.clone(), shutdown.clone());
    let job = config.flow_job_name.clone();
    let task = tokio::spawn(async move {
        if let Err(err) = workflow.run(&config).await {
            tracing::error!(flow = %config.flow_job_name, "qrep flow failed: {:#}", err);
        }
    });
    state.flows.lock().await.insert(
        job,
        FlowHandle {
            workflow_id: workflow_id.clone(),
            shutdown,
            status: None,
            task,
        },
    );
    Json(CreateFlowResponse { workflow_id })
}

#[derive(Serialize)]
struct ShutdownResponse {
    ok: bool,
    error_message: String,
}

async fn shutdown_flow(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ShutdownRequest>,
) -> Json<ShutdownResponse> {
    let handle = state.flows.lock().await.remove(&req.flow_job_name);
    let Some(handle) = handle else {
        return Json(ShutdownResponse {
            ok: false,
            error_message: format!("no running flow named {}", req.flow_job_name),
        });
    };
    info!(
        flow = %req.flow_job_name,
        workflow_id = %handle.workflow_id,
        "shutting down flow"
    );
    handle.shutdown.cancel();
    let result = handle.task.await;
    let _ = state.catalog.delete_flow_entry(&req.flow_job_name).await;
    Json(match result {
        Ok(()) => ShutdownResponse {
            ok: true,
            error_message: String::new(),
        },
        Err(err) => ShutdownResponse {
            ok: false,
            error_message: format!("flow task failed: {}", err),
        },
    })
}

#[derive(Serialize)]
#[serde(untagged)]
enum MirrorStatusResponse {
    Cdc {
        workflow_id: String,
        cdc_status: CdcFlowStatus,
    },
    QRep {
        workflow_id: String,
        running: bool,
    },
    Unknown {
        error_message: String,
    },
}

#[derive(Deserialize)]
struct MirrorPath {
    job: String,
}

async fn mirror_status(
    State(state): State<Arc<ApiState>>,
    Path(MirrorPath { job }): Path<MirrorPath>,
) -> Json<MirrorStatusResponse> {
    let flows = state.flows.lock().await;
    Json(match flows.get(&job) {
        Some(handle) => match &handle.status {
            Some(status) => MirrorStatusResponse::Cdc {
                workflow_id: handle.workflow_id.clone(),
                cdc_status: status.read().await.clone(),
            },
            None => MirrorStatusResponse::QRep {
                workflow_id: handle.workflow_id.clone(),
                running: !handle.task.is_finished(),
            },
        },
        None => MirrorStatusResponse::Unknown {
            error_message: format!("no running flow named {}", job),
        },
    })
}
