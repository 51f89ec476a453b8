// src/server/routes.rs
//! Axum router and XML-RPC dispatch
//!
//! The whole protocol surface is one POST endpoint carrying XML-RPC
//! method calls, plus `/health` and `/metrics`. Identity is resolved per
//! request from the peer address, HTTP Basic credentials, and the
//! certificate CN forwarded by the TLS terminator; session state is keyed
//! by the resolved client identity.

use crate::core::Deadline;
use crate::error::Error;
use crate::options::DecisionMode;
use crate::probes::ProbeEngine;
use crate::server::{rpc, ServerState};
use crate::xml::Element;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Build the application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/RPC2", post(handle_rpc))
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn prometheus_metrics(State(state): State<Arc<ServerState>>) -> String {
    state
        .metrics
        .to_prometheus(state.core.intake().dropped())
}

/// Basic credentials from the Authorization header: (user, password)
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let pair = String::from_utf8(decoded).ok()?;
    let (user, password) = pair.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

async fn handle_rpc(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.metrics.record_request();
    let started = Instant::now();

    let request = match rpc::RpcRequest::parse(&body) {
        Ok(request) => request,
        Err(err) => {
            state.metrics.record_fault();
            return xml_response(rpc::respond_fault(&err));
        }
    };

    let credentials = basic_credentials(&headers);
    let cert_cn = headers
        .get("x-ssl-client-cn")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let claimed = credentials
        .as_ref()
        .map(|(user, _)| user.as_str())
        .filter(|u| !u.is_empty() && *u != "root");
    let auth = crate::metadata::AuthInfo {
        cert_cn: cert_cn.as_deref(),
        password: credentials.as_ref().map(|(_, p)| p.as_str()),
    };

    let snapshot = state.core.repo().snapshot();
    let client = match state
        .core
        .resolver()
        .resolve_identity(&snapshot.clients, &snapshot.graph, claimed, addr.ip(), &auth)
        .await
    {
        Ok(client) => client,
        Err(err) => {
            state.metrics.record_fault();
            return xml_response(rpc::respond_fault(&err));
        }
    };
    state.sessions.touch(&client);

    let reply = dispatch(&state, &client, &request).await;
    let elapsed = started.elapsed();
    match &reply {
        Ok(_) => debug!(
            client = client.as_str(),
            method = request.method.as_str(),
            latency_ms = elapsed.as_millis() as u64,
            "rpc served"
        ),
        Err(err) => {
            state.metrics.record_fault();
            info!(
                client = client.as_str(),
                method = request.method.as_str(),
                error = %err,
                "rpc failed"
            );
        }
    }

    xml_response(reply.unwrap_or_else(|err| rpc::respond_fault(&err)))
}

async fn dispatch(
    state: &Arc<ServerState>,
    client: &str,
    request: &rpc::RpcRequest,
) -> Result<String, Error> {
    let core = &state.core;
    match request.method.as_str() {
        "AssertProfile" => {
            let profile = request.string_arg()?;
            let snapshot = core.repo().snapshot();
            let is_default = snapshot.graph.default_profile() == Some(profile);
            if !snapshot.graph.is_public(profile) && !is_default {
                return Err(Error::MetadataConsistency(format!(
                    "profile {profile} is neither public nor the default"
                )));
            }
            core.store().set_profile(client, profile)?;
            core.resolver().invalidate(client);
            Ok(rpc::respond_bool(true))
        }

        "DeclareVersion" => {
            let version = request.string_arg()?;
            core.store().set_version(client, version)?;
            Ok(rpc::respond_bool(true))
        }

        "GetProbes" => {
            let probes = core.probes_for(client)?;
            state.sessions.probes_sent(
                client,
                probes.iter().map(|p| p.name.clone()).collect::<BTreeSet<_>>(),
            );
            state.metrics.record_probes();
            Ok(rpc::respond_string(
                &ProbeEngine::probes_document(&probes).to_document(),
            ))
        }

        "RecvProbeData" => {
            let doc = Element::parse(request.string_arg()?)?;
            let accepted = core.recv_probe_data(client, &doc)?;
            state.sessions.probe_data_received(client, &accepted);
            Ok(rpc::respond_bool(true))
        }

        "GetConfig" => {
            state.sessions.config_allowed(client)?;

            // Synthesis runs synchronously on a bounded worker pool
            let permit = state
                .synthesis
                .acquire()
                .await
                .map_err(|_| Error::MetadataRuntime("server shutting down".to_string()))?;
            let core = core.clone();
            let client_name = client.to_string();
            let deadline = Deadline::within(core.options.request_timeout());
            let built = tokio::task::spawn_blocking(move || {
                core.build_config(&client_name, &deadline)
            })
            .await
            .map_err(|err| Error::MetadataRuntime(format!("synthesis worker failed: {err}")))?;
            drop(permit);

            match built {
                Ok(doc) => {
                    state.sessions.served(client);
                    state.metrics.record_config();
                    Ok(rpc::respond_string(&doc.to_document()))
                }
                // Session-fatal kinds surface as faults; synthesis-level
                // failures surface as an error document so the client can
                // record the outcome
                Err(
                    err @ (Error::MetadataAuth { .. }
                    | Error::MetadataConsistency(_)
                    | Error::MetadataRuntime(_)
                    | Error::ProbeOrder { .. }),
                ) => Err(err),
                Err(err) => {
                    warn!(client, error = %err, "configuration synthesis failed");
                    let doc = Element::new("error").with_text(err.to_string());
                    Ok(rpc::respond_string(&doc.to_document()))
                }
            }
        }

        "GetDecisionList" => {
            let mode = request.string_arg()?;
            let mode = DecisionMode::from_wire(mode)
                .ok_or_else(|| Error::Xml(format!("unknown decision mode {mode:?}")))?;
            let list = core.decision_list(client, mode)?;
            Ok(rpc::respond_pairs(&list))
        }

        "RecvStats" => {
            let doc = Element::parse(request.string_arg()?)?;
            core.recv_stats(client, doc)?;
            state.metrics.record_stats();
            Ok(rpc::respond_bool(true))
        }

        other => Err(Error::UnknownMethod(other.to_string())),
    }
}

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}
