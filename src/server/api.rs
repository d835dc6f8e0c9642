use crate::agent::{ RelayAgent, RelayError, RelayStream };
use crate::cli::Args;
use crate::models::api::{ ChatRequest, ChatResponse, ErrorResponse, StopRequest, StopResponse };
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Router,
    Json,
    extract::State,
    response::{ IntoResponse, Response, sse::{ Event, Sse } },
    http::{ header, HeaderValue, StatusCode },
};
use futures::{ future, stream, StreamExt };
use log::{ info, error };
use tower_http::cors::{ Any, CorsLayer };

/// Status sent when the client stopped the request (nginx's "client closed request").
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Clone)]
struct AppState {
    agent: Arc<RelayAgent>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::Cancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_REQUEST)
                    .into_response()
            }
            RelayError::NotFound => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse {
                    error: "No active streaming to stop".into(),
                })).into_response()
            }
            RelayError::Upstream(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse {
                    error: "Internal server error".into(),
                })).into_response()
            }
        }
    }
}

pub fn build_router(agent: Arc<RelayAgent>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/stop", post(stop_handler))
        .layer(cors)
        .with_state(AppState { agent })
}

pub async fn start_http_server(
    addr: &str,
    app: Router,
    args: &Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = addr.parse::<SocketAddr>()?;

    if args.enable_tls {
        let (cert_path, key_path) = match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => (cert_path, key_path),
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        };

        info!("TLS enabled. Loading certificate from '{}' and key from '{}'", cert_path, key_path);
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        info!("Chat relay listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
            e
        })?;

        info!("Chat relay listening on http://{}", addr);
        axum::serve(listener, app.into_make_service()).await?;
    }

    Ok(())
}

async fn health_handler() -> &'static str {
    "Chat relay backend is running!"
}

async fn chat_handler(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let user_id = req.user_id().to_string();

    if !req.stream {
        return match state.agent.process_message(&user_id, &req.message).await {
            Ok(response) => Json(ChatResponse { response }).into_response(),
            Err(e) => e.into_response(),
        };
    }

    let mut fragments = match state.agent.process_message_stream(&user_id, &req.message).await {
        Ok(fragments) => fragments,
        Err(e) => {
            return e.into_response();
        }
    };

    // Hold the status line until the first fragment so an early stop or
    // failure still gets its own status code.
    let first = match fragments.next().await {
        Some(Ok(fragment)) => Some(fragment),
        Some(Err(e)) => {
            info!("Stream for {} ended before any output: {}", user_id, e);
            return e.into_response();
        }
        None => None,
    };

    let events = event_stream(first, fragments);
    (
        [(header::CONNECTION, HeaderValue::from_static("keep-alive"))],
        Sse::new(events),
    ).into_response()
}

fn event_stream(
    first: Option<String>,
    rest: RelayStream
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send {
    stream::iter(first.map(Ok))
        .chain(rest)
        .filter_map(|item| future::ready(to_event(item)))
        .map(Ok::<Event, Infallible>)
}

fn to_event(item: Result<String, RelayError>) -> Option<Event> {
    match item {
        Ok(fragment) => {
            let frame = serde_json::json!({ "response": fragment });
            Some(Event::default().data(frame.to_string()))
        }
        // a stop after output has started simply ends the stream
        Err(RelayError::Cancelled) => None,
        Err(_) => {
            let frame = serde_json::json!({ "error": "Internal server error" });
            Some(Event::default().event("error").data(frame.to_string()))
        }
    }
}

async fn stop_handler(State(state): State<AppState>, Json(req): Json<StopRequest>) -> Response {
    match state.agent.stop(req.user_id()) {
        Ok(()) => {
            Json(StopResponse { message: "Streaming stopped successfully".into() }).into_response()
        }
        Err(e) => e.into_response(),
    }
}
