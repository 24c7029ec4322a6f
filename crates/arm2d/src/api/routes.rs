//! API routing and OpenAPI document assembly, grounded on the teacher's
//! `create_router` (axum `Router` + `utoipa::OpenApi` + Swagger UI +
//! request-id middleware + permissive CORS for local GUI development).

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::{error, handlers, middleware, ws};
use crate::registry::SessionRegistry;

/// OpenAPI documentation, served at `/swagger-ui` and dumped by the
/// `openapi_dump` binary.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_session,
        handlers::destroy_session,
        handlers::load,
        handlers::run,
        handlers::stop,
        handlers::step,
        handlers::step_over,
        handlers::step_out,
        handlers::reset,
        handlers::status,
        handlers::registers,
        handlers::read_memory,
        handlers::write_memory,
        handlers::disassembly,
        handlers::list_breakpoints,
        handlers::add_breakpoint,
        handlers::remove_breakpoint,
        handlers::list_watchpoints,
        handlers::add_watchpoint,
        handlers::remove_watchpoint,
        handlers::evaluate,
        handlers::stdin,
        handlers::version,
        handlers::list_examples,
        handlers::get_example,
    ),
    components(
        schemas(
            crate::config::DaemonConfig,
            crate::registry::StateEvent,
            crate::registry::ExecutionNotice,
            crate::registry::SessionEvent,
            crate::registry::LastWrite,
            crate::registry::CpsrDto,
            error::ErrorBody,
            handlers::CreateSessionResponse,
            handlers::LoadRequest,
            handlers::LoadResponse,
            handlers::DiagnosticDto,
            handlers::StepResponse,
            handlers::StatusResponse,
            handlers::RegistersResponse,
            handlers::MemoryReadResponse,
            handlers::MemoryWriteRequest,
            handlers::DisassembledInstructionDto,
            handlers::BreakpointDto,
            handlers::AddBreakpointRequest,
            handlers::WatchpointDto,
            handlers::AddWatchpointRequest,
            handlers::EvaluateRequest,
            handlers::EvaluateResponse,
            handlers::StdinRequest,
            handlers::VersionResponse,
            handlers::ExampleSummary,
            handlers::ExampleProgram,
        )
    ),
    tags(
        (name = "sessions", description = "Session lifecycle and execution control"),
        (name = "debugger", description = "Breakpoints, watchpoints, expression evaluation"),
        (name = "misc", description = "Version and bundled example programs"),
    ),
    info(
        title = "ARM2 Emulator Session Daemon",
        version = "0.1.0",
        description = "REST + WebSocket API for driving ARM2 debugging sessions",
    )
)]
struct ApiDoc;

pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

pub fn create_router(registry: Arc<SessionRegistry>) -> Router {
    let session_routes = Router::new()
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/:id", delete(handlers::destroy_session))
        .route("/sessions/:id/load", post(handlers::load))
        .route("/sessions/:id/run", post(handlers::run))
        .route("/sessions/:id/stop", post(handlers::stop))
        .route("/sessions/:id/step", post(handlers::step))
        .route("/sessions/:id/step-over", post(handlers::step_over))
        .route("/sessions/:id/step-out", post(handlers::step_out))
        .route("/sessions/:id/reset", post(handlers::reset))
        .route("/sessions/:id/status", get(handlers::status))
        .route("/sessions/:id/registers", get(handlers::registers))
        .route("/sessions/:id/memory", get(handlers::read_memory).post(handlers::write_memory))
        .route("/sessions/:id/disassembly", get(handlers::disassembly))
        .route(
            "/sessions/:id/breakpoints",
            get(handlers::list_breakpoints).post(handlers::add_breakpoint).delete(handlers::remove_breakpoint),
        )
        .route(
            "/sessions/:id/watchpoints",
            get(handlers::list_watchpoints).post(handlers::add_watchpoint).delete(handlers::remove_watchpoint),
        )
        .route("/sessions/:id/evaluate", post(handlers::evaluate))
        .route("/sessions/:id/stdin", post(handlers::stdin))
        .route("/sessions/:id/events", get(ws::events_handler));

    let misc_routes = Router::new()
        .route("/version", get(handlers::version))
        .route("/examples", get(handlers::list_examples))
        .route("/examples/:name", get(handlers::get_example));

    let api = Router::new().nest("/api/v1", session_routes.merge(misc_routes));

    Router::new()
        .merge(api)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn version_endpoint_reports_package_version() {
        let registry = Arc::new(SessionRegistry::new(DaemonConfig::default()));
        let app = create_router(registry);
        let response = app
            .oneshot(Request::builder().uri("/api/v1/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_session_returns_404() {
        let registry = Arc::new(SessionRegistry::new(DaemonConfig::default()));
        let app = create_router(registry);
        let missing = uuid::Uuid::new_v4();
        let response = app
            .oneshot(Request::builder().uri(format!("/api/v1/sessions/{missing}/status")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
