//! HTTP handlers for the session-scoped API of §6. Each handler locks a
//! session's [`arm2_core::session::Session`] only for the duration of the
//! single operation it performs -- `run` is the one exception, which
//! merely spawns [`crate::registry::SessionHandle::run_worker`] and
//! returns immediately (§5).

use std::collections::BTreeMap;
use std::sync::Arc;

use arm2_core::debugger::WatchKind;
use arm2_core::error::Diagnostic;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::registry::{state_event_for, state_label, CpsrDto, LastWrite, SessionRegistry};

use super::error::ApiError;

pub type SharedRegistry = Arc<SessionRegistry>;

async fn find(registry: &SessionRegistry, id: Uuid) -> Result<Arc<crate::registry::SessionHandle>, ApiError> {
    let handle = registry.get(id).await.ok_or(ApiError::SessionNotFound(id))?;
    handle.touch().await;
    Ok(handle)
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
}

/// `POST /api/v1/sessions`
#[utoipa::path(post, path = "/api/v1/sessions", responses((status = 200, body = CreateSessionResponse)))]
pub async fn create_session(
    State(registry): State<SharedRegistry>,
) -> Json<CreateSessionResponse> {
    let handle = registry.create().await;
    tracing::info!(session_id = %handle.id, "session created");
    Json(CreateSessionResponse { session_id: handle.id })
}

/// `DELETE /api/v1/sessions/{id}`
#[utoipa::path(delete, path = "/api/v1/sessions/{id}", responses((status = 200), (status = 404)))]
pub async fn destroy_session(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    registry.remove(id).await.ok_or(ApiError::SessionNotFound(id))?;
    tracing::info!(session_id = %id, "session destroyed");
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    pub source: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticDto {
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub raw_line: String,
}

impl From<&Diagnostic> for DiagnosticDto {
    fn from(d: &Diagnostic) -> Self {
        Self { line: d.pos.line, column: d.pos.column, message: d.message.clone(), raw_line: d.raw_line.clone() }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub entry: u32,
    pub instruction_count: usize,
    pub address_to_line: BTreeMap<u32, u32>,
    pub line_to_address: BTreeMap<u32, u32>,
    pub diagnostics: Vec<DiagnosticDto>,
}

/// `POST /api/v1/sessions/{id}/load`. Parses and encodes `source`; the
/// session stays in `idle` (and memory is left untouched) if assembly
/// fails -- diagnostics come back as a 422 with every collected error.
#[utoipa::path(post, path = "/api/v1/sessions/{id}/load", responses((status = 200, body = LoadResponse), (status = 422)))]
pub async fn load(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let code_base = arm2_core::memory::MemoryConfig::default().code_base;
    let mut vm = handle.vm.lock().await;
    match vm.load(&req.source, code_base) {
        Ok(report) => {
            let (address_to_line, line_to_address) = vm.address_line_maps();
            Ok(Json(LoadResponse {
                entry: report.entry,
                instruction_count: report.instruction_count,
                address_to_line,
                line_to_address,
                diagnostics: Vec::new(),
            }))
        }
        Err(diags) => {
            let dtos: Vec<DiagnosticDto> = diags.iter().map(DiagnosticDto::from).collect();
            Err(ApiError::UnprocessableEntity {
                message: diags.first().map(|d| d.message.clone()).unwrap_or_else(|| "assembly failed".to_string()),
                details: serde_json::to_value(&dtos).unwrap_or(serde_json::Value::Null),
            })
        }
    }
}

/// `POST /api/v1/sessions/{id}/run`. Spawns the run worker and returns
/// immediately; progress is observed via the WebSocket (§5).
#[utoipa::path(post, path = "/api/v1/sessions/{id}/run", responses((status = 202)))]
pub async fn run(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    let handle = find(&registry, id).await?;
    tokio::spawn(handle.clone().run_worker());
    Ok(StatusCode::ACCEPTED)
}

/// `POST /api/v1/sessions/{id}/stop`. Requests a pause; takes effect at
/// the next instruction boundary (§5's documented race window).
#[utoipa::path(post, path = "/api/v1/sessions/{id}/stop", responses((status = 200)))]
pub async fn stop(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    let handle = find(&registry, id).await?;
    handle.request_pause();
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub state: String,
    pub registers: [u32; 16],
    pub cpsr: CpsrDto,
    pub cycles: u64,
}

/// `POST /api/v1/sessions/{id}/step`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/step", responses((status = 200, body = StepResponse)))]
pub async fn step(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<Json<StepResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    vm.step();
    let snap = vm.registers();
    Ok(Json(StepResponse {
        state: state_label(vm.state()).to_string(),
        registers: snap.registers,
        cpsr: CpsrDto::from(snap.cpsr),
        cycles: snap.cycles,
    }))
}

/// `POST /api/v1/sessions/{id}/step-over`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/step-over", responses((status = 200, body = StepResponse)))]
pub async fn step_over(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<Json<StepResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    vm.step_over();
    let snap = vm.registers();
    Ok(Json(StepResponse {
        state: state_label(vm.state()).to_string(),
        registers: snap.registers,
        cpsr: CpsrDto::from(snap.cpsr),
        cycles: snap.cycles,
    }))
}

/// `POST /api/v1/sessions/{id}/step-out`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/step-out", responses((status = 200, body = StepResponse), (status = 400)))]
pub async fn step_out(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<Json<StepResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    vm.step_out().map_err(ApiError::BadRequest)?;
    let snap = vm.registers();
    Ok(Json(StepResponse {
        state: state_label(vm.state()).to_string(),
        registers: snap.registers,
        cpsr: CpsrDto::from(snap.cpsr),
        cycles: snap.cycles,
    }))
}

/// `POST /api/v1/sessions/{id}/reset`. Idempotent: resetting twice in a
/// row leaves the session in the same post-load state as resetting once.
#[utoipa::path(post, path = "/api/v1/sessions/{id}/reset", responses((status = 200), (status = 400)))]
pub async fn reset(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    vm.reset().map_err(ApiError::BadRequest)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub state: String,
    pub pc: u32,
    pub cycles: u64,
    pub last_write: Option<LastWrite>,
}

/// `GET /api/v1/sessions/{id}/status`
#[utoipa::path(get, path = "/api/v1/sessions/{id}/status", responses((status = 200, body = StatusResponse)))]
pub async fn status(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<Json<StatusResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let vm = handle.vm.lock().await;
    let event = state_event_for(&vm);
    Ok(Json(StatusResponse { state: event.state, pc: event.pc, cycles: event.cycles, last_write: event.last_write }))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistersResponse {
    pub registers: [u32; 16],
    pub cpsr: CpsrDto,
}

/// `GET /api/v1/sessions/{id}/registers`
#[utoipa::path(get, path = "/api/v1/sessions/{id}/registers", responses((status = 200, body = RegistersResponse)))]
pub async fn registers(State(registry): State<SharedRegistry>, Path(id): Path<Uuid>) -> Result<Json<RegistersResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let vm = handle.vm.lock().await;
    let snap = vm.registers();
    Ok(Json(RegistersResponse { registers: snap.registers, cpsr: CpsrDto::from(snap.cpsr) }))
}

#[derive(Debug, Deserialize)]
pub struct MemoryReadQuery {
    pub addr: u32,
    pub size: usize,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReadResponse {
    pub addr: u32,
    pub bytes: Vec<u8>,
}

/// `GET /api/v1/sessions/{id}/memory?addr=&size=`
#[utoipa::path(get, path = "/api/v1/sessions/{id}/memory", responses((status = 200, body = MemoryReadResponse), (status = 400)))]
pub async fn read_memory(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Query(q): Query<MemoryReadQuery>,
) -> Result<Json<MemoryReadResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let vm = handle.vm.lock().await;
    let bytes = vm.read_memory(q.addr, q.size).map_err(ApiError::BadRequest)?;
    Ok(Json(MemoryReadResponse { addr: q.addr, bytes }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryWriteRequest {
    pub addr: u32,
    pub bytes: Vec<u8>,
}

/// `POST /api/v1/sessions/{id}/memory`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/memory", responses((status = 200), (status = 400)))]
pub async fn write_memory(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Json(req): Json<MemoryWriteRequest>,
) -> Result<StatusCode, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    vm.write_memory(req.addr, &req.bytes).map_err(ApiError::BadRequest)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct DisassemblyQuery {
    pub addr: u32,
    #[serde(default = "default_disasm_count")]
    pub count: u32,
}

fn default_disasm_count() -> u32 {
    16
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisassembledInstructionDto {
    pub address: u32,
    pub word: u32,
    pub text: String,
    pub symbol: Option<String>,
}

/// `GET /api/v1/sessions/{id}/disassembly?addr=&count=`
#[utoipa::path(get, path = "/api/v1/sessions/{id}/disassembly", responses((status = 200, body = [DisassembledInstructionDto])))]
pub async fn disassembly(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Query(q): Query<DisassemblyQuery>,
) -> Result<Json<Vec<DisassembledInstructionDto>>, ApiError> {
    let handle = find(&registry, id).await?;
    let vm = handle.vm.lock().await;
    let out = vm
        .disassemble(q.addr, q.count)
        .into_iter()
        .map(|d| DisassembledInstructionDto { address: d.address, word: d.word, text: d.text, symbol: d.symbol })
        .collect();
    Ok(Json(out))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointDto {
    pub id: u32,
    pub address: u32,
    pub condition: Option<String>,
    pub hit_count: u32,
    pub enabled: bool,
}

impl From<&arm2_core::debugger::Breakpoint> for BreakpointDto {
    fn from(b: &arm2_core::debugger::Breakpoint) -> Self {
        Self { id: b.id, address: b.address, condition: b.condition.clone(), hit_count: b.hit_count, enabled: b.enabled }
    }
}

/// `GET /api/v1/sessions/{id}/breakpoints`
#[utoipa::path(get, path = "/api/v1/sessions/{id}/breakpoints", responses((status = 200, body = [BreakpointDto])))]
pub async fn list_breakpoints(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<BreakpointDto>>, ApiError> {
    let handle = find(&registry, id).await?;
    let vm = handle.vm.lock().await;
    Ok(Json(vm.breakpoints().iter().map(BreakpointDto::from).collect()))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddBreakpointRequest {
    pub address: u32,
    #[serde(default)]
    pub condition: Option<String>,
}

/// `POST /api/v1/sessions/{id}/breakpoints`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/breakpoints", responses((status = 200, body = BreakpointDto)))]
pub async fn add_breakpoint(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddBreakpointRequest>,
) -> Result<Json<BreakpointDto>, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    let bp_id = vm.add_breakpoint(req.address, req.condition.clone());
    let dto = vm.breakpoints().iter().find(|b| b.id == bp_id).map(BreakpointDto::from).ok_or_else(|| {
        ApiError::Internal("breakpoint vanished immediately after insertion".to_string())
    })?;
    Ok(Json(dto))
}

#[derive(Debug, Deserialize)]
pub struct RemoveByIdQuery {
    pub id: u32,
}

/// `DELETE /api/v1/sessions/{id}/breakpoints?id=`
#[utoipa::path(delete, path = "/api/v1/sessions/{id}/breakpoints", responses((status = 200), (status = 404)))]
pub async fn remove_breakpoint(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Query(q): Query<RemoveByIdQuery>,
) -> Result<StatusCode, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    if vm.remove_breakpoint(q.id) {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound(format!("no breakpoint with id {}", q.id)))
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchpointDto {
    pub id: u32,
    pub address: u32,
    pub size: u32,
    pub kind: String,
    pub enabled: bool,
}

fn watch_kind_label(kind: WatchKind) -> &'static str {
    match kind {
        WatchKind::Read => "read",
        WatchKind::Write => "write",
        WatchKind::ReadWrite => "read-write",
    }
}

fn parse_watch_kind(s: &str) -> Result<WatchKind, ApiError> {
    match s {
        "read" => Ok(WatchKind::Read),
        "write" => Ok(WatchKind::Write),
        "read-write" | "readwrite" => Ok(WatchKind::ReadWrite),
        other => Err(ApiError::BadRequest(format!("unknown watch kind {other:?}"))),
    }
}

impl From<&arm2_core::debugger::Watchpoint> for WatchpointDto {
    fn from(w: &arm2_core::debugger::Watchpoint) -> Self {
        Self { id: w.id, address: w.address, size: w.size, kind: watch_kind_label(w.kind).to_string(), enabled: w.enabled }
    }
}

/// `GET /api/v1/sessions/{id}/watchpoints`
#[utoipa::path(get, path = "/api/v1/sessions/{id}/watchpoints", responses((status = 200, body = [WatchpointDto])))]
pub async fn list_watchpoints(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WatchpointDto>>, ApiError> {
    let handle = find(&registry, id).await?;
    let vm = handle.vm.lock().await;
    Ok(Json(vm.watchpoints().iter().map(WatchpointDto::from).collect()))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddWatchpointRequest {
    pub address: u32,
    #[serde(default = "default_watch_size")]
    pub size: u32,
    pub kind: String,
}

fn default_watch_size() -> u32 {
    4
}

/// `POST /api/v1/sessions/{id}/watchpoints`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/watchpoints", responses((status = 200, body = WatchpointDto), (status = 400)))]
pub async fn add_watchpoint(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddWatchpointRequest>,
) -> Result<Json<WatchpointDto>, ApiError> {
    let handle = find(&registry, id).await?;
    let kind = parse_watch_kind(&req.kind)?;
    let mut vm = handle.vm.lock().await;
    let wp_id = vm.add_watchpoint(req.address, req.size, kind);
    let dto = vm.watchpoints().iter().find(|w| w.id == wp_id).map(WatchpointDto::from).ok_or_else(|| {
        ApiError::Internal("watchpoint vanished immediately after insertion".to_string())
    })?;
    Ok(Json(dto))
}

/// `DELETE /api/v1/sessions/{id}/watchpoints?id=`
#[utoipa::path(delete, path = "/api/v1/sessions/{id}/watchpoints", responses((status = 200), (status = 404)))]
pub async fn remove_watchpoint(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Query(q): Query<RemoveByIdQuery>,
) -> Result<StatusCode, ApiError> {
    let handle = find(&registry, id).await?;
    let mut vm = handle.vm.lock().await;
    if vm.remove_watchpoint(q.id) {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound(format!("no watchpoint with id {}", q.id)))
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub expression: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub value: i64,
}

/// `POST /api/v1/sessions/{id}/evaluate`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/evaluate", responses((status = 200, body = EvaluateResponse), (status = 400)))]
pub async fn evaluate(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let handle = find(&registry, id).await?;
    let vm = handle.vm.lock().await;
    let value = vm.evaluate(&req.expression).map_err(ApiError::BadRequest)?;
    Ok(Json(EvaluateResponse { value }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StdinRequest {
    pub data: String,
}

/// `POST /api/v1/sessions/{id}/stdin`
#[utoipa::path(post, path = "/api/v1/sessions/{id}/stdin", responses((status = 200)))]
pub async fn stdin(
    State(registry): State<SharedRegistry>,
    Path(id): Path<Uuid>,
    Json(req): Json<StdinRequest>,
) -> Result<StatusCode, ApiError> {
    let handle = find(&registry, id).await?;
    let max = registry.config().max_stdin_line_bytes;
    let bytes = req.data.into_bytes();
    let bytes = if bytes.len() > max { &bytes[..max] } else { &bytes[..] };
    handle.feed_stdin(bytes).await;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
}

/// `GET /api/v1/version`
#[utoipa::path(get, path = "/api/v1/version", responses((status = 200, body = VersionResponse)))]
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse { name: "arm2d".to_string(), version: env!("CARGO_PKG_VERSION").to_string() })
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExampleSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExampleProgram {
    pub name: String,
    pub description: String,
    pub source: String,
}

struct BundledExample {
    name: &'static str,
    description: &'static str,
    source: &'static str,
}

const EXAMPLES: &[BundledExample] = &[
    BundledExample {
        name: "add",
        description: "Loads two immediates, adds them, and exits (§8 scenario 1).",
        source: "MOV R0, #5\nMOV R1, #3\nADD R2, R0, R1\nSWI #0\n",
    },
    BundledExample {
        name: "overflow-flags",
        description: "ADDS of 0x80000000 with itself, exercising N/Z/C/V (§8 scenario 2).",
        source: "MOV R0, #0x80000000\nADDS R0, R0, R0\nSWI #0\n",
    },
    BundledExample {
        name: "literal-pool",
        description: "LDR Rd, =value forcing literal-pool synthesis (§8 scenario 3).",
        source: "LDR R0, =0x12345678\nSWI #0\n",
    },
    BundledExample {
        name: "echo-stdin",
        description: "Reads a line from stdin and writes its length to R0 (§8 scenario 6).",
        source: "SWI #5\nSWI #0\n",
    },
];

/// `GET /api/v1/examples`
#[utoipa::path(get, path = "/api/v1/examples", responses((status = 200, body = [ExampleSummary])))]
pub async fn list_examples() -> Json<Vec<ExampleSummary>> {
    Json(
        EXAMPLES
            .iter()
            .map(|e| ExampleSummary { name: e.name.to_string(), description: e.description.to_string() })
            .collect(),
    )
}

/// `GET /api/v1/examples/{name}`
#[utoipa::path(get, path = "/api/v1/examples/{name}", responses((status = 200, body = ExampleProgram), (status = 404)))]
pub async fn get_example(Path(name): Path<String>) -> Result<Json<ExampleProgram>, ApiError> {
    EXAMPLES
        .iter()
        .find(|e| e.name == name)
        .map(|e| Json(ExampleProgram { name: e.name.to_string(), description: e.description.to_string(), source: e.source.to_string() }))
        .ok_or_else(|| ApiError::NotFound(format!("no example named {name:?}")))
}
