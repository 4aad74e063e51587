use crate::{models::DiagnosticsResponse, state::AppState};
use axum::{extract::State, http::StatusCode, Json};
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Process and hub statistics for this replica
pub async fn diagnostics(State(state): State<AppState>) -> (StatusCode, Json<DiagnosticsResponse>) {
    let hubs = state.registry.handles().await;
    let n_hubs = hubs.len() as u32;
    let n_conn: u32 = hubs.iter().map(|h| h.attached_clients() as u32).sum();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Hubs: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_conn,
        n_hubs
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            instance_id: state.instance_id.clone(),
            n_hubs,
            n_conn,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    )
}
