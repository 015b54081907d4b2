//! Handlers for the `/sessions` resource.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use ussdhub_core::types::Timestamp;
use ussdhub_realtime::session::SessionRecord;

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// One active session as shown to its owner.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub device: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: Timestamp,
    pub last_activity_at: Timestamp,
    pub expires_at: Timestamp,
    /// Whether this is the session making the request.
    pub current: bool,
}

impl SessionView {
    fn from_record(record: SessionRecord, current_token: &str) -> Self {
        Self {
            current: record.session_token == current_token,
            session_id: record.session_token,
            device: record.device,
            ip_address: record.ip_address,
            user_agent: record.user_agent,
            login_at: record.login_at,
            last_activity_at: record.last_activity_at,
            expires_at: record.expires_at,
        }
    }
}

/// GET /api/v1/sessions
///
/// The caller's cached sessions, newest login first.
pub async fn list_active(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<DataResponse<Vec<SessionView>>>> {
    let sessions = state.realtime.sessions.list_active(user.user_id).await?;
    let data = sessions
        .into_iter()
        .map(|s| SessionView::from_record(s, &user.session_token))
        .collect();
    Ok(Json(DataResponse { data }))
}
