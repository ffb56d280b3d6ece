use crate::error::StoreError;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, Pool, Postgres};
use time::OffsetDateTime;
use tracing::{error, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Ai,
    User,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Ai => "ai",
            Speaker::User => "user",
        }
    }
}

/// One utterance in a call, in conversation order.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initiated,
    WaitingForUserSpeech,
    ProcessingTurn,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::WaitingForUserSpeech => "waiting_for_user_speech",
            SessionStatus::ProcessingTurn => "processing_turn",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(SessionStatus::Initiated),
            "waiting_for_user_speech" => Some(SessionStatus::WaitingForUserSpeech),
            "processing_turn" => Some(SessionStatus::ProcessingTurn),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Durable record of one phone call's conversation.  Created at call placement,
/// then mutated by every webhook through `SessionStore::update`.
#[derive(Serialize, Debug, Clone)]
pub struct CallSession {
    pub call_sid: String,
    pub outreach_id: String,
    pub status: SessionStatus,
    pub history: Vec<Turn>,
    pub metadata: Map<String, Value>,
    pub owner_user_id: Option<String>,
    pub created: OffsetDateTime,
    pub updated: OffsetDateTime,
}

impl CallSession {
    pub fn new(
        call_sid: String,
        outreach_id: String,
        greeting: &str,
        metadata: Map<String, Value>,
        owner_user_id: Option<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let mut session = Self {
            call_sid,
            outreach_id,
            status: SessionStatus::Initiated,
            history: vec![],
            metadata,
            owner_user_id,
            created: now,
            updated: now,
        };
        session.append_ai_turn(greeting, None);
        session
    }

    /// History is append-only; all additions funnel through these two methods.
    pub fn append_ai_turn(&mut self, text: &str, source: Option<&str>) {
        self.history.push(Turn {
            speaker: Speaker::Ai,
            text: text.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            source: source.map(str::to_string),
            confidence: None,
        });
    }

    pub fn append_user_turn(&mut self, text: &str, confidence: Option<f64>) {
        self.history.push(Turn {
            speaker: Speaker::User,
            text: text.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            source: None,
            confidence,
        });
    }

    /// Move the conversational state machine forward.  Terminal states are
    /// never left: a status webhook can end the call while a speech-turn
    /// webhook is still in flight, and the turn's write-back must not revive
    /// the session.
    pub fn advance_status(&mut self, next: SessionStatus) {
        if !self.status.is_terminal() {
            self.status = next;
        }
    }

    /// Gated input: append only a repeat prompt and return to listening.
    /// No-op once the call has ended.
    pub fn apply_gate_prompt(&mut self, prompt: &str, source: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.append_ai_turn(prompt, Some(source));
        self.advance_status(SessionStatus::WaitingForUserSpeech);
    }

    /// Accepted input, first half of the cycle: record the caller's utterance
    /// and mark the turn as being processed.  No-op once the call has ended.
    pub fn begin_user_turn(&mut self, text: &str, confidence: Option<f64>) {
        if self.status.is_terminal() {
            return;
        }
        self.append_user_turn(text, confidence);
        self.advance_status(SessionStatus::ProcessingTurn);
    }

    /// Second half of the cycle: record the AI reply and return to listening.
    /// No-op once the call has ended.
    pub fn complete_ai_turn(&mut self, text: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.append_ai_turn(text, None);
        self.advance_status(SessionStatus::WaitingForUserSpeech);
    }

    /// Merge a call-lifecycle status from the provider.  Terminal statuses are
    /// sticky: a later conflicting terminal signal is recorded in metadata
    /// instead of overwriting, and non-terminal signals never demote.
    pub fn merge_call_status(&mut self, incoming: SessionStatus) {
        if self.status.is_terminal() {
            if incoming.is_terminal() && incoming != self.status {
                self.metadata.insert(
                    "conflictingStatus".to_string(),
                    json!(incoming.as_str()),
                );
            }
            return;
        }
        self.status = incoming;
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn recording_processed(&self) -> bool {
        self.metadata
            .get("recordingProcessed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark_recording_pending(&mut self, recording_sid: &str) {
        self.metadata
            .insert("recordingSid".to_string(), json!(recording_sid));
        self.metadata
            .insert("recordingStatus".to_string(), json!("pending"));
    }

    /// Record the durably-stored recording.  Returns false without touching
    /// anything when this recording sid has already been processed, so a
    /// duplicate recording callback is a no-op.
    pub fn apply_recording(&mut self, recording_sid: &str, url: &str, duration_secs: u32) -> bool {
        if self.recording_processed() && self.metadata_str("recordingSid") == Some(recording_sid) {
            return false;
        }
        self.metadata
            .insert("recordingSid".to_string(), json!(recording_sid));
        self.metadata
            .insert("recordingUrl".to_string(), json!(url));
        self.metadata
            .insert("recordingDurationSeconds".to_string(), json!(duration_secs));
        self.metadata
            .insert("recordingProcessed".to_string(), json!(true));
        self.metadata
            .insert("recordingStatus".to_string(), json!("ready"));
        self.history.push(Turn {
            speaker: Speaker::Ai,
            text: "Call recording is available.".to_string(),
            timestamp: OffsetDateTime::now_utc(),
            source: Some("system".to_string()),
            confidence: None,
        });
        true
    }

    pub fn record_recording_error(&mut self, recording_sid: &str, message: &str) {
        self.metadata
            .insert("recordingSid".to_string(), json!(recording_sid));
        self.metadata
            .insert("recordingStatus".to_string(), json!("error"));
        self.metadata
            .insert("lastError".to_string(), json!(message));
    }

    /// Merge a completed transcription.  Idempotent per transcription sid.
    pub fn apply_transcription(&mut self, transcription_sid: &str, text: &str) -> bool {
        let seen = self
            .metadata
            .get("transcriptionSids")
            .and_then(Value::as_array)
            .map(|sids| sids.iter().any(|s| s.as_str() == Some(transcription_sid)))
            .unwrap_or(false);
        if seen {
            return false;
        }
        match self
            .metadata
            .entry("transcriptionSids".to_string())
            .or_insert_with(|| json!([]))
        {
            Value::Array(sids) => sids.push(json!(transcription_sid)),
            other => *other = json!([transcription_sid]),
        }
        self.metadata
            .insert("transcriptionText".to_string(), json!(text));
        self.history.push(Turn {
            speaker: Speaker::User,
            text: text.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            source: Some("transcription".to_string()),
            confidence: None,
        });
        true
    }

    /// Coarse state for polling UIs.
    pub fn progress(&self) -> &'static str {
        match self.status {
            SessionStatus::Failed => "failed",
            SessionStatus::Completed => {
                if self.recording_processed() {
                    "completed"
                } else {
                    "processing_artifacts"
                }
            }
            _ => "processing",
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    call_sid: String,
    outreach_id: String,
    status: String,
    history: Json<Vec<Turn>>,
    metadata: Json<Map<String, Value>>,
    owner_user_id: Option<String>,
    created: OffsetDateTime,
    updated: OffsetDateTime,
}

impl SessionRow {
    fn into_session(self) -> CallSession {
        let status = SessionStatus::parse(&self.status).unwrap_or_else(|| {
            warn!(status=%self.status, call_sid=%self.call_sid, "unknown stored status");
            SessionStatus::Failed
        });
        CallSession {
            call_sid: self.call_sid,
            outreach_id: self.outreach_id,
            status,
            history: self.history.0,
            metadata: self.metadata.0,
            owner_user_id: self.owner_user_id,
            created: self.created,
            updated: self.updated,
        }
    }
}

const SELECT_COLUMNS: &str =
    "call_sid, outreach_id, status, history, metadata, owner_user_id, created, updated";

/// Postgres-backed store for call sessions.  The `update` contract is the
/// single concurrency point of the whole subsystem: turn, status and
/// transcription webhooks all land on one row, serialized by a row lock.
#[derive(Clone)]
pub struct SessionStore {
    pool: Pool<Postgres>,
}

impl SessionStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session: &CallSession) -> Result<(), StoreError> {
        sqlx::query(
            "
            insert into call_sessions
              (call_sid, outreach_id, status, history, metadata, owner_user_id, created, updated)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&session.call_sid)
        .bind(&session.outreach_id)
        .bind(session.status.as_str())
        .bind(Json(&session.history))
        .bind(Json(&session.metadata))
        .bind(&session.owner_user_id)
        .bind(session.created)
        .bind(session.updated)
        .execute(&self.pool)
        .await
        .map_err(StoreError::unavailable)?;

        Ok(())
    }

    pub async fn get(&self, call_sid: &str) -> Result<CallSession, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "select {SELECT_COLUMNS} from call_sessions where call_sid = $1"
        ))
        .bind(call_sid)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::unavailable)?;

        row.map(SessionRow::into_session).ok_or(StoreError::NotFound)
    }

    /// Atomic read-modify-write of one session.  The row lock held across the
    /// transaction serializes concurrent webhook updates on the same call sid.
    pub async fn update<F>(&self, call_sid: &str, mutate: F) -> Result<CallSession, StoreError>
    where
        F: FnOnce(&mut CallSession),
    {
        let mut tx = self.pool.begin().await.map_err(StoreError::unavailable)?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "select {SELECT_COLUMNS} from call_sessions where call_sid = $1 for update"
        ))
        .bind(call_sid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::unavailable)?;
        let mut session = row.map(SessionRow::into_session).ok_or(StoreError::NotFound)?;

        mutate(&mut session);
        session.updated = OffsetDateTime::now_utc();

        sqlx::query(
            "
            update call_sessions
            set status = $2, history = $3, metadata = $4, updated = $5
            where call_sid = $1
            ",
        )
        .bind(&session.call_sid)
        .bind(session.status.as_str())
        .bind(Json(&session.history))
        .bind(Json(&session.metadata))
        .bind(session.updated)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::unavailable)?;
        tx.commit().await.map_err(StoreError::unavailable)?;

        Ok(session)
    }

    /// Mirror one turn into the outreach-level message log read by the
    /// operator UI.  Best effort: a failed mirror never fails the call.
    pub async fn log_message(&self, outreach_id: &str, call_sid: &str, speaker: Speaker, body: &str) {
        let res = sqlx::query(
            "
            insert into outreach_messages (outreach_id, call_sid, speaker, body, created)
            values ($1, $2, $3, $4, $5)
            ",
        )
        .bind(outreach_id)
        .bind(call_sid)
        .bind(speaker.as_str())
        .bind(body)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            error!(error=%e, outreach_id=%outreach_id, "failed to mirror message to outreach log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(
            "CA123".to_string(),
            "outreach-1".to_string(),
            "Hi Alex, got a minute?",
            Map::new(),
            None,
        )
    }

    #[test]
    fn new_session_starts_with_greeting() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Initiated);
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].speaker, Speaker::Ai);
        assert_eq!(s.history[0].text, "Hi Alex, got a minute?");
    }

    #[test]
    fn history_only_grows_and_keeps_order() {
        let mut s = session();
        s.append_user_turn("Sure, what's this about?", Some(0.9));
        s.append_ai_turn("We'd love to work with you.", None);
        assert_eq!(s.history.len(), 3);
        assert_eq!(s.history[1].speaker, Speaker::User);
        assert_eq!(s.history[1].confidence, Some(0.9));
        assert_eq!(s.history[2].speaker, Speaker::Ai);
        // earlier entries untouched
        assert_eq!(s.history[0].text, "Hi Alex, got a minute?");
    }

    #[test]
    fn turn_cycle_walks_the_state_machine() {
        let mut s = session();
        s.begin_user_turn("Sure, what's this about?", Some(0.9));
        assert_eq!(s.status, SessionStatus::ProcessingTurn);
        s.complete_ai_turn("Great, we have a campaign in mind for you.");
        assert_eq!(s.status, SessionStatus::WaitingForUserSpeech);
        assert_eq!(s.history.len(), 3);
    }

    #[test]
    fn gate_prompt_appends_and_reopens() {
        let mut s = session();
        s.apply_gate_prompt("Could you say that again?", "gate_low_confidence");
        assert_eq!(s.status, SessionStatus::WaitingForUserSpeech);
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.history[1].source.as_deref(), Some("gate_low_confidence"));
    }

    #[test]
    fn turn_mutations_never_demote_terminal_status() {
        // a completed-call status webhook can land while a speech-turn
        // webhook is still in flight; the turn's write-back must not revive
        // the session or grow its history
        let mut s = session();
        s.merge_call_status(SessionStatus::Completed);
        let len = s.history.len();
        s.apply_gate_prompt("Could you say that again?", "gate_silence");
        s.begin_user_turn("hello?", Some(0.9));
        s.complete_ai_turn("hi there");
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.history.len(), len);
        assert_eq!(s.progress(), "processing_artifacts");
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut s = session();
        s.merge_call_status(SessionStatus::Completed);
        s.merge_call_status(SessionStatus::WaitingForUserSpeech);
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.metadata.get("conflictingStatus").is_none());
    }

    #[test]
    fn conflicting_terminal_status_recorded_not_applied() {
        let mut s = session();
        s.merge_call_status(SessionStatus::Completed);
        s.merge_call_status(SessionStatus::Failed);
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(
            s.metadata.get("conflictingStatus"),
            Some(&json!("failed"))
        );
    }

    #[test]
    fn recording_merge_is_idempotent() {
        let mut s = session();
        assert!(s.apply_recording("RE1", "https://store/rec.mp3", 42));
        let len = s.history.len();
        assert!(!s.apply_recording("RE1", "https://other/rec.mp3", 42));
        assert_eq!(s.history.len(), len);
        assert_eq!(s.metadata_str("recordingUrl"), Some("https://store/rec.mp3"));
        assert!(s.recording_processed());
        assert_eq!(
            s.metadata.get("recordingDurationSeconds"),
            Some(&json!(42))
        );
    }

    #[test]
    fn recording_error_recorded_in_metadata() {
        let mut s = session();
        s.record_recording_error("RE1", "download failed: 404");
        assert!(!s.recording_processed());
        assert_eq!(s.metadata_str("recordingStatus"), Some("error"));
        assert_eq!(s.metadata_str("lastError"), Some("download failed: 404"));
    }

    #[test]
    fn transcription_merge_is_idempotent_per_sid() {
        let mut s = session();
        assert!(s.apply_transcription("TR1", "hello there"));
        assert!(!s.apply_transcription("TR1", "hello there"));
        assert!(s.apply_transcription("TR2", "more text"));
        let sids = s.metadata.get("transcriptionSids").unwrap();
        assert_eq!(sids, &json!(["TR1", "TR2"]));
    }

    #[test]
    fn progress_derivation() {
        let mut s = session();
        assert_eq!(s.progress(), "processing");
        s.merge_call_status(SessionStatus::Completed);
        assert_eq!(s.progress(), "processing_artifacts");
        s.apply_recording("RE1", "https://store/rec.mp3", 10);
        assert_eq!(s.progress(), "completed");
        let mut f = session();
        f.merge_call_status(SessionStatus::Failed);
        assert_eq!(f.progress(), "failed");
    }
}
