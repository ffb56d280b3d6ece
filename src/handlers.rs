use crate::consts::{
    CALL_OVER_GOODBYE, CONFIDENCE_THRESHOLD, FALLBACK_UTTERANCE, SILENCE_PROMPT, SORRY_GOODBYE,
    UNCLEAR_PROMPT,
};
use crate::error::StoreError;
use crate::session::{CallSession, SessionStatus, Speaker};
use crate::twilio_types::{
    gather_turn_twiml, hangup_twiml, CallStatus, SpokenPrompt, StatusPayload, TranscriptionPayload,
    TurnPayload,
};
use crate::types::AppState;
use crate::{agent, reconcile, speech};

use axum::{
    body::StreamBody,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, trace, warn};

fn xml(twiml: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        twiml,
    )
        .into_response()
}

/// The confidence gate: decide whether a recognized utterance advances the
/// conversation.  Low-confidence and silent inputs are distinguished for
/// observability but take the same repeat-prompt control flow.
#[derive(Debug, PartialEq)]
pub enum SpeechGate {
    Accepted(String),
    Unclear,
    Silence,
}

pub fn classify_speech(speech_result: Option<&str>, confidence: Option<f64>) -> SpeechGate {
    let text = speech_result.map(str::trim).unwrap_or("");
    if text.is_empty() {
        return SpeechGate::Silence;
    }
    if confidence.unwrap_or(1.0) < CONFIDENCE_THRESHOLD {
        return SpeechGate::Unclear;
    }
    SpeechGate::Accepted(text.to_string())
}

/// Map a provider call-lifecycle status onto the session state machine.
/// Intermediate statuses never move the session.
pub fn session_status_for(call_status: CallStatus) -> Option<SessionStatus> {
    match call_status {
        CallStatus::Completed => Some(SessionStatus::Completed),
        CallStatus::Busy | CallStatus::Failed | CallStatus::NoAnswer | CallStatus::Canceled => {
            Some(SessionStatus::Failed)
        }
        _ => None,
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub to_number: String,
    pub greeting_text: String,
    pub outreach_id: String,
    #[serde(default)]
    pub context_metadata: Map<String, Value>,
    #[serde(default)]
    pub owner_user_id: Option<String>,
}

/// Internal trigger (not a provider webhook): place the call and create the
/// session before the first webhook can possibly arrive.
pub async fn initiate_call(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<InitiateRequest>,
) -> Response {
    info!(outreach_id=%req.outreach_id, to=%req.to_number, "initiating outbound call");

    let prompt = match speech::synthesize(&app_state.http_client, &app_state.speech, &req.greeting_text).await
    {
        Some(url) => SpokenPrompt::Audio(url),
        None => SpokenPrompt::Text(req.greeting_text.clone()),
    };
    let twiml = gather_turn_twiml(prompt, &app_state.turn_action_url());

    let call = match app_state
        .twilio
        .place_call(
            &app_state.http_client,
            &req.to_number,
            &twiml,
            &app_state.status_callback_url(&req.outreach_id),
        )
        .await
    {
        Ok(call) => call,
        Err(e) => {
            error!(error=%e, outreach_id=%req.outreach_id, "call placement failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "call placement failed" })),
            )
                .into_response();
        }
    };

    let session = CallSession::new(
        call.sid.clone(),
        req.outreach_id.clone(),
        &req.greeting_text,
        req.context_metadata,
        req.owner_user_id,
    );
    if let Err(e) = app_state.store.create(&session).await {
        error!(error=%e, call_sid=%call.sid, "failed to create call session");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to persist call session" })),
        )
            .into_response();
    }
    app_state
        .store
        .log_message(&req.outreach_id, &call.sid, Speaker::Ai, &req.greeting_text)
        .await;

    Json(json!({ "callId": call.sid, "status": "initiated" })).into_response()
}

/// Speech-gather callback: one full conversational cycle per invocation.
/// Always answers 200 with a coherent TwiML document; a live caller must hear
/// something every turn no matter what failed underneath.
pub async fn turn_handler(State(app_state): State<Arc<AppState>>, body: String) -> Response {
    trace!(body=%body, "turn request body");
    let payload = match serde_urlencoded::from_str::<TurnPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize turn payload");
            return xml(hangup_twiml(SORRY_GOODBYE));
        }
    };
    debug!(
        call_sid=%payload.call_sid,
        speech=?payload.speech_result,
        confidence=?payload.confidence,
        "turn webhook"
    );

    match classify_speech(payload.speech_result.as_deref(), payload.confidence) {
        SpeechGate::Unclear => {
            gate_reply(&app_state, &payload.call_sid, UNCLEAR_PROMPT, "gate_low_confidence").await
        }
        SpeechGate::Silence => {
            gate_reply(&app_state, &payload.call_sid, SILENCE_PROMPT, "gate_silence").await
        }
        SpeechGate::Accepted(text) => {
            accepted_turn(&app_state, &payload.call_sid, &text, payload.confidence).await
        }
    }
}

/// Gated input: append only a repeat prompt and re-open the gather window.
/// The turn generator is deliberately not consulted.
async fn gate_reply(
    app_state: &Arc<AppState>,
    call_sid: &str,
    prompt_text: &str,
    source: &str,
) -> Response {
    let action_url = app_state.turn_action_url();
    let res = app_state
        .store
        .update(call_sid, |session| {
            session.apply_gate_prompt(prompt_text, source);
        })
        .await;
    match res {
        Ok(session) if session.status.is_terminal() => {
            // a status webhook already ended this call; do not re-open a
            // gather on a dead line
            debug!(call_sid=%call_sid, "turn webhook after call ended");
            return xml(hangup_twiml(CALL_OVER_GOODBYE));
        }
        Ok(_) => {}
        Err(StoreError::NotFound) => {
            warn!(call_sid=%call_sid, "turn webhook for unknown call");
            return xml(hangup_twiml(SORRY_GOODBYE));
        }
        Err(StoreError::Unavailable(_)) => {
            return xml(gather_turn_twiml(
                SpokenPrompt::Text(FALLBACK_UTTERANCE.to_string()),
                &action_url,
            ));
        }
    }

    let prompt = match speech::synthesize(&app_state.http_client, &app_state.speech, prompt_text).await
    {
        Some(url) => SpokenPrompt::Audio(url),
        None => SpokenPrompt::Text(prompt_text.to_string()),
    };
    xml(gather_turn_twiml(prompt, &action_url))
}

/// Accepted input: append the caller's turn, generate and synthesize the AI
/// reply, append it, and hand the provider the next gather document.
async fn accepted_turn(
    app_state: &Arc<AppState>,
    call_sid: &str,
    text: &str,
    confidence: Option<f64>,
) -> Response {
    let action_url = app_state.turn_action_url();

    let session = match app_state
        .store
        .update(call_sid, |session| {
            session.begin_user_turn(text, confidence);
        })
        .await
    {
        Ok(session) => session,
        Err(StoreError::NotFound) => {
            warn!(call_sid=%call_sid, "turn webhook for unknown call");
            return xml(hangup_twiml(SORRY_GOODBYE));
        }
        Err(StoreError::Unavailable(_)) => {
            return xml(gather_turn_twiml(
                SpokenPrompt::Text(FALLBACK_UTTERANCE.to_string()),
                &action_url,
            ));
        }
    };
    if session.status.is_terminal() {
        debug!(call_sid=%call_sid, "turn webhook after call ended");
        return xml(hangup_twiml(CALL_OVER_GOODBYE));
    }
    app_state
        .store
        .log_message(&session.outreach_id, call_sid, Speaker::User, text)
        .await;

    let reply = agent::next_utterance(&app_state.http_client, &app_state.openai_api_key, &session).await;
    let audio = speech::synthesize(&app_state.http_client, &app_state.speech, &reply).await;

    match app_state
        .store
        .update(call_sid, |session| {
            session.complete_ai_turn(&reply);
        })
        .await
    {
        Ok(session) if session.status.is_terminal() => {
            // the call ended while the reply was being generated
            debug!(call_sid=%call_sid, "call ended mid-turn");
            return xml(hangup_twiml(CALL_OVER_GOODBYE));
        }
        Ok(_) => {}
        Err(StoreError::NotFound) => return xml(hangup_twiml(SORRY_GOODBYE)),
        Err(StoreError::Unavailable(e)) => {
            // keep talking; the reply is lost from history but the caller
            // still hears a coherent turn
            error!(error=%e, call_sid=%call_sid, "failed to persist ai turn");
        }
    }
    app_state
        .store
        .log_message(&session.outreach_id, call_sid, Speaker::Ai, &reply)
        .await;

    let prompt = match audio {
        Some(url) => SpokenPrompt::Audio(url),
        None => SpokenPrompt::Text(reply),
    };
    xml(gather_turn_twiml(prompt, &action_url))
}

#[derive(Deserialize, Debug)]
pub struct StatusQuery {
    #[serde(rename = "outreachId")]
    pub outreach_id: Option<String>,
}

/// Call + recording lifecycle callback.  Merges status monotonically and
/// kicks off recording reconciliation when media details are present.
pub async fn status_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
    body: String,
) -> Response {
    trace!(body=%body, "status request body");
    let payload = match serde_urlencoded::from_str::<StatusPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize status payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    info!(call_sid=%payload.call_sid, status=?payload.call_status, "status webhook");

    let next_status = session_status_for(payload.call_status);
    let recording = match (&payload.recording_sid, &payload.recording_url) {
        (Some(sid), Some(url)) => Some((sid.clone(), url.clone())),
        _ => None,
    };

    let session = match app_state
        .store
        .update(&payload.call_sid, |session| {
            if let Some(status) = next_status {
                session.merge_call_status(status);
            }
            if let Some((sid, _)) = &recording {
                if !session.recording_processed() {
                    session.mark_recording_pending(sid);
                }
            }
        })
        .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(error=%e, call_sid=%payload.call_sid, "failed to merge call status");
            // answer 200 regardless; the provider has nothing useful to do
            // with an error here
            return StatusCode::OK.into_response();
        }
    };

    if let Some((recording_sid, recording_url)) = recording {
        // `outreachId` should be on the query string; fall back to the
        // session looked up by call sid when it is missing
        let outreach_id = query
            .outreach_id
            .unwrap_or_else(|| session.outreach_id.clone());
        let duration_secs = payload
            .recording_duration
            .as_deref()
            .and_then(|d| d.parse::<u32>().ok())
            .unwrap_or(0);
        tokio::spawn(reconcile::process_recording(
            app_state.clone(),
            payload.call_sid.clone(),
            outreach_id,
            recording_sid,
            recording_url,
            duration_secs,
        ));
    }

    StatusCode::OK.into_response()
}

/// Transcription-completed callback; idempotent per transcription sid.
pub async fn transcription_handler(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> Response {
    trace!(body=%body, "transcription request body");
    let payload = match serde_urlencoded::from_str::<TranscriptionPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize transcription payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if payload.transcription_status != "completed" {
        debug!(
            call_sid=%payload.call_sid,
            status=%payload.transcription_status,
            "ignoring non-completed transcription"
        );
        return StatusCode::OK.into_response();
    }
    let text = match payload.transcription_text.as_deref() {
        Some(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => {
            warn!(call_sid=%payload.call_sid, "completed transcription with no text");
            return StatusCode::OK.into_response();
        }
    };

    let res = app_state
        .store
        .update(&payload.call_sid, |session| {
            if !session.apply_transcription(&payload.transcription_sid, &text) {
                debug!(
                    transcription_sid=%payload.transcription_sid,
                    "duplicate transcription callback"
                );
            }
        })
        .await;
    if let Err(e) = res {
        error!(error=%e, call_sid=%payload.call_sid, "failed to merge transcription");
    }

    StatusCode::OK.into_response()
}

fn operator_authorized(app_state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", app_state.operator_api_key))
        .unwrap_or(false)
}

/// Operator-facing snapshot of the full session.
pub async fn get_call(
    State(app_state): State<Arc<AppState>>,
    Path(call_sid): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !operator_authorized(&app_state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match app_state.store.get(&call_sid).await {
        Ok(session) => Json(session).into_response(),
        Err(StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Coarse status for polling UIs.
pub async fn call_progress(
    State(app_state): State<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Response {
    match app_state.store.get(&call_sid).await {
        Ok(session) => Json(json!({ "status": session.progress() })).into_response(),
        Err(StoreError::NotFound) => Json(json!({ "status": "not_found" })).into_response(),
        Err(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Serve a synthesized audio artifact to the telephony provider's Play verb.
/// Artifacts are read-only once written.
pub async fn serve_audio(
    State(app_state): State<Arc<AppState>>,
    Path(file_name): Path<String>,
) -> Response {
    if !is_safe_file_name(&file_name) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = app_state.speech.audio_dir.join(&file_name);
    match tokio::fs::File::open(&path).await {
        Ok(file) => {
            let body = StreamBody::new(ReaderStream::new(file));
            ([(header::CONTENT_TYPE, "audio/mpeg")], body).into_response()
        }
        Err(_) => {
            warn!(file=%file_name, "audio artifact not found");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_confidence_is_gated() {
        assert_eq!(classify_speech(Some("xyz"), Some(0.2)), SpeechGate::Unclear);
    }

    #[test]
    fn empty_and_missing_speech_are_silence() {
        assert_eq!(classify_speech(Some(""), Some(0.9)), SpeechGate::Silence);
        assert_eq!(classify_speech(Some("   "), None), SpeechGate::Silence);
        assert_eq!(classify_speech(None, None), SpeechGate::Silence);
    }

    #[test]
    fn confident_speech_is_accepted() {
        assert_eq!(
            classify_speech(Some("Sure, what's this about?"), Some(0.9)),
            SpeechGate::Accepted("Sure, what's this about?".to_string())
        );
    }

    #[test]
    fn missing_confidence_is_accepted() {
        // providers do not always report confidence; absence is not grounds
        // to gate otherwise clear speech
        assert_eq!(
            classify_speech(Some("hello"), None),
            SpeechGate::Accepted("hello".to_string())
        );
    }

    #[test]
    fn threshold_boundary() {
        assert_eq!(
            classify_speech(Some("hi"), Some(CONFIDENCE_THRESHOLD)),
            SpeechGate::Accepted("hi".to_string())
        );
    }

    #[test]
    fn call_status_mapping() {
        assert_eq!(
            session_status_for(CallStatus::Completed),
            Some(SessionStatus::Completed)
        );
        assert_eq!(
            session_status_for(CallStatus::NoAnswer),
            Some(SessionStatus::Failed)
        );
        assert_eq!(
            session_status_for(CallStatus::Busy),
            Some(SessionStatus::Failed)
        );
        assert_eq!(session_status_for(CallStatus::Ringing), None);
        assert_eq!(session_status_for(CallStatus::InProgress), None);
    }

    #[test]
    fn audio_file_name_guard() {
        assert!(is_safe_file_name("abc.mp3"));
        assert!(!is_safe_file_name("../secrets"));
        assert!(!is_safe_file_name("a/b.mp3"));
        assert!(!is_safe_file_name(""));
    }
}
