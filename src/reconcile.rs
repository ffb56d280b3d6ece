use crate::consts::RECORDING_FETCH_DELAY_MILLIS;
use crate::storage::recording_object_path;
use crate::types::AppState;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Fetch a finished recording from the telephony provider and republish it to
/// durable storage, then mark the session processed.  Best effort and
/// deliberately retry-free: any failure is recorded in session metadata for
/// the operator surface, and re-processing is a manual operation.  May run
/// well after, or concurrently with, the conversational webhooks.
pub async fn process_recording(
    app_state: Arc<AppState>,
    call_sid: String,
    outreach_id: String,
    recording_sid: String,
    recording_url: String,
    duration_secs: u32,
) {
    // provider-side media processing can lag the callback slightly
    sleep(Duration::from_millis(RECORDING_FETCH_DELAY_MILLIS)).await;

    match app_state.store.get(&call_sid).await {
        Ok(session)
            if session.recording_processed()
                && session.metadata_str("recordingSid") == Some(recording_sid.as_str()) =>
        {
            debug!(call_sid=%call_sid, recording_sid=%recording_sid, "recording already processed");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            error!(error=%e, call_sid=%call_sid, "cannot load session for reconciliation");
            return;
        }
    }

    let bytes = match app_state
        .twilio
        .download_recording(&app_state.http_client, &recording_url)
        .await
    {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => {
            record_error(&app_state, &call_sid, &recording_sid, "empty recording payload").await;
            return;
        }
        Err(e) => {
            record_error(&app_state, &call_sid, &recording_sid, &e.to_string()).await;
            return;
        }
    };

    let object_path = recording_object_path(&outreach_id, &call_sid, &recording_sid);
    let public_url = match app_state
        .storage
        .upload(&app_state.http_client, &object_path, "audio/mpeg", bytes)
        .await
    {
        Ok(url) => url,
        Err(e) => {
            record_error(&app_state, &call_sid, &recording_sid, &e.to_string()).await;
            return;
        }
    };

    let res = app_state
        .store
        .update(&call_sid, |session| {
            session.apply_recording(&recording_sid, &public_url, duration_secs);
        })
        .await;
    match res {
        Ok(_) => {
            info!(call_sid=%call_sid, url=%public_url, "recording reconciled to durable storage")
        }
        Err(e) => {
            error!(error=%e, call_sid=%call_sid, "failed to persist reconciled recording")
        }
    }
}

async fn record_error(app_state: &Arc<AppState>, call_sid: &str, recording_sid: &str, msg: &str) {
    error!(call_sid=%call_sid, recording_sid=%recording_sid, error=%msg, "recording reconciliation failed");
    let res = app_state
        .store
        .update(call_sid, |session| {
            session.record_recording_error(recording_sid, msg);
        })
        .await;
    if let Err(e) = res {
        error!(error=%e, call_sid=%call_sid, "failed to record reconciliation error");
    }
}
