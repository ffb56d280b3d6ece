use crate::session::SessionStore;
use crate::speech::SpeechConfig;
use crate::storage::StorageClient;
use crate::twilio::TwilioClient;

/// Shared application state handed to every handler.  Holds only immutable
/// configuration and connection-pooled clients; all per-call mutable state
/// lives in the session store.
pub struct AppState {
    pub openai_api_key: String,
    pub operator_api_key: String,
    pub public_base_url: String,
    pub http_client: reqwest::Client,
    pub store: SessionStore,
    pub twilio: TwilioClient,
    pub speech: SpeechConfig,
    pub storage: StorageClient,
}

impl AppState {
    pub fn turn_action_url(&self) -> String {
        format!("{}/call/turn", self.public_base_url.trim_end_matches('/'))
    }

    pub fn status_callback_url(&self, outreach_id: &str) -> String {
        format!(
            "{}/call/status?outreachId={}",
            self.public_base_url.trim_end_matches('/'),
            outreach_id
        )
    }
}
