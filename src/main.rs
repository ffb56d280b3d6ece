mod agent;
mod error;
mod handlers;
mod openai_types;
mod reconcile;
mod session;
mod speech;
mod storage;
mod twilio;
mod twilio_types;
mod types;

use crate::session::SessionStore;
use crate::speech::SpeechConfig;
use crate::storage::StorageClient;
use crate::twilio::TwilioClient;
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

pub mod consts {
    /// Recognition confidence below this does not advance the conversation.
    pub const CONFIDENCE_THRESHOLD: f64 = 0.4;
    /// How long the provider listens for caller speech each turn.
    pub const GATHER_TIMEOUT_SECS: u16 = 6;
    /// Grace period before fetching a recording, to tolerate provider-side
    /// media processing lag.
    pub const RECORDING_FETCH_DELAY_MILLIS: u64 = 2_000;
    /// Bound on every outbound HTTP call so no slow dependency can hold a
    /// webhook response open past the provider's patience.
    pub const HTTP_TIMEOUT_SECS: u64 = 15;

    pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
    pub const OPENAI_MODEL: &str = "gpt-4o-mini";
    pub const REPLY_MAX_TOKENS: u32 = 80;

    pub const FALLBACK_UTTERANCE: &str =
        "I'm having trouble responding right now, could you repeat that?";
    pub const UNCLEAR_PROMPT: &str = "Sorry, I didn't quite catch that. Could you say it again?";
    pub const SILENCE_PROMPT: &str = "I didn't hear anything. Are you still there?";
    pub const NO_INPUT_GOODBYE: &str =
        "Sorry, I seem to be having trouble hearing you. We will follow up another time. Goodbye.";
    pub const SORRY_GOODBYE: &str = "Sorry, something went wrong on our end. Goodbye.";
    pub const CALL_OVER_GOODBYE: &str = "Thanks for your time. Goodbye.";
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            (
                "outreach_voice_rs",
                tracing_subscriber::filter::LevelFilter::DEBUG,
            ),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL not set!");
    let openai_api_key = env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set!");
    let operator_api_key = env::var("OPERATOR_API_KEY").expect("OPERATOR_API_KEY not set!");
    let twilio_account_sid = env::var("TWILIO_ACCOUNT_SID").expect("TWILIO_ACCOUNT_SID not set!");
    let twilio_auth_token = env::var("TWILIO_AUTH_TOKEN").expect("TWILIO_AUTH_TOKEN not set!");
    let twilio_from_number = env::var("TWILIO_FROM_NUMBER").expect("TWILIO_FROM_NUMBER not set!");
    let tts_api_key = env::var("ELEVENLABS_API_KEY").expect("ELEVENLABS_API_KEY not set!");
    let tts_voice_id = env::var("ELEVENLABS_VOICE_ID").expect("ELEVENLABS_VOICE_ID not set!");
    let public_base_url = env::var("PUBLIC_BASE_URL").expect("PUBLIC_BASE_URL not set!");
    let storage_url = env::var("STORAGE_URL").expect("STORAGE_URL not set!");
    let storage_api_key = env::var("STORAGE_API_KEY").expect("STORAGE_API_KEY not set!");
    let storage_bucket =
        env::var("STORAGE_BUCKET").unwrap_or_else(|_| "call-recordings".to_string());
    let audio_dir = PathBuf::from(env::var("AUDIO_DIR").unwrap_or_else(|_| "audio".to_string()));

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to run migrations");
    tokio::fs::create_dir_all(&audio_dir)
        .await
        .expect("failed to create audio dir");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(consts::HTTP_TIMEOUT_SECS))
        .build()
        .expect("failed to build http client");

    let app_state = Arc::new(AppState {
        openai_api_key,
        operator_api_key,
        public_base_url: public_base_url.clone(),
        http_client,
        store: SessionStore::new(pool),
        twilio: TwilioClient::new(twilio_account_sid, twilio_auth_token, twilio_from_number),
        speech: SpeechConfig {
            api_key: tts_api_key,
            voice_id: tts_voice_id,
            audio_dir,
            public_base_url,
        },
        storage: StorageClient::new(storage_url, storage_api_key, storage_bucket),
    });

    let app = Router::new()
        .route("/call/initiate", post(handlers::initiate_call))
        .route("/call/turn", post(handlers::turn_handler))
        .route("/call/status", post(handlers::status_handler))
        .route("/call/transcription", post(handlers::transcription_handler))
        .route("/call/:call_sid", get(handlers::get_call))
        .route("/call/:call_sid/progress", get(handlers::call_progress))
        .route("/audio/:file_name", get(handlers::serve_audio))
        .route("/", get(|| async { "OK" }))
        .with_state(app_state);

    axum::Server::bind(&"0.0.0.0:3000".parse().unwrap())
        .serve(app.into_make_service())
        .await
        .unwrap();
}
