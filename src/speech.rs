use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Everything the synthesizer needs, passed explicitly per call site rather
/// than read from shared mutable state.
#[derive(Clone)]
pub struct SpeechConfig {
    pub api_key: String,
    pub voice_id: String,
    pub audio_dir: PathBuf,
    pub public_base_url: String,
}

pub fn audio_url(public_base_url: &str, file_name: &str) -> String {
    format!(
        "{}/audio/{}",
        public_base_url.trim_end_matches('/'),
        file_name
    )
}

/// Synthesize `text` to an MP3 artifact under the served audio directory and
/// return its public URL.  Returns `None` on any provider or filesystem
/// failure, deleting whatever was partially written; callers fall back to the
/// telephony provider's built-in voice.  Synthesis is an enhancement, never a
/// hard dependency for producing a turn.
pub async fn synthesize(
    http_client: &reqwest::Client,
    config: &SpeechConfig,
    text: &str,
) -> Option<String> {
    let url = format!(
        "https://api.elevenlabs.io/v1/text-to-speech/{}/stream",
        config.voice_id
    );
    let resp = match http_client
        .post(&url)
        .header("xi-api-key", &config.api_key)
        .json(&serde_json::json!({
            "text": text,
            "model_id": "eleven_turbo_v2",
        }))
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            error!(error=%e, "failed to send synthesis request");
            return None;
        }
    };
    if !resp.status().is_success() {
        error!(status=%resp.status(), "synthesis provider returned error status");
        return None;
    }

    let file_name = format!("{}.mp3", Uuid::new_v4());
    let path = config.audio_dir.join(&file_name);
    if let Err(e) = write_stream_to_file(resp, &path).await {
        error!(error=%e, path=?path, "failed to write synthesized audio");
        discard_artifact(&path).await;
        return None;
    }

    // an empty artifact would play as dead air; treat it as a failure
    match fs::metadata(&path).await {
        Ok(meta) if meta.len() > 0 => {
            debug!(path=?path, bytes = meta.len(), "synthesized audio artifact");
            Some(audio_url(&config.public_base_url, &file_name))
        }
        Ok(_) => {
            warn!(path=?path, "synthesis produced an empty artifact");
            discard_artifact(&path).await;
            None
        }
        Err(e) => {
            error!(error=%e, path=?path, "failed to stat synthesized audio");
            discard_artifact(&path).await;
            None
        }
    }
}

async fn write_stream_to_file(resp: reqwest::Response, path: &Path) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn discard_artifact(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error=%e, path=?path, "failed to remove partial audio artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_url_joins_cleanly() {
        assert_eq!(
            audio_url("https://host/", "a.mp3"),
            "https://host/audio/a.mp3"
        );
        assert_eq!(
            audio_url("https://host", "a.mp3"),
            "https://host/audio/a.mp3"
        );
    }

    #[tokio::test]
    async fn provider_failure_yields_none_and_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = SpeechConfig {
            api_key: "k".to_string(),
            voice_id: "v".to_string(),
            audio_dir: dir.path().to_path_buf(),
            public_base_url: "https://host".to_string(),
        };
        // closed local port so the request itself fails
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all("http://127.0.0.1:1").unwrap())
            .build()
            .unwrap();
        let url = synthesize(&client, &config, "hello").await;
        assert!(url.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
