use crate::error::AppError;

use serde::Deserialize;
use tracing::{debug, error};

/// Twilio REST client for the two outbound operations this subsystem needs:
/// placing the call and fetching the finished recording.  Credentials are
/// held here and passed nowhere else.
#[derive(Clone)]
pub struct TwilioClient {
    pub account_sid: String,
    auth_token: String,
    pub from_number: String,
}

#[derive(Deserialize, Debug)]
pub struct CallResource {
    pub sid: String,
    pub status: String,
}

impl TwilioClient {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            account_sid,
            auth_token,
            from_number,
        }
    }

    /// Place an outbound call that runs `twiml` when answered.  The status
    /// callback carries `outreachId` in its query string so disconnected
    /// lifecycle webhooks can be correlated back to the session.
    pub async fn place_call(
        &self,
        http_client: &reqwest::Client,
        to_number: &str,
        twiml: &str,
        status_callback_url: &str,
    ) -> Result<CallResource, AppError> {
        let account_sid = &self.account_sid;
        let url = format!("https://api.twilio.com/2010-04-01/Accounts/{account_sid}/Calls.json");
        let form = [
            ("To", to_number),
            ("From", self.from_number.as_str()),
            ("Twiml", twiml),
            ("Record", "true"),
            ("StatusCallback", status_callback_url),
            ("StatusCallbackEvent", "completed"),
            ("RecordingStatusCallback", status_callback_url),
            ("RecordingStatusCallbackEvent", "completed"),
        ];
        let resp = http_client
            .post(url)
            .basic_auth(account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send call placement request to twilio");
                AppError("twilio call placement request failed")
            })?;
        if !resp.status().is_success() {
            error!(status=%resp.status(), "twilio rejected call placement");
            return Err(AppError("twilio rejected call placement"));
        }
        let call = resp.json::<CallResource>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize twilio call resource");
            AppError("twilio call resource deserialization failed")
        })?;
        debug!(call_sid=%call.sid, status=%call.status, "placed outbound call");

        Ok(call)
    }

    /// Download a finished recording as MP3 bytes.  Recording media URLs
    /// require the account credentials.
    pub async fn download_recording(
        &self,
        http_client: &reqwest::Client,
        recording_url: &str,
    ) -> Result<Vec<u8>, AppError> {
        let url = format!("{recording_url}.mp3");
        let resp = http_client
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send recording download request");
                AppError("recording download request failed")
            })?;
        if !resp.status().is_success() {
            error!(status=%resp.status(), url=%url, "recording download rejected");
            return Err(AppError("recording download rejected"));
        }
        let bytes = resp.bytes().await.map_err(|e| {
            error!(error=%e, "failed to read recording bytes");
            AppError("recording download read failed")
        })?;

        Ok(bytes.to_vec())
    }
}
