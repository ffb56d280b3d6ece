pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Play")]
        Play(PlayAction),
        #[xmlserde(name = b"Gather")]
        Gather(GatherAction),
        #[xmlserde(name = b"Hangup")]
        Hangup(HangupAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PlayAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
    }

    /// The speech-gather window: plays or says its nested prompt, then listens
    /// for caller speech and posts the recognition result to `action`.
    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct GatherAction {
        #[xmlserde(name = b"input", ty = "attr")]
        pub input: Option<String>,
        #[xmlserde(name = b"action", ty = "attr")]
        pub action: Option<String>,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
        #[xmlserde(name = b"timeout", ty = "attr")]
        pub timeout: Option<u16>,
        #[xmlserde(name = b"speechTimeout", ty = "attr")]
        pub speech_timeout: Option<String>,
        #[xmlserde(ty = "untag")]
        pub prompts: Vec<GatherPrompt>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum GatherPrompt {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Play")]
        Play(PlayAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct HangupAction {}
}
pub use twiml::*;

/// What the next turn should sound like: a synthesized-audio artifact when TTS
/// succeeded, or plain text spoken by the provider's built-in voice.
pub enum SpokenPrompt {
    Audio(String),
    Text(String),
}

impl SpokenPrompt {
    fn into_gather_prompt(self) -> GatherPrompt {
        match self {
            SpokenPrompt::Audio(url) => GatherPrompt::Play(PlayAction {
                url,
                ..Default::default()
            }),
            SpokenPrompt::Text(text) => GatherPrompt::Say(SayAction {
                text,
                ..Default::default()
            }),
        }
    }
}

/// One conversational turn as a self-contained TwiML document: speak the
/// prompt, open a bounded speech-gather window posting back to `action_url`,
/// and close the call politely if the window elapses with no input.  Pure;
/// never touches the session store.
pub fn gather_turn_twiml(prompt: SpokenPrompt, action_url: &str) -> String {
    let gather = GatherAction {
        input: Some("speech".to_string()),
        action: Some(action_url.to_string()),
        method: Some("POST".to_string()),
        timeout: Some(crate::consts::GATHER_TIMEOUT_SECS),
        speech_timeout: Some("auto".to_string()),
        prompts: vec![prompt.into_gather_prompt()],
    };
    let response = Response {
        actions: vec![
            ResponseAction::Gather(gather),
            ResponseAction::Say(SayAction {
                text: crate::consts::NO_INPUT_GOODBYE.to_string(),
                ..Default::default()
            }),
            ResponseAction::Hangup(HangupAction {}),
        ],
    };
    wrap_twiml(xmlserde::xml_serialize(response))
}

/// Terminal document: speak a message and hang up.
pub fn hangup_twiml(message: &str) -> String {
    let response = Response {
        actions: vec![
            ResponseAction::Say(SayAction {
                text: message.to_string(),
                ..Default::default()
            }),
            ResponseAction::Hangup(HangupAction {}),
        ],
    };
    wrap_twiml(xmlserde::xml_serialize(response))
}

mod webhooks {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Initiated,
        Ringing,
        InProgress,
        Answered,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    /// Speech-gather callback: the provider's recognition of one caller
    /// utterance.  Both fields are absent when nothing was heard.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TurnPayload {
        pub call_sid: String,
        #[serde(default)]
        pub speech_result: Option<String>,
        #[serde(default)]
        pub confidence: Option<f64>,
    }

    /// Call-lifecycle callback; recording fields ride along on the recording
    /// status events.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusPayload {
        pub call_sid: String,
        pub call_status: CallStatus,
        #[serde(default)]
        pub recording_sid: Option<String>,
        #[serde(default)]
        pub recording_url: Option<String>,
        #[serde(default)]
        pub recording_duration: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TranscriptionPayload {
        pub call_sid: String,
        pub transcription_sid: String,
        pub transcription_status: String,
        #[serde(default)]
        pub transcription_text: Option<String>,
    }
}
pub use webhooks::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_twiml_with_audio_prompt() {
        let twiml = gather_turn_twiml(
            SpokenPrompt::Audio("https://host/audio/abc.mp3".to_string()),
            "https://host/call/turn",
        );
        assert!(twiml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(twiml.contains("<Gather"));
        assert!(twiml.contains("input=\"speech\""));
        assert!(twiml.contains("action=\"https://host/call/turn\""));
        assert!(twiml.contains("<Play>https://host/audio/abc.mp3</Play>"));
        // no-input branch always present so the call can never hang open
        assert!(twiml.contains("<Hangup"));
        assert!(twiml.contains(crate::consts::NO_INPUT_GOODBYE));
    }

    #[test]
    fn gather_twiml_with_text_fallback() {
        let twiml = gather_turn_twiml(
            SpokenPrompt::Text("Could you repeat that?".to_string()),
            "https://host/call/turn",
        );
        assert!(twiml.contains("<Say>Could you repeat that?</Say>"));
        assert!(!twiml.contains("<Play>"));
    }

    #[test]
    fn hangup_twiml_says_then_hangs_up() {
        let twiml = hangup_twiml("Sorry, something went wrong. Goodbye.");
        let say = twiml.find("<Say>").unwrap();
        let hangup = twiml.find("<Hangup").unwrap();
        assert!(say < hangup);
    }

    #[test]
    fn turn_payload_parses_confidence() {
        let payload: TurnPayload = serde_urlencoded::from_str(
            "CallSid=CA1&SpeechResult=Sure%2C+what%27s+this+about%3F&Confidence=0.9",
        )
        .unwrap();
        assert_eq!(payload.call_sid, "CA1");
        assert_eq!(payload.speech_result.as_deref(), Some("Sure, what's this about?"));
        assert_eq!(payload.confidence, Some(0.9));
    }

    #[test]
    fn turn_payload_tolerates_missing_speech() {
        let payload: TurnPayload = serde_urlencoded::from_str("CallSid=CA1").unwrap();
        assert!(payload.speech_result.is_none());
        assert!(payload.confidence.is_none());
    }

    #[test]
    fn status_payload_parses_recording_fields() {
        let payload: StatusPayload = serde_urlencoded::from_str(
            "CallSid=CA1&CallStatus=completed&RecordingSid=RE1\
             &RecordingUrl=https%3A%2F%2Fapi.twilio.com%2Frec&RecordingDuration=42",
        )
        .unwrap();
        assert_eq!(payload.call_status, CallStatus::Completed);
        assert_eq!(payload.recording_sid.as_deref(), Some("RE1"));
        assert_eq!(payload.recording_duration.as_deref(), Some("42"));
    }
}
