//! Plain HTTP collaborators for speech synthesis and transcription.
//!
//! These are fire-and-forget request/response calls with a single timeout
//! each; they carry none of the session protocol's correlation state and can
//! be pointed at any server that speaks the `/v1/audio` endpoints.

use crate::error::Error;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct TranscriptionBody {
    text: String,
}

/// Client for the speech service.
pub struct SpeechClient {
    http: reqwest::Client,
    base: String,
}

impl SpeechClient {
    /// Creates a client for a speech service rooted at `base`
    /// (e.g. `http://127.0.0.1:18790`).
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .context("building speech HTTP client")?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Renders `text` to audio bytes with the given voice.
    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(format!("{}/v1/audio/speech", self.base))
            .json(&json!({ "input": text, "voice": voice }))
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api(status.as_u16()).into());
        }
        let bytes = response.bytes().await.map_err(map_transport)?;
        debug!(bytes = bytes.len(), "synthesized speech");
        Ok(bytes.to_vec())
    }

    /// Transcribes raw audio bytes to text.
    pub async fn transcribe(&self, audio: Vec<u8>) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/v1/audio/transcriptions", self.base))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(audio)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api(status.as_u16()).into());
        }
        let body: TranscriptionBody = response
            .json()
            .await
            .map_err(|err| Error::InvalidResponse(format!("transcription body: {err}")))?;
        Ok(body.text)
    }
}

fn map_transport(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        Error::Timeout.into()
    } else if let Some(status) = err.status() {
        Error::Api(status.as_u16()).into()
    } else {
        anyhow::Error::new(err).context("speech service unreachable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = SpeechClient::new("http://localhost:18790/").unwrap();
        assert_eq!(client.base, "http://localhost:18790");
    }

    #[test]
    fn test_transcription_body_shape() {
        let body: TranscriptionBody =
            serde_json::from_str(r#"{"text":"hello world"}"#).unwrap();
        assert_eq!(body.text, "hello world");
        assert!(serde_json::from_str::<TranscriptionBody>(r#"{"no":"text"}"#).is_err());
    }
}
