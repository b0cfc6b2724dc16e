//! Line-oriented presentation layer.
//!
//! Reads commands and chat messages from stdin, prints replies and status
//! transitions, and optionally renders replies to audio through the speech
//! service. Everything here is read-only against the session client apart
//! from the calls it forwards.

use anyhow::{Context, Result};
use base64::Engine as _;
use sage_core::speech::SpeechClient;
use sage_gateway::{Attachment, SessionClient};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// A parsed input line.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Connect,
    Disconnect,
    Abort,
    Quit,
    History(usize),
    Image { path: PathBuf, caption: String },
    Transcribe(PathBuf),
    Say(String),
}

/// Parses one line from the prompt. `None` means a blank line or an unknown
/// slash-command.
pub fn parse(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Input::Say(line.to_string()));
    }
    let mut parts = line.splitn(3, ' ');
    let command = parts.next()?;
    match command {
        "/connect" => Some(Input::Connect),
        "/disconnect" => Some(Input::Disconnect),
        "/abort" => Some(Input::Abort),
        "/quit" | "/exit" => Some(Input::Quit),
        "/history" => {
            let limit = parts.next().and_then(|raw| raw.parse().ok()).unwrap_or(20);
            Some(Input::History(limit))
        }
        "/image" => {
            let path = PathBuf::from(parts.next()?);
            let caption = parts
                .next()
                .unwrap_or("What is in this image?")
                .to_string();
            Some(Input::Image { path, caption })
        }
        "/transcribe" => Some(Input::Transcribe(PathBuf::from(parts.next()?))),
        _ => None,
    }
}

/// Runs the interactive loop until `/quit` or stdin closes.
pub async fn run(
    client: SessionClient,
    speech: Option<SpeechClient>,
    voice: String,
    audio_dir: PathBuf,
) -> Result<()> {
    // Mirror state transitions onto the prompt as they happen.
    let mut state_rx = client.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow();
            println!("· {state}");
        }
    });

    println!("sage is ready. Type a message, or /quit to leave.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(input) = parse(&line) else {
            if line.trim().starts_with('/') {
                println!("Unknown command: {}", line.trim());
            }
            continue;
        };
        match input {
            Input::Quit => break,
            Input::Connect => {
                if let Err(err) = client.connect().await {
                    println!("Could not connect: {err}");
                }
            }
            Input::Disconnect => client.disconnect().await,
            Input::Abort => client.abort().await,
            Input::History(limit) => {
                // Freshen from the gateway when connected; the local log
                // answers either way.
                if let Err(err) = client.load_history(limit as u32).await {
                    debug!(error = %err, "history reload skipped");
                }
                for entry in client.recent_history(limit).await {
                    println!("[{}] {}", entry.role, entry.content);
                }
            }
            Input::Image { path, caption } => match std::fs::read(&path) {
                Ok(bytes) => {
                    let attachment = Attachment {
                        kind: "image".to_string(),
                        data: base64::engine::general_purpose::STANDARD.encode(bytes),
                    };
                    deliver(&client, &speech, &voice, &audio_dir, caption, vec![attachment])
                        .await;
                }
                Err(err) => println!("Could not read {}: {err}", path.display()),
            },
            Input::Transcribe(path) => {
                let Some(speech_client) = speech.as_ref() else {
                    println!("No speech service configured (set SPEECH_URL).");
                    continue;
                };
                match std::fs::read(&path) {
                    Ok(bytes) => match speech_client.transcribe(bytes).await {
                        Ok(text) => {
                            println!("you (transcribed): {text}");
                            deliver(&client, &speech, &voice, &audio_dir, text, Vec::new()).await;
                        }
                        Err(err) => println!("Transcription failed: {err}"),
                    },
                    Err(err) => println!("Could not read {}: {err}", path.display()),
                }
            }
            Input::Say(text) => {
                deliver(&client, &speech, &voice, &audio_dir, text, Vec::new()).await;
            }
        }
    }
    client.disconnect().await;
    Ok(())
}

/// Sends one chat turn and presents the outcome.
async fn deliver(
    client: &SessionClient,
    speech: &Option<SpeechClient>,
    voice: &str,
    audio_dir: &Path,
    message: String,
    attachments: Vec<Attachment>,
) {
    let result = if attachments.is_empty() {
        client.send_message(message).await
    } else {
        client.send_image_message(message, attachments).await
    };
    match result {
        Ok(reply) => {
            println!("sage: {reply}");
            if let Some(speech) = speech {
                speak(speech, voice, audio_dir, &reply).await;
            }
        }
        Err(err) => println!("({err})"),
    }
}

async fn speak(speech: &SpeechClient, voice: &str, audio_dir: &Path, text: &str) {
    match speech.synthesize(text, voice).await {
        Ok(bytes) => {
            let path = audio_dir.join(format!(
                "reply-{}.mp3",
                chrono::Utc::now().timestamp_millis()
            ));
            match write_audio(&path, &bytes).await {
                Ok(()) => info!(path = %path.display(), "reply rendered to audio"),
                Err(err) => warn!(error = %err, "could not write audio file"),
            }
        }
        Err(err) => warn!(error = %err, "speech synthesis failed"),
    }
}

async fn write_audio(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes)
        .await
        .context("writing audio file")
}
