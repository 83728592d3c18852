//! Bridge from relayed messages to the local agent.
//!
//! With an `[agent] url` every message is POSTed there as JSON and the reply
//! is relayed back; without one the bridge echoes, which is enough to test a
//! gateway deployment end to end.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chatrelay_client::MessageHandler;
use chatrelay_core::{
    FileAttachment, IncomingMessage, MediaAsset, OutgoingResponse, RelayError, RelayResult,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::AgentSection;

#[derive(Serialize)]
struct AgentRequest<'a> {
    message: &'a IncomingMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    media: Option<AgentMedia<'a>>,
}

#[derive(Serialize)]
struct AgentMedia<'a> {
    kind: &'a str,
    filename: &'a str,
    content_type: &'a str,
    /// Base64 of the file bytes.
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct AgentReply {
    #[serde(default)]
    text: String,
    /// Local paths of files to send back.
    #[serde(default)]
    files: Vec<String>,
}

pub enum AgentBridge {
    Echo,
    Http {
        client: reqwest::Client,
        url: String,
        timeout: Duration,
    },
}

impl AgentBridge {
    pub fn new(section: &AgentSection) -> Self {
        match section.url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => AgentBridge::Http {
                client: reqwest::Client::new(),
                url: url.to_string(),
                timeout: Duration::from_secs(section.timeout_secs),
            },
            None => AgentBridge::Echo,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AgentBridge::Echo => "echo".to_string(),
            AgentBridge::Http { url, .. } => url.clone(),
        }
    }
}

#[async_trait]
impl MessageHandler for AgentBridge {
    async fn handle(
        &self,
        msg: IncomingMessage,
        media: Option<MediaAsset>,
    ) -> RelayResult<Option<OutgoingResponse>> {
        match self {
            AgentBridge::Echo => {
                let text = echo(&msg, media.as_ref());
                Ok(Some(OutgoingResponse::reply_to(&msg, text)))
            }
            AgentBridge::Http {
                client,
                url,
                timeout,
            } => {
                let reply = ask_agent(client, url, *timeout, &msg, media.as_ref()).await?;
                if reply.text.trim().is_empty() && reply.files.is_empty() {
                    debug!(message_id = %msg.id, "agent sent no reply");
                    return Ok(None);
                }
                let mut response = OutgoingResponse::reply_to(&msg, reply.text);
                response.files = reply.files.into_iter().map(FileAttachment::local).collect();
                Ok(Some(response))
            }
        }
    }
}

fn echo(msg: &IncomingMessage, media: Option<&MediaAsset>) -> String {
    match media {
        Some(asset) => format!(
            "received {} {} ({} bytes)",
            asset.kind,
            asset.filename,
            asset.bytes.len()
        ),
        None => format!("echo: {}", msg.text),
    }
}

async fn ask_agent(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    msg: &IncomingMessage,
    media: Option<&MediaAsset>,
) -> RelayResult<AgentReply> {
    let body = AgentRequest {
        message: msg,
        media: media.map(|asset| AgentMedia {
            kind: asset.kind.as_str(),
            filename: &asset.filename,
            content_type: &asset.content_type,
            data: STANDARD.encode(&asset.bytes),
        }),
    };
    let resp = client
        .post(url)
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| RelayError::Downstream(format!("agent request: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(RelayError::Downstream(format!("agent returned {status}: {text}")));
    }
    resp.json()
        .await
        .map_err(|e| RelayError::Downstream(format!("agent reply: {e}")))
}
