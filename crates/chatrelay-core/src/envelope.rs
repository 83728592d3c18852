//! Platform XML envelopes: the encrypted callback body and the decrypted
//! message it carries.

use crate::error::{RelayError, RelayResult};
use crate::media::{MediaKind, MediaRef};
use crate::messages::IncomingMessage;
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Encrypted callback as received on the webhook: the query-string fields
/// plus the `Encrypt` element of the XML body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub encrypt: String,
}

#[derive(Deserialize)]
struct CallbackBody {
    #[serde(rename = "Encrypt")]
    encrypt: Option<String>,
}

impl EncryptedEnvelope {
    /// Assemble an envelope from the query parameters and the raw XML body.
    pub fn from_callback(
        signature: &str,
        timestamp: &str,
        nonce: &str,
        body: &str,
    ) -> RelayResult<Self> {
        if signature.is_empty() || timestamp.is_empty() || nonce.is_empty() {
            return Err(RelayError::Parse(
                "missing msg_signature, timestamp or nonce".into(),
            ));
        }
        let parsed: CallbackBody = quick_xml::de::from_str(body)
            .map_err(|e| RelayError::Parse(format!("callback body: {e}")))?;
        let encrypt = parsed
            .encrypt
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| RelayError::Parse("callback body has no Encrypt element".into()))?;
        Ok(Self {
            signature: signature.to_string(),
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
            encrypt,
        })
    }

    /// Render as a passive-reply XML body.
    pub fn to_xml(&self) -> String {
        format!(
            "<xml><Encrypt>{}</Encrypt><MsgSignature>{}</MsgSignature>\
             <TimeStamp>{}</TimeStamp><Nonce>{}</Nonce></xml>",
            cdata(&self.encrypt),
            cdata(&self.signature),
            escape(self.timestamp.as_str()),
            cdata(&self.nonce)
        )
    }
}

/// Wrap `value` in CDATA, splitting any `]]>` across two sections.
fn cdata(value: &str) -> String {
    format!("<![CDATA[{}]]>", value.replace("]]>", "]]]]><![CDATA[>"))
}

/// Classification of a decrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Media(MediaKind),
    Event,
    Other(String),
}

/// Decrypted platform message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReceivedMessage {
    #[serde(rename = "ToUserName", default)]
    pub to_user: String,
    #[serde(rename = "FromUserName", default)]
    pub from_user: String,
    #[serde(rename = "CreateTime", default)]
    pub create_time: String,
    #[serde(rename = "MsgType", default)]
    pub msg_type: String,
    #[serde(rename = "Content", default)]
    pub content: String,
    #[serde(rename = "MsgId", default)]
    pub msg_id: String,
    #[serde(rename = "MediaId", default)]
    pub media_id: String,
    #[serde(rename = "AgentID", default)]
    pub agent_id: String,
    #[serde(rename = "Event", default)]
    pub event: String,
}

impl ReceivedMessage {
    pub fn from_xml(xml: &str) -> RelayResult<Self> {
        let msg: Self = quick_xml::de::from_str(xml)
            .map_err(|e| RelayError::Parse(format!("message body: {e}")))?;
        if msg.msg_type.is_empty() {
            return Err(RelayError::Parse("message has no MsgType".into()));
        }
        Ok(msg)
    }

    /// Parse from decrypted bytes.
    pub fn from_bytes(bytes: &[u8]) -> RelayResult<Self> {
        let xml = std::str::from_utf8(bytes)
            .map_err(|_| RelayError::Parse("message body is not UTF-8".into()))?;
        Self::from_xml(xml)
    }

    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<xml><ToUserName>{}</ToUserName><FromUserName>{}</FromUserName>\
             <CreateTime>{}</CreateTime><MsgType>{}</MsgType>",
            cdata(&self.to_user),
            cdata(&self.from_user),
            escape(self.create_time.as_str()),
            cdata(&self.msg_type)
        );
        for (tag, value) in [
            ("Content", &self.content),
            ("MediaId", &self.media_id),
            ("Event", &self.event),
        ] {
            if !value.is_empty() {
                xml.push_str(&format!("<{tag}>{}</{tag}>", cdata(value)));
            }
        }
        if !self.msg_id.is_empty() {
            xml.push_str(&format!("<MsgId>{}</MsgId>", escape(self.msg_id.as_str())));
        }
        if !self.agent_id.is_empty() {
            xml.push_str(&format!("<AgentID>{}</AgentID>", escape(self.agent_id.as_str())));
        }
        xml.push_str("</xml>");
        xml
    }

    pub fn kind(&self) -> MessageKind {
        match self.msg_type.as_str() {
            "text" => MessageKind::Text,
            "image" => MessageKind::Media(MediaKind::Image),
            "voice" => MessageKind::Media(MediaKind::Voice),
            "video" => MessageKind::Media(MediaKind::Video),
            "file" => MessageKind::Media(MediaKind::File),
            "event" => MessageKind::Event,
            other => MessageKind::Other(other.to_string()),
        }
    }

    /// Stable id used for duplicate suppression. Events carry no `MsgId`.
    pub fn dedup_key(&self) -> Option<String> {
        if !self.msg_id.is_empty() {
            Some(self.msg_id.clone())
        } else {
            None
        }
    }

    /// Convert to the relay's message shape. Events and unsupported types
    /// yield `None`; media messages carry a [`MediaRef`] and empty text.
    pub fn to_incoming(&self, platform: &str) -> Option<IncomingMessage> {
        let (text, media) = match self.kind() {
            MessageKind::Text => (self.content.clone(), None),
            MessageKind::Media(kind) if !self.media_id.is_empty() => (
                String::new(),
                Some(MediaRef {
                    kind,
                    media_id: self.media_id.clone(),
                }),
            ),
            _ => return None,
        };

        let id = if self.msg_id.is_empty() {
            format!("{}-{}", self.from_user, self.create_time)
        } else {
            self.msg_id.clone()
        };

        let mut metadata = HashMap::new();
        metadata.insert("msg_type".to_string(), self.msg_type.clone());
        if !self.agent_id.is_empty() {
            metadata.insert("agent_id".to_string(), self.agent_id.clone());
        }
        if !self.create_time.is_empty() {
            metadata.insert("create_time".to_string(), self.create_time.clone());
        }

        Some(IncomingMessage {
            id,
            platform: platform.to_string(),
            channel_id: self.from_user.clone(),
            user_id: self.from_user.clone(),
            username: self.from_user.clone(),
            text,
            thread_id: String::new(),
            metadata,
            media,
        })
    }
}
