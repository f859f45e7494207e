use crate::error::RelayError;
use crate::protocol::PublishPacket;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Selects the pipeline branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Catalog {
    #[default]
    Text,
    Audio,
}

/// A chat message as the mobile clients publish it. Keys on the wire are
/// PascalCase, e.g. `{"Catalog":"text","FromLang":"zh",...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChatEnvelope {
    pub catalog: Catalog,
    /// Producer timestamp in seconds; clients send it as a string
    #[serde(
        rename = "Time",
        serialize_with = "time_as_string",
        deserialize_with = "time_from_string_or_int"
    )]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_user: Option<String>,
    pub from_lang: String,
    pub to_lang: String,
    pub from_text: String,
    /// base64 audio upload, never echoed back
    pub from_audio: String,
    pub to_text: String,
    pub to_audio_url: String,
}

fn time_as_string<S: Serializer>(ts: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_string())
}

fn time_from_string_or_int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Raw::deserialize(d)? {
        Raw::Int(ts) => Ok(ts),
        Raw::Str(s) if s.trim().is_empty() => Ok(0),
        Raw::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid Time {:?}", s))),
    }
}

impl ChatEnvelope {
    /// Checks everything the pipeline needs before any external call is made.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.from_lang.trim().is_empty() || self.to_lang.trim().is_empty() {
            return Err(RelayError::Payload("FromLang and ToLang are required".into()));
        }
        for (field, user) in [("FromUser", &self.from_user), ("ToUser", &self.to_user)] {
            if let Some(user) = user {
                if user.is_empty() || user.contains(['/', '\\']) || user.contains("..") {
                    return Err(RelayError::Payload(format!("{} {:?} is not a valid id", field, user)));
                }
            }
        }
        match self.catalog {
            Catalog::Text if self.from_text.trim().is_empty() => {
                Err(RelayError::Payload("text message without FromText".into()))
            }
            Catalog::Audio if self.from_audio.is_empty() => {
                Err(RelayError::Payload("audio message without FromAudio".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn decode_audio(&self) -> Result<Vec<u8>, RelayError> {
        STANDARD
            .decode(self.from_audio.trim())
            .map_err(|e| RelayError::Payload(format!("FromAudio is not base64: {}", e)))
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        format!(
            "catalog={:?} time={} from={} to={} {}->{}",
            self.catalog,
            self.timestamp,
            self.from_user.as_deref().unwrap_or("-"),
            self.to_user.as_deref().unwrap_or("-"),
            self.from_lang,
            self.to_lang,
        )
    }
}

/// Unwraps a queue message into its PUBLISH header and chat envelope.
pub fn decode(frame: &[u8]) -> Result<(PublishPacket, ChatEnvelope), RelayError> {
    let packet = PublishPacket::decode(frame)?;
    let envelope: ChatEnvelope = serde_json::from_slice(&packet.payload)
        .map_err(|e| RelayError::Payload(e.to_string()))?;
    Ok((packet, envelope))
}

/// Re-wraps an envelope under the header it arrived with.
pub fn encode(packet: &PublishPacket, envelope: &ChatEnvelope) -> Result<Bytes, RelayError> {
    let payload = serde_json::to_vec(envelope).map_err(|e| RelayError::Payload(e.to_string()))?;
    packet.with_payload(payload).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn text_envelope() -> ChatEnvelope {
        ChatEnvelope {
            catalog: Catalog::Text,
            timestamp: 1_500_000_000,
            from_user: Some("8618100805249".into()),
            to_user: Some("18358183215".into()),
            from_lang: "zh".into(),
            to_lang: "en".into(),
            from_text: "你好,很高兴见到你".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parses_client_payload() {
        let raw = r#"{"Catalog":"audio","Time":"1500000000","FromUser":"8618100805249",
            "ToUser":"18358183215","FromLang":"zh","ToLang":"en","FromText":"",
            "FromAudio":"AAEC","ToText":"","ToAudioUrl":""}"#;
        let env: ChatEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.catalog, Catalog::Audio);
        assert_eq!(env.timestamp, 1_500_000_000);
        assert_eq!(env.from_user.as_deref(), Some("8618100805249"));
        assert_eq!(env.decode_audio().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_time_accepts_integer_and_serializes_as_string() {
        let env: ChatEnvelope =
            serde_json::from_str(r#"{"Catalog":"text","Time":42,"FromLang":"zh","ToLang":"en"}"#)
                .unwrap();
        assert_eq!(env.timestamp, 42);
        assert_eq!(env.from_user, None);

        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["Time"], "42");
        assert!(json.get("FromUser").is_none());
        assert_eq!(json["ToAudioUrl"], "");
    }

    #[test]
    fn test_unknown_catalog_is_a_payload_error() {
        let payload = br#"{"Catalog":"video","FromLang":"zh","ToLang":"en"}"#;
        let frame = PublishPacket::new("chat", &payload[..]).encode().unwrap();
        assert!(matches!(decode(&frame), Err(RelayError::Payload(_))));
    }

    #[test]
    fn test_non_json_payload_is_a_payload_error() {
        let frame = PublishPacket::new("chat", &b"not json"[..]).encode().unwrap();
        assert!(matches!(decode(&frame), Err(RelayError::Payload(_))));
    }

    #[test]
    fn test_envelope_round_trip_keeps_topic_and_header() {
        let mut packet = PublishPacket::new("/8618100805249/18358183215/messages", Bytes::new());
        packet.qos = QoS::AtLeastOnce;
        packet.packet_id = Some(9);
        let mut env = text_envelope();
        env.to_text = "Hello, nice to meet you ~ 「ok」".into();

        let frame = encode(&packet, &env).unwrap();
        let (decoded_packet, decoded_env) = decode(&frame).unwrap();
        assert_eq!(decoded_packet.topic, packet.topic);
        assert_eq!(decoded_packet.qos, QoS::AtLeastOnce);
        assert_eq!(decoded_packet.packet_id, Some(9));
        assert_eq!(decoded_env, env);
    }

    #[test]
    fn test_truncated_frame_is_a_decode_error() {
        let frame = encode(&PublishPacket::new("chat", Bytes::new()), &text_envelope()).unwrap();
        let err = decode(&frame[..frame.len() / 2]).unwrap_err();
        assert!(matches!(err, RelayError::Decode(_)));
    }

    #[test]
    fn test_validate() {
        assert!(text_envelope().validate().is_ok());

        let mut env = text_envelope();
        env.from_text = "  ".into();
        assert!(matches!(env.validate(), Err(RelayError::Payload(_))));

        let mut env = text_envelope();
        env.catalog = Catalog::Audio;
        assert!(env.validate().is_err());
        env.from_audio = "AAEC".into();
        assert!(env.validate().is_ok());

        let mut env = text_envelope();
        env.to_user = Some("../../etc".into());
        assert!(env.validate().is_err());

        let mut env = text_envelope();
        env.to_lang.clear();
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_bad_base64_audio() {
        let mut env = text_envelope();
        env.catalog = Catalog::Audio;
        env.from_audio = "***".into();
        assert!(matches!(env.decode_audio(), Err(RelayError::Payload(_))));
    }
}
