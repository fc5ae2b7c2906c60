//! Wire codec for the signaling WebSocket.
//!
//! Every frame is a JSON envelope `{"type": <tag>, "payload": <value>}`.
//! Decoding is two-step: parse the envelope, then parse the payload into the
//! event selected by the tag. Unknown tags are an error carrying the tag so
//! the connection can be closed with a useful reason.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::BoxError;
use crate::id::Id;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Events received from clients, plus the synthetic `Disconnected` the pump
/// enqueues when a connection dies. `Disconnected` has no wire tag and cannot
/// be injected by a client.
#[derive(Debug, Clone)]
pub enum Incoming {
    Create(CreateRoom),
    Join(JoinRoom),
    Share,
    StopShare,
    HostOffer(P2pMessage),
    ClientAnswer(P2pMessage),
    HostIce(P2pMessage),
    ClientIce(P2pMessage),
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub close_on_owner_leave: bool,
    pub connection_mode: ConnectionMode,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub join_if_exist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

/// Opaque SDP or ICE payload relayed between the two ends of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pMessage {
    pub sid: Id,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Local,
    Stun,
    Turn,
}

/// Messages sent to clients. Each variant declares its own tag via
/// [`Outgoing::type_tag`].
#[derive(Debug, Clone)]
pub enum Outgoing {
    Room(RoomInfo),
    HostSession(SessionInit),
    ClientSession(SessionInit),
    HostOffer(P2pMessage),
    ClientAnswer(P2pMessage),
    HostIce(P2pMessage),
    ClientIce(P2pMessage),
    EndShare(Id),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub users: Vec<UserInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Id,
    pub name: String,
    pub streaming: bool,
    pub owner: bool,
    pub you: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    pub peer: Id,
    pub id: Id,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Outgoing {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Outgoing::Room(_) => "room",
            Outgoing::HostSession(_) => "hostsession",
            Outgoing::ClientSession(_) => "clientsession",
            Outgoing::HostOffer(_) => "hostoffer",
            Outgoing::ClientAnswer(_) => "clientanswer",
            Outgoing::HostIce(_) => "hostice",
            Outgoing::ClientIce(_) => "clientice",
            Outgoing::EndShare(_) => "endshare",
        }
    }
}

pub fn decode(text: &str) -> Result<Incoming, BoxError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let event = match envelope.kind.as_str() {
        "create" => Incoming::Create(serde_json::from_value(envelope.payload)?),
        "join" => Incoming::Join(serde_json::from_value(envelope.payload)?),
        "share" => Incoming::Share,
        "stopshare" => Incoming::StopShare,
        "hostoffer" => Incoming::HostOffer(serde_json::from_value(envelope.payload)?),
        "clientanswer" => Incoming::ClientAnswer(serde_json::from_value(envelope.payload)?),
        "hostice" => Incoming::HostIce(serde_json::from_value(envelope.payload)?),
        "clientice" => Incoming::ClientIce(serde_json::from_value(envelope.payload)?),
        other => return Err(format!("cannot handle {other}").into()),
    };
    Ok(event)
}

pub fn encode(message: &Outgoing) -> Result<String, BoxError> {
    let payload = match message {
        Outgoing::Room(m) => serde_json::to_value(m)?,
        Outgoing::HostSession(m) | Outgoing::ClientSession(m) => serde_json::to_value(m)?,
        Outgoing::HostOffer(m)
        | Outgoing::ClientAnswer(m)
        | Outgoing::HostIce(m)
        | Outgoing::ClientIce(m) => serde_json::to_value(m)?,
        Outgoing::EndShare(id) => serde_json::to_value(id)?,
    };
    let text = serde_json::to_string(&Envelope {
        kind: message.type_tag().to_string(),
        payload,
    })?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_create() {
        let text = r#"{"type":"create","payload":{"id":"R","closeOnOwnerLeave":true,"connectionMode":"local"}}"#;
        let Incoming::Create(create) = decode(text).unwrap() else {
            panic!("expected create");
        };
        assert_eq!(create.id, "R");
        assert!(create.close_on_owner_leave);
        assert_eq!(create.connection_mode, ConnectionMode::Local);
        assert!(!create.join_if_exist);
    }

    #[test]
    fn decode_share_without_payload_fields() {
        assert!(matches!(
            decode(r#"{"type":"share","payload":{}}"#).unwrap(),
            Incoming::Share
        ));
        assert!(matches!(decode(r#"{"type":"share"}"#).unwrap(), Incoming::Share));
        assert!(matches!(
            decode(r#"{"type":"stopshare","payload":null}"#).unwrap(),
            Incoming::StopShare
        ));
    }

    #[test]
    fn decode_unknown_tag_names_the_tag() {
        let err = decode(r#"{"type":"teleport","payload":{}}"#).unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn decode_rejects_missing_connection_mode() {
        assert!(decode(r#"{"type":"create","payload":{"id":"R"}}"#).is_err());
    }

    #[test]
    fn p2p_round_trip_preserves_value() {
        let sid = Id::new();
        let text = format!(
            r#"{{"type":"hostoffer","payload":{{"sid":"{sid}","value":{{"sdp":"v=0","n":3}}}}}}"#
        );
        let Incoming::HostOffer(msg) = decode(&text).unwrap() else {
            panic!("expected hostoffer");
        };
        let encoded = encode(&Outgoing::HostOffer(msg.clone())).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(reparsed["type"], "hostoffer");
        assert_eq!(reparsed["payload"]["sid"], sid.to_string());
        assert_eq!(reparsed["payload"]["value"], json!({"sdp": "v=0", "n": 3}));
    }

    #[test]
    fn encode_endshare_is_bare_id() {
        let sid = Id::new();
        let encoded = encode(&Outgoing::EndShare(sid)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "endshare");
        assert_eq!(value["payload"], json!(sid.to_string()));
    }

    #[test]
    fn encode_room_payload_shape() {
        let encoded = encode(&Outgoing::Room(RoomInfo {
            id: "R".into(),
            users: vec![UserInfo {
                id: Id::new(),
                name: "ada".into(),
                streaming: false,
                owner: true,
                you: true,
            }],
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "room");
        assert_eq!(value["payload"]["id"], "R");
        assert_eq!(value["payload"]["users"][0]["owner"], true);
        assert_eq!(value["payload"]["users"][0]["you"], true);
    }

    #[test]
    fn session_init_skips_absent_credentials() {
        let encoded = encode(&Outgoing::HostSession(SessionInit {
            peer: Id::new(),
            id: Id::new(),
            ice_servers: vec![IceServer {
                urls: vec!["stun:203.0.113.5:3478".into()],
                username: None,
                credential: None,
            }],
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let server = &value["payload"]["iceServers"][0];
        assert!(server.get("username").is_none());
        assert!(server.get("credential").is_none());
    }
}
