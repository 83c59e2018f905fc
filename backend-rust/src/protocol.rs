//! # protocol
//!
//! JSON wire messages. Every frame is an object tagged by a kebab-case
//! `type`; payload fields are camelCase. Inbound and outbound messages are
//! closed enums so the dispatcher's `match` is exhaustive.

use std::collections::BTreeMap;

use board_geometry::{BoardPoint, Ring};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::autocommit::VisitRecord;
use crate::error::{CoreError, ErrorCode};
use crate::lobby::{MatchMode, PendingMatch};
use crate::prestart::TieBreak;
use crate::sessions::ConnId;

// ─── Inbound ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Presence {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },
    Join {
        #[serde(alias = "code")]
        room_id: String,
    },
    Spectate {
        #[serde(alias = "code")]
        room_id: String,
    },
    State {
        #[serde(default)]
        payload: Value,
    },
    Chat {
        message: String,
    },
    Celebration {
        #[serde(default)]
        payload: Value,
    },
    CreateMatch {
        game: String,
        mode: MatchMode,
        value: u32,
        starting_score: u32,
        #[serde(default)]
        require_calibration: bool,
        #[serde(default = "default_true")]
        allow_spectators: bool,
    },
    ListMatches,
    JoinMatch {
        match_id: String,
        #[serde(default)]
        calibrated: bool,
    },
    InviteAccept {
        match_id: String,
    },
    InviteDecline {
        match_id: String,
    },
    InviteResponse {
        match_id: String,
        accept: bool,
    },
    PrestartChoice {
        room_id: String,
        choice: TieBreak,
    },
    PrestartBullThrow {
        room_id: String,
        score: u32,
    },
    CancelMatch {
        match_id: String,
    },
    SetMatchAutocommit {
        room_id: String,
        allow: bool,
    },
    AutoVisit {
        room_id: String,
        value: u32,
        #[serde(default = "default_darts")]
        darts: u8,
        ring: Ring,
        #[serde(default)]
        sector: u8,
        #[serde(default)]
        board_point: Option<BoardPoint>,
        #[serde(default)]
        calibration_valid: bool,
    },
    CamCreate,
    CamJoin {
        code: String,
    },
    CamSignal {
        code: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Every inbound `type` tag, in declaration order.
pub const CLIENT_TYPES: &[&str] = &[
    "presence",
    "join",
    "spectate",
    "state",
    "chat",
    "celebration",
    "create-match",
    "list-matches",
    "join-match",
    "invite-accept",
    "invite-decline",
    "invite-response",
    "prestart-choice",
    "prestart-bull-throw",
    "cancel-match",
    "set-match-autocommit",
    "auto-visit",
    "cam-create",
    "cam-join",
    "cam-signal",
];

/// Why an inbound frame did not decode.
#[derive(Debug, PartialEq)]
pub enum ParseFailure {
    /// Not JSON, not an object, or an unknown `type`. Dropped silently.
    Ignored(String),
    /// A known `type` with missing or mistyped fields. Reported to the sender.
    Invalid(CoreError),
}

pub fn parse_client(text: &str) -> Result<ClientMessage, ParseFailure> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseFailure::Ignored(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseFailure::Ignored("missing type".to_string()))?;
    if !CLIENT_TYPES.contains(&kind) {
        return Err(ParseFailure::Ignored(format!("unknown type {kind:?}")));
    }
    let kind = kind.to_string();
    serde_json::from_value(value)
        .map_err(|e| ParseFailure::Invalid(CoreError::bad_request(format!("{kind}: {e}"))))
}

fn default_true() -> bool {
    true
}

fn default_darts() -> u8 {
    1
}

// ─── Outbound ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: ConnId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub spectator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Joined {
        room_id: String,
        id: ConnId,
        spectator: bool,
        members: Vec<PeerInfo>,
    },
    PeerJoined {
        room_id: String,
        peer: PeerInfo,
    },
    PeerLeft {
        room_id: String,
        id: ConnId,
    },
    Presence {
        id: ConnId,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        admin: bool,
        online: bool,
    },
    State {
        room_id: String,
        from: ConnId,
        payload: Value,
    },
    Chat {
        room_id: String,
        from: ConnId,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        message: String,
        ts: i64,
    },
    Celebration {
        room_id: String,
        from: ConnId,
        payload: Value,
    },
    Matches {
        matches: Vec<PendingMatch>,
    },
    Invite {
        match_id: String,
        from_id: ConnId,
        from_name: String,
        game: String,
        mode: MatchMode,
        value: u32,
        starting_score: u32,
        calibrated: bool,
    },
    InviteWaiting {
        match_id: String,
        creator_name: String,
    },
    Declined {
        match_id: String,
    },
    InviteExpired {
        match_id: String,
    },
    MatchPrestart {
        room_id: String,
        #[serde(rename = "match")]
        pending: PendingMatch,
        participants: Vec<ConnId>,
        prestart_ends_at: i64,
        seconds: u64,
    },
    PrestartChoiceNotify {
        room_id: String,
        choices: BTreeMap<ConnId, TieBreak>,
    },
    PrestartBull {
        room_id: String,
        round: usize,
    },
    PrestartBullWinner {
        room_id: String,
        winner_id: ConnId,
        round: usize,
        scores: BTreeMap<ConnId, Vec<u32>>,
    },
    PrestartBullTie {
        room_id: String,
        round: usize,
        scores: BTreeMap<ConnId, Vec<u32>>,
    },
    MatchStart {
        room_id: String,
        #[serde(rename = "match")]
        pending: PendingMatch,
        #[serde(skip_serializing_if = "Option::is_none")]
        first_player_id: Option<ConnId>,
    },
    MatchAutocommitUpdated {
        room_id: String,
        allow: bool,
    },
    VisitCommit {
        room_id: String,
        visit: VisitRecord,
    },
    CamCode {
        code: String,
        expires_at: i64,
    },
    CamPaired {
        code: String,
    },
    CamSignal {
        code: String,
        from: ConnId,
        payload: Value,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    /// Wire name of this message, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::PeerJoined { .. } => "peer-joined",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::Presence { .. } => "presence",
            ServerMessage::State { .. } => "state",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::Celebration { .. } => "celebration",
            ServerMessage::Matches { .. } => "matches",
            ServerMessage::Invite { .. } => "invite",
            ServerMessage::InviteWaiting { .. } => "invite-waiting",
            ServerMessage::Declined { .. } => "declined",
            ServerMessage::InviteExpired { .. } => "invite-expired",
            ServerMessage::MatchPrestart { .. } => "match-prestart",
            ServerMessage::PrestartChoiceNotify { .. } => "prestart-choice-notify",
            ServerMessage::PrestartBull { .. } => "prestart-bull",
            ServerMessage::PrestartBullWinner { .. } => "prestart-bull-winner",
            ServerMessage::PrestartBullTie { .. } => "prestart-bull-tie",
            ServerMessage::MatchStart { .. } => "match-start",
            ServerMessage::MatchAutocommitUpdated { .. } => "match-autocommit-updated",
            ServerMessage::VisitCommit { .. } => "visit-commit",
            ServerMessage::CamCode { .. } => "cam-code",
            ServerMessage::CamPaired { .. } => "cam-paired",
            ServerMessage::CamSignal { .. } => "cam-signal",
            ServerMessage::Error { .. } => "error",
        }
    }
}

impl From<&CoreError> for ServerMessage {
    fn from(err: &CoreError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_kebab_case_types_with_camel_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "create-match",
            "game": "X01",
            "mode": "bestof",
            "value": 3,
            "startingScore": 501
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::CreateMatch {
                game: "X01".into(),
                mode: MatchMode::Bestof,
                value: 3,
                starting_score: 501,
                require_calibration: false,
                allow_spectators: true,
            }
        );
    }

    #[test]
    fn auto_visit_defaults() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "auto-visit",
            "roomId": "r1",
            "value": 50,
            "ring": "INNER_BULL",
            "boardPoint": { "x": 0.0, "y": 0.0 },
            "calibrationValid": true
        }))
        .unwrap();
        match msg {
            ClientMessage::AutoVisit { darts, sector, board_point, .. } => {
                assert_eq!(darts, 1);
                assert_eq!(sector, 0);
                assert_eq!(board_point, Some(BoardPoint::new(0.0, 0.0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_accepts_legacy_code_field() {
        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "join", "code": "ABC" })).unwrap();
        assert_eq!(msg, ClientMessage::Join { room_id: "ABC".into() });
    }

    #[test]
    fn unit_variants_and_unknown_types() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"list-matches"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ListMatches);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn known_types_with_bad_fields_are_invalid() {
        for text in [
            r#"{"type":"join-match"}"#,
            r#"{"type":"create-match","game":"X01"}"#,
            r#"{"type":"prestart-bull-throw","roomId":"r","score":-1}"#,
        ] {
            match parse_client(text) {
                Err(ParseFailure::Invalid(e)) => assert_eq!(e.code(), ErrorCode::BadRequest),
                other => panic!("{text}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn garbage_and_unknown_types_are_ignored() {
        for text in ["not json", "42", r#"{"roomId":"r"}"#, r#"{"type":"teleport"}"#, r#"{"type":7}"#] {
            assert!(
                matches!(parse_client(text), Err(ParseFailure::Ignored(_))),
                "{text} should be ignored"
            );
        }
        assert_eq!(parse_client(r#"{"type":"cam-create"}"#), Ok(ClientMessage::CamCreate));
    }

    #[test]
    fn every_listed_type_is_decodable() {
        for kind in CLIENT_TYPES {
            let err = parse_client(&json!({ "type": kind }).to_string());
            assert!(!matches!(err, Err(ParseFailure::Ignored(_))), "{kind} is not recognised");
        }
    }

    #[test]
    fn error_message_shape() {
        let msg = ServerMessage::from(&CoreError::forbidden("creator only"));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({ "type": "error", "code": "FORBIDDEN", "message": "creator only" }));
        assert_eq!(msg.kind(), "error");
    }
}
