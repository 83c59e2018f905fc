//! # autocommit
//!
//! Server-side check of camera-derived dart scores.
//!
//! Clients detect darts on-device and claim a score together with the board
//! point it came from. The server re-derives the score from that point with
//! the fixed board geometry and only broadcasts the visit when the two agree.
//! The room owner and admins bypass the geometric proof so a host can still
//! enter scores by hand for camera-less play.

use std::time::Duration;

use board_geometry::{score_at, BoardPoint, Ring, DOUBLE_OUTER_RADIUS};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::CoreError;
use crate::rooms::Room;
use crate::sessions::ConnId;

/// A dart score as claimed by the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct VisitClaim {
    pub value: u32,
    pub darts: u8,
    pub ring: Ring,
    pub sector: u8,
    pub board_point: Option<BoardPoint>,
    pub calibration_valid: bool,
}

/// What the validator needs to know about the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderFacts {
    pub conn: ConnId,
    pub is_owner: bool,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    pub by: ConnId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_name: Option<String>,
    pub value: u32,
    pub darts: u8,
    pub ring: Ring,
    pub sector: u8,
    pub timestamp: i64,
    pub board_point: BoardPoint,
}

/// Identity of a committed visit, used to drop replays.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitKey {
    pub by: ConnId,
    pub value: u32,
    pub ring: Ring,
    pub sector: u8,
    pub board_point: BoardPoint,
    pub at: Instant,
}

impl CommitKey {
    fn same_visit(&self, other: &CommitKey) -> bool {
        self.by == other.by
            && self.value == other.value
            && self.ring == other.ring
            && self.sector == other.sector
            && self.board_point == other.board_point
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Commit(VisitRecord),
    /// Identical to the room's last commit inside the replay window.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct AutocommitValidator {
    pub radius_tolerance_mm: f64,
    pub dedup_window: Duration,
}

impl AutocommitValidator {
    pub fn new(radius_tolerance_mm: f64, dedup_window: Duration) -> Self {
        Self {
            radius_tolerance_mm,
            dedup_window,
        }
    }

    /// Decide whether `claim` may be broadcast to `room`.
    ///
    /// On success the room's replay key is updated and the visit record to
    /// broadcast is returned.
    pub fn validate(
        &self,
        room: Option<&mut Room>,
        sender: SenderFacts,
        sender_name: Option<String>,
        claim: &VisitClaim,
        now: Instant,
        timestamp_ms: i64,
    ) -> Result<CommitOutcome, CoreError> {
        if !claim.calibration_valid {
            return Err(CoreError::bad_request("calibration is not valid"));
        }
        let point = claim
            .board_point
            .ok_or_else(|| CoreError::bad_request("boardPoint is required"))?;

        let room = room.ok_or_else(|| CoreError::not_found("room"))?;
        let trusted = sender.is_owner || sender.is_admin;
        if !trusted && !room.autocommit_allowed {
            return Err(CoreError::forbidden("autocommit is not enabled for this room"));
        }

        if !trusted {
            self.check_geometry(point, claim)?;
        }

        if !room.contains(sender.conn) {
            return Err(CoreError::forbidden("not a member of this room"));
        }

        let key = CommitKey {
            by: sender.conn,
            value: claim.value,
            ring: claim.ring,
            sector: claim.sector,
            board_point: point,
            at: now,
        };
        if let Some(last) = &room.last_commit {
            if last.same_visit(&key) && now.saturating_duration_since(last.at) < self.dedup_window {
                return Ok(CommitOutcome::Duplicate);
            }
        }
        room.last_commit = Some(key);

        Ok(CommitOutcome::Commit(VisitRecord {
            by: sender.conn,
            by_name: sender_name,
            value: claim.value,
            darts: claim.darts,
            ring: claim.ring,
            sector: claim.sector,
            timestamp: timestamp_ms,
            board_point: point,
        }))
    }

    fn check_geometry(&self, point: BoardPoint, claim: &VisitClaim) -> Result<(), CoreError> {
        if !point.is_finite() {
            return Err(CoreError::bad_payload("boardPoint is not a finite coordinate"));
        }
        let radius = point.radius();
        if radius > DOUBLE_OUTER_RADIUS + self.radius_tolerance_mm {
            return Err(CoreError::bad_payload(format!(
                "boardPoint is {radius:.1}mm from centre, outside the board"
            )));
        }

        let derived = score_at(point);
        let sector_matches = derived.ring.is_bull()
            || derived.ring == Ring::Miss
            || derived.sector == claim.sector;
        if derived.base != claim.value || derived.ring != claim.ring || !sector_matches {
            return Err(CoreError::bad_payload(format!(
                "claimed {} {:?} {} but boardPoint scores {} {:?} {}",
                claim.value, claim.ring, claim.sector, derived.base, derived.ring, derived.sector
            )));
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomManager;
    use crate::rate_limit::TokenBucket;
    use crate::sessions::SessionRegistry;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Fixture {
        rooms: RoomManager,
        owner: ConnId,
        guest: ConnId,
        outsider: ConnId,
        validator: AutocommitValidator,
    }

    fn fixture() -> Fixture {
        let mut sessions = SessionRegistry::new();
        let ids: Vec<ConnId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let (tx, _rx) = mpsc::unbounded_channel();
            sessions.register(*id, tx, TokenBucket::new(10, 10.0));
        }
        let mut rooms = RoomManager::new();
        rooms.join(&mut sessions, ids[0], "R", false);
        rooms.join(&mut sessions, ids[1], "R", false);
        Fixture {
            rooms,
            owner: ids[0],
            guest: ids[1],
            outsider: ids[2],
            validator: AutocommitValidator::new(5.0, Duration::from_millis(1500)),
        }
    }

    fn guest(f: &Fixture) -> SenderFacts {
        SenderFacts { conn: f.guest, is_owner: false, is_admin: false }
    }

    fn claim(value: u32, ring: Ring, sector: u8, point: (f64, f64)) -> VisitClaim {
        VisitClaim {
            value,
            darts: 1,
            ring,
            sector,
            board_point: Some(BoardPoint::new(point.0, point.1)),
            calibration_valid: true,
        }
    }

    fn run(f: &mut Fixture, who: SenderFacts, c: &VisitClaim) -> Result<CommitOutcome, CoreError> {
        f.validator.validate(f.rooms.get_mut("R"), who, None, c, Instant::now(), 0)
    }

    #[test]
    fn agreement_is_accepted() {
        let mut f = fixture();
        f.rooms.get_mut("R").unwrap().autocommit_allowed = true;
        let who = guest(&f);
        // treble 20, straight up
        let out = run(&mut f, who, &claim(60, Ring::Triple, 20, (0.0, -103.0))).unwrap();
        match out {
            CommitOutcome::Commit(v) => {
                assert_eq!(v.by, f.guest);
                assert_eq!(v.value, 60);
            }
            CommitOutcome::Duplicate => panic!("first visit is not a duplicate"),
        }
    }

    #[test]
    fn disagreement_is_bad_payload() {
        let mut f = fixture();
        f.rooms.get_mut("R").unwrap().autocommit_allowed = true;
        let who = guest(&f);
        for c in [
            claim(60, Ring::Triple, 20, (0.0, -140.0)),
            claim(60, Ring::Triple, 1, (0.0, -103.0)),
            claim(20, Ring::Triple, 20, (0.0, -103.0)),
        ] {
            let err = run(&mut f, who, &c).unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::BadPayload);
        }
    }

    #[test]
    fn bull_ignores_claimed_sector() {
        let mut f = fixture();
        f.rooms.get_mut("R").unwrap().autocommit_allowed = true;
        let who = guest(&f);
        for sector in [0, 7, 20, 25] {
            let c = claim(50, Ring::InnerBull, sector, (0.0, 0.0));
            f.rooms.get_mut("R").unwrap().last_commit = None;
            assert!(matches!(run(&mut f, who, &c), Ok(CommitOutcome::Commit(_))));
        }
    }

    #[test]
    fn spoofed_radius_is_rejected() {
        let mut f = fixture();
        f.rooms.get_mut("R").unwrap().autocommit_allowed = true;
        let who = guest(&f);
        let err = run(&mut f, who, &claim(0, Ring::Miss, 0, (0.0, 180.0))).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BadPayload);
        // Just off the board but inside the tolerance is an honest miss.
        assert!(run(&mut f, who, &claim(0, Ring::Miss, 0, (0.0, 172.0))).is_ok());
    }

    #[test]
    fn needs_permission_unless_trusted() {
        let mut f = fixture();
        let who = guest(&f);
        let c = claim(60, Ring::Triple, 20, (0.0, -103.0));
        assert_eq!(run(&mut f, who, &c).unwrap_err().code(), crate::error::ErrorCode::Forbidden);

        // Owner bypasses both the permission flag and the geometry.
        let owner = SenderFacts { conn: f.owner, is_owner: true, is_admin: false };
        let manual = claim(57, Ring::Single, 19, (0.0, 0.0));
        assert!(matches!(run(&mut f, owner, &manual), Ok(CommitOutcome::Commit(_))));
    }

    #[test]
    fn admin_outside_room_is_still_rejected() {
        let mut f = fixture();
        let admin = SenderFacts { conn: f.outsider, is_owner: false, is_admin: true };
        let c = claim(25, Ring::Bull, 25, (0.0, 10.0));
        assert_eq!(run(&mut f, admin, &c).unwrap_err().code(), crate::error::ErrorCode::Forbidden);
    }

    #[test]
    fn calibration_and_point_are_required() {
        let mut f = fixture();
        f.rooms.get_mut("R").unwrap().autocommit_allowed = true;
        let who = guest(&f);
        let mut c = claim(50, Ring::InnerBull, 25, (0.0, 0.0));
        c.calibration_valid = false;
        assert_eq!(run(&mut f, who, &c).unwrap_err().code(), crate::error::ErrorCode::BadRequest);

        let mut c = claim(50, Ring::InnerBull, 25, (0.0, 0.0));
        c.board_point = None;
        assert_eq!(run(&mut f, who, &c).unwrap_err().code(), crate::error::ErrorCode::BadRequest);
    }

    #[test]
    fn replay_inside_window_is_duplicate() {
        let mut f = fixture();
        f.rooms.get_mut("R").unwrap().autocommit_allowed = true;
        let who = guest(&f);
        let c = claim(50, Ring::InnerBull, 25, (1.0, 1.0));
        let t0 = Instant::now();
        let v = &f.validator;
        assert!(matches!(
            v.validate(f.rooms.get_mut("R"), who, None, &c, t0, 0),
            Ok(CommitOutcome::Commit(_))
        ));
        assert_eq!(
            v.validate(f.rooms.get_mut("R"), who, None, &c, t0 + Duration::from_millis(10), 0),
            Ok(CommitOutcome::Duplicate)
        );
        // Same dart value again later is a new visit.
        assert!(matches!(
            v.validate(f.rooms.get_mut("R"), who, None, &c, t0 + Duration::from_secs(2), 0),
            Ok(CommitOutcome::Commit(_))
        ));
    }

    #[test]
    fn missing_room_is_not_found() {
        let f = fixture();
        let who = guest(&f);
        let err = f
            .validator
            .validate(None, who, None, &claim(50, Ring::InnerBull, 25, (0.0, 0.0)), Instant::now(), 0)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }
}
