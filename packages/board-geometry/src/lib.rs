//! # board-geometry
//!
//! Fixed dartboard geometry and the point → score oracle.
//!
//! These types are used by:
//! - `backend-rust`: re-deriving a dart's score from a client-reported board
//!   point before an autocommit visit is trusted
//! - camera clients: mapping detected tip positions to scores with the same
//!   radii and sector layout the server checks against
//!
//! ## Coordinate Conventions
//!
//! - Board plane, millimetres, origin at the centre of the bull
//! - +X to the right, +Y towards the bottom of the board (image convention)
//! - Angles measured clockwise from the top of the board (the middle of 20)

use serde::{Deserialize, Serialize};

// ── Board Dimensions (WDF regulation, mm) ─────────────────────────────────────

pub const INNER_BULL_RADIUS: f64 = 6.35;
pub const OUTER_BULL_RADIUS: f64 = 15.9;
pub const TREBLE_INNER_RADIUS: f64 = 99.0;
pub const TREBLE_OUTER_RADIUS: f64 = 107.0;
pub const DOUBLE_INNER_RADIUS: f64 = 162.0;
pub const DOUBLE_OUTER_RADIUS: f64 = 170.0;

/// Clockwise sector numbers starting at the top of the board.
pub const SECTOR_ORDER: [u8; 20] = [
    20, 1, 18, 4, 13, 6, 10, 15, 2, 17, 3, 19, 7, 16, 8, 11, 14, 9, 12, 5,
];

/// Angular width of one sector in degrees.
pub const SECTOR_WIDTH_DEG: f64 = 18.0;

/// Sector number reported for both bull rings.
pub const BULL_SECTOR: u8 = 25;

// ── Types ─────────────────────────────────────────────────────────────────────

/// A point on the board plane, in millimetres relative to the centre.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardPoint {
    pub x: f64,
    pub y: f64,
}

impl BoardPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn radius(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Angle in degrees, clockwise from the top of the board, in `[0, 360)`.
    pub fn angle_deg(&self) -> f64 {
        // atan2(x, -y): 0 at top, growing clockwise because +Y points down.
        let deg = self.x.atan2(-self.y).to_degrees();
        let norm = deg.rem_euclid(360.0);
        // rem_euclid can round up to exactly 360.0 for tiny negative inputs
        if norm >= 360.0 { 0.0 } else { norm }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ring {
    Miss,
    Single,
    Double,
    Triple,
    Bull,
    InnerBull,
}

impl Ring {
    /// Both bull rings score without a sector.
    pub fn is_bull(&self) -> bool {
        matches!(self, Ring::Bull | Ring::InnerBull)
    }
}

/// Score of a single dart.
///
/// `base` is the points the dart is worth (sector × multiplier, 25 for the
/// outer bull, 50 for the inner bull, 0 for a miss).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub base: u32,
    pub ring: Ring,
    /// 1..=20, 25 for either bull, 0 for a miss.
    pub sector: u8,
    pub multiplier: u8,
}

impl ScoreResult {
    pub const MISS: ScoreResult = ScoreResult {
        base: 0,
        ring: Ring::Miss,
        sector: 0,
        multiplier: 0,
    };
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Sector number for an angle measured clockwise from the top of the board.
///
/// Each sector is centred on its nominal direction, so the 20 spans
/// `[-9°, 9°)`. A point exactly on a wire resolves to the clockwise sector.
pub fn sector_at(angle_deg: f64) -> u8 {
    let shifted = (angle_deg + SECTOR_WIDTH_DEG / 2.0).rem_euclid(360.0);
    let idx = (shifted / SECTOR_WIDTH_DEG).floor() as usize % SECTOR_ORDER.len();
    SECTOR_ORDER[idx]
}

/// Map a board point to the score a dart landing there is worth.
///
/// Non-finite coordinates are treated as a miss.
pub fn score_at(point: BoardPoint) -> ScoreResult {
    if !point.is_finite() {
        return ScoreResult::MISS;
    }

    let r = point.radius();
    if r > DOUBLE_OUTER_RADIUS {
        return ScoreResult::MISS;
    }
    if r <= INNER_BULL_RADIUS {
        return ScoreResult {
            base: 50,
            ring: Ring::InnerBull,
            sector: BULL_SECTOR,
            multiplier: 2,
        };
    }
    if r <= OUTER_BULL_RADIUS {
        return ScoreResult {
            base: 25,
            ring: Ring::Bull,
            sector: BULL_SECTOR,
            multiplier: 1,
        };
    }

    let sector = sector_at(point.angle_deg());
    let (ring, multiplier) = if (TREBLE_INNER_RADIUS..=TREBLE_OUTER_RADIUS).contains(&r) {
        (Ring::Triple, 3)
    } else if r >= DOUBLE_INNER_RADIUS {
        (Ring::Double, 2)
    } else {
        (Ring::Single, 1)
    };

    ScoreResult {
        base: sector as u32 * multiplier as u32,
        ring,
        sector,
        multiplier,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn polar(radius: f64, angle_deg: f64) -> BoardPoint {
        let a = angle_deg.to_radians();
        BoardPoint::new(radius * a.sin(), -radius * a.cos())
    }

    #[test]
    fn inner_bull_anywhere_inside_radius() {
        for angle in (0..360).step_by(15) {
            for r in [0.0, 1.0, 3.2, 6.3] {
                let s = score_at(polar(r, angle as f64));
                assert_eq!(s.base, 50);
                assert_eq!(s.ring, Ring::InnerBull);
                assert_eq!(s.multiplier, 2);
            }
        }
    }

    #[test]
    fn outer_bull_scores_25() {
        let s = score_at(polar(10.0, 123.0));
        assert_eq!(s, ScoreResult { base: 25, ring: Ring::Bull, sector: 25, multiplier: 1 });
    }

    #[test]
    fn beyond_double_is_miss() {
        for angle in (0..360).step_by(7) {
            let s = score_at(polar(170.5, angle as f64));
            assert_eq!(s, ScoreResult::MISS);
            assert_eq!(score_at(polar(400.0, angle as f64)).multiplier, 0);
        }
    }

    #[test]
    fn top_of_board_is_twenty() {
        assert_eq!(score_at(BoardPoint::new(0.0, -50.0)).sector, 20);
        assert_eq!(score_at(BoardPoint::new(50.0, 0.0)).sector, 6);
        assert_eq!(score_at(BoardPoint::new(0.0, 50.0)).sector, 3);
        assert_eq!(score_at(BoardPoint::new(-50.0, 0.0)).sector, 11);
    }

    #[test]
    fn treble_and_double_bands() {
        let t20 = score_at(polar(103.0, 0.0));
        assert_eq!(t20, ScoreResult { base: 60, ring: Ring::Triple, sector: 20, multiplier: 3 });

        let d16 = score_at(polar(166.0, 13.0 * 18.0));
        assert_eq!(d16, ScoreResult { base: 32, ring: Ring::Double, sector: 16, multiplier: 2 });

        let s5 = score_at(polar(140.0, 19.0 * 18.0));
        assert_eq!(s5, ScoreResult { base: 5, ring: Ring::Single, sector: 5, multiplier: 1 });
    }

    #[test]
    fn sectors_follow_clockwise_order() {
        for (i, expected) in SECTOR_ORDER.iter().enumerate() {
            let centre = i as f64 * SECTOR_WIDTH_DEG;
            assert_eq!(score_at(polar(60.0, centre)).sector, *expected, "sector index {i}");
        }
    }

    #[test]
    fn sector_assignment_is_periodic_in_18_degrees() {
        // Rotating by one sector width always moves to the next sector in order,
        // including points sitting exactly on a wire.
        for offset in [-9.0, -4.5, 0.0, 3.3, 8.999] {
            for i in 0..20 {
                let a = i as f64 * SECTOR_WIDTH_DEG + offset;
                let here = sector_at(a);
                let next = sector_at(a + SECTOR_WIDTH_DEG);
                let pos = SECTOR_ORDER.iter().position(|s| *s == here).unwrap();
                assert_eq!(next, SECTOR_ORDER[(pos + 1) % 20]);
            }
        }
    }

    #[test]
    fn wire_resolves_to_single_sector() {
        // 9° is the 20/1 wire: it belongs to 1, never to both.
        assert_eq!(sector_at(9.0), 1);
        assert_eq!(sector_at(8.9999), 20);
        assert_eq!(sector_at(-9.0), 20);
        assert_eq!(sector_at(351.0), 20);
    }

    #[test]
    fn malformed_input_is_miss() {
        assert_eq!(score_at(BoardPoint::new(f64::NAN, 0.0)), ScoreResult::MISS);
        assert_eq!(score_at(BoardPoint::new(0.0, f64::INFINITY)), ScoreResult::MISS);
    }

    #[test]
    fn ring_serializes_screaming_snake() {
        let json = serde_json::to_string(&Ring::InnerBull).unwrap();
        assert_eq!(json, "\"INNER_BULL\"");
        let back: Ring = serde_json::from_str("\"TRIPLE\"").unwrap();
        assert_eq!(back, Ring::Triple);
    }
}
