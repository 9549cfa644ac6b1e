//! Crash-point derivation and the multiplier climb law.
//!
//! A cycle's crash point is fixed at creation: four CSPRNG bytes are hashed
//! together with the draw timestamp, so the stored seed and timestamp fully
//! determine the outcome and any cycle row can be re-verified after the
//! fact. The jitter factor comes out of the same hash for the same reason.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::money::Multiplier;

/// Lowest possible crash point, 1.10x.
pub const CRASH_MIN: Multiplier = Multiplier::from_hundredths(110);
/// Highest possible crash point, 50.00x.
pub const CRASH_MAX: Multiplier = Multiplier::from_hundredths(5000);
/// Shape exponent applied to −ln u.
const CRASH_SHAPE: f64 = 0.7;
/// Per-second growth rate of the climb law.
pub const BASE_RATE: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct CrashDraw {
    pub seed: [u8; 4],
    pub hash: [u8; 32],
    pub crash_point: Multiplier,
}

/// Draw a fresh crash point for a new cycle.
pub fn draw_crash_point(rng: &mut (impl RngCore + ?Sized), drawn_at_ms: i64) -> CrashDraw {
    let mut seed = [0u8; 4];
    rng.fill_bytes(&mut seed);
    let (hash, crash_point) = derive_crash_point(&seed, drawn_at_ms);
    CrashDraw { seed, hash, crash_point }
}

/// Pure derivation from a stored seed and draw timestamp.
///
/// The first eight hash bytes map to u ∈ (0,1], shaped by (−ln u)^0.7 and a
/// jitter in [0.75, 1.25] taken from hash bytes 8..12, then clamped to
/// [CRASH_MIN, CRASH_MAX] and quantised to hundredths.
pub fn derive_crash_point(seed: &[u8; 4], drawn_at_ms: i64) -> ([u8; 32], Multiplier) {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(drawn_at_ms.to_le_bytes());
    let hash: [u8; 32] = hasher.finalize().into();

    let mut draw = [0u8; 8];
    draw.copy_from_slice(&hash[0..8]);
    let raw = u64::from_le_bytes(draw);
    let u = (raw as f64 + 1.0) / (u64::MAX as f64 + 1.0);

    let mut jitter = [0u8; 4];
    jitter.copy_from_slice(&hash[8..12]);
    let v = 0.75 + (u32::from_le_bytes(jitter) as f64 / u32::MAX as f64) * 0.5;

    let point = CRASH_MIN.to_major() * (-u.ln()).powf(CRASH_SHAPE) * v;
    let hundredths = (point * 100.0).floor() as i64;
    let clamped = hundredths.clamp(CRASH_MIN.hundredths() as i64, CRASH_MAX.hundredths() as i64);
    (hash, Multiplier::from_hundredths(clamped as u32))
}

/// One step of the climb law: M(t+Δ) = M(t) + (Δ/1000) · BASE_RATE · M(t).
///
/// Monotone for any positive Δ, and the time from 1.00 to C grows with
/// ln(C), so every finite crash point is reached in finite time.
pub fn advance_multiplier(current: f64, elapsed_ms: u64) -> f64 {
    current + (elapsed_ms as f64 / 1000.0) * BASE_RATE * current
}
