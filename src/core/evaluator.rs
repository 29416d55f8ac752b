//! Accept/escalate decision over the nine CV confidences.
//!
//! Two checks, both inclusive: the weakest tile must reach `thresholds.tile`
//! and the mean must reach `thresholds.global`. The min check stops one
//! ambiguous tile from hiding behind eight easy ones; the mean check catches
//! uniformly mediocre faces where no single tile fails.

use crate::config::Thresholds;
use crate::domain::model::{CubeFace, TileClassification, TilePosition};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceSummary {
    pub min: f32,
    pub mean: f32,
    pub weakest: TilePosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    WeakTile { tile: TilePosition, confidence: f32 },
    LowMean { mean: f32 },
    WeakTileAndLowMean { tile: TilePosition, confidence: f32, mean: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accept {
        face: CubeFace,
        summary: ConfidenceSummary,
    },
    Escalate {
        summary: ConfidenceSummary,
        reason: EscalationReason,
    },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }

    pub fn summary(&self) -> &ConfidenceSummary {
        match self {
            Verdict::Accept { summary, .. } | Verdict::Escalate { summary, .. } => summary,
        }
    }
}

/// Min, mean and the weakest tile (first in position order on ties).
pub fn summarize(confidences: &[f32; 9]) -> ConfidenceSummary {
    let mut weakest = 0;
    for (i, c) in confidences.iter().enumerate() {
        if *c < confidences[weakest] {
            weakest = i;
        }
    }
    let sum: f32 = confidences.iter().sum();

    ConfidenceSummary {
        min: confidences[weakest],
        mean: sum / 9.0,
        weakest: TilePosition::ALL[weakest],
    }
}

pub fn evaluate(confidences: &[f32; 9], thresholds: &Thresholds) -> Option<EscalationReason> {
    let summary = summarize(confidences);
    let tile_ok = summary.min >= thresholds.tile;
    let mean_ok = summary.mean >= thresholds.global;

    match (tile_ok, mean_ok) {
        (true, true) => None,
        (false, true) => Some(EscalationReason::WeakTile {
            tile: summary.weakest,
            confidence: summary.min,
        }),
        (true, false) => Some(EscalationReason::LowMean { mean: summary.mean }),
        (false, false) => Some(EscalationReason::WeakTileAndLowMean {
            tile: summary.weakest,
            confidence: summary.min,
            mean: summary.mean,
        }),
    }
}

pub fn tile_confidences(classifications: &[TileClassification; 9]) -> [f32; 9] {
    classifications.map(|c| c.confidence)
}

/// Decide from classified tiles, producing the accepted face when trusted.
pub fn decide(classifications: &[TileClassification; 9], thresholds: &Thresholds) -> Verdict {
    let confidences = tile_confidences(classifications);
    let summary = summarize(&confidences);

    match evaluate(&confidences, thresholds) {
        None => Verdict::Accept {
            face: CubeFace::from_colors(classifications.map(|c| c.color)),
            summary,
        },
        Some(reason) => Verdict::Escalate { summary, reason },
    }
}
