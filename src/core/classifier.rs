//! Nearest-centroid color classification in CIE L*a*b*.
//!
//! Confidence is the relative separation between the nearest and the
//! second-nearest reference color, `1 - d1 / d2`, scaled by how uniform the
//! sampled window was. An exact match scores 1.0; a sample equidistant from
//! two references (orange vs red under warm light) scores 0.0 regardless of
//! how far it sits from either.

use crate::config::ClassifierConfig;
use crate::domain::model::{CanonicalColor, LabColor, TileClassification, TileSample};

/// Default sticker colors, sRGB.
pub const DEFAULT_REFERENCE: [(CanonicalColor, [u8; 3]); 6] = [
    (CanonicalColor::Red, [185, 0, 0]),
    (CanonicalColor::Green, [0, 155, 72]),
    (CanonicalColor::Blue, [0, 69, 173]),
    (CanonicalColor::Orange, [255, 89, 0]),
    (CanonicalColor::Yellow, [255, 213, 0]),
    (CanonicalColor::White, [255, 255, 255]),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub color: CanonicalColor,
    pub rgb: [u8; 3],
    pub lab: LabColor,
}

/// Read-only reference table; cheap to share across concurrent runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorClassifier {
    centroids: [Centroid; 6],
    lightness_weight: f32,
}

impl ColorClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let centroids = DEFAULT_REFERENCE.map(|(color, default_rgb)| {
            let rgb = config
                .reference
                .get(color.code())
                .copied()
                .unwrap_or(default_rgb);
            Centroid {
                color,
                rgb,
                lab: LabColor::from_rgb(rgb),
            }
        });

        Self {
            centroids,
            lightness_weight: config.lightness_weight,
        }
    }

    pub fn centroids(&self) -> &[Centroid; 6] {
        &self.centroids
    }

    pub fn centroid(&self, color: CanonicalColor) -> &Centroid {
        // DEFAULT_REFERENCE holds every color, in ALL order
        &self.centroids[CanonicalColor::ALL
            .iter()
            .position(|c| *c == color)
            .unwrap_or_default()]
    }

    pub fn classify(&self, sample: &TileSample) -> TileClassification {
        let mut nearest = (self.centroids[0].color, f32::INFINITY);
        let mut second = (self.centroids[0].color, f32::INFINITY);

        for centroid in &self.centroids {
            let d = sample.lab.distance(&centroid.lab, self.lightness_weight);
            if d < nearest.1 {
                second = nearest;
                nearest = (centroid.color, d);
            } else if d < second.1 {
                second = (centroid.color, d);
            }
        }

        let separation = separation_confidence(nearest.1, second.1);
        TileClassification {
            position: sample.position,
            color: nearest.0,
            runner_up: second.0,
            nearest_distance: nearest.1,
            second_distance: second.1,
            confidence: (separation * sample.sample_confidence).clamp(0.0, 1.0),
        }
    }

    pub fn classify_all(&self, samples: &[TileSample; 9]) -> [TileClassification; 9] {
        samples.map(|sample| self.classify(&sample))
    }
}

impl Default for ColorClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

/// `1 - d1 / d2`, clamped to [0, 1]. Two coincident references give 0.
pub fn separation_confidence(nearest: f32, second: f32) -> f32 {
    if second.is_nan() || second <= 0.0 || second.is_infinite() {
        return 0.0;
    }
    (1.0 - nearest / second).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::TilePosition;

    fn sample(rgb: [u8; 3]) -> TileSample {
        TileSample {
            position: TilePosition::Center,
            rgb,
            lab: LabColor::from_rgb(rgb),
            sample_confidence: 1.0,
        }
    }

    #[test]
    fn reference_colors_classify_to_themselves_with_full_confidence() {
        let classifier = ColorClassifier::default();
        for (color, rgb) in DEFAULT_REFERENCE {
            let result = classifier.classify(&sample(rgb));
            assert_eq!(result.color, color);
            assert_eq!(result.confidence, 1.0);
            assert_ne!(result.runner_up, color);
        }
    }

    #[test]
    fn slightly_off_colors_still_classify() {
        let classifier = ColorClassifier::default();
        assert_eq!(classifier.classify(&sample([170, 20, 25])).color, CanonicalColor::Red);
        assert_eq!(classifier.classify(&sample([240, 200, 30])).color, CanonicalColor::Yellow);
        assert_eq!(classifier.classify(&sample([230, 230, 225])).color, CanonicalColor::White);
        assert_eq!(classifier.classify(&sample([20, 80, 160])).color, CanonicalColor::Blue);
    }

    #[test]
    fn confidence_drops_between_red_and_orange() {
        let classifier = ColorClassifier::default();
        let red = classifier.classify(&sample([185, 0, 0])).confidence;
        let between = classifier.classify(&sample([220, 45, 0])).confidence;
        assert!(between < red);
        assert!(between < 0.6);
    }

    #[test]
    fn non_uniform_sample_scales_confidence() {
        let classifier = ColorClassifier::default();
        let mut s = sample([0, 155, 72]);
        s.sample_confidence = 0.5;
        assert_eq!(classifier.classify(&s).confidence, 0.5);
    }

    #[test]
    fn reference_override_moves_a_centroid() {
        let mut config = ClassifierConfig::default();
        config.reference.insert("W".to_string(), [200, 200, 200]);
        let classifier = ColorClassifier::new(&config);

        assert_eq!(classifier.centroid(CanonicalColor::White).rgb, [200, 200, 200]);
        assert_eq!(classifier.classify(&sample([200, 200, 200])).confidence, 1.0);
    }

    #[test]
    fn classification_is_deterministic() {
        let classifier = ColorClassifier::default();
        let s = sample([123, 77, 201]);
        let first = classifier.classify(&s);
        for _ in 0..10 {
            assert_eq!(classifier.classify(&s), first);
        }
    }

    #[test]
    fn separation_handles_degenerate_distances() {
        assert_eq!(separation_confidence(0.0, 0.0), 0.0);
        assert_eq!(separation_confidence(5.0, 10.0), 0.5);
        assert_eq!(separation_confidence(1.0, f32::INFINITY), 0.0);
    }
}
