use palette::{FromColor, Lab, LinSrgb, Srgb};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// The six sticker colors of a standard cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CanonicalColor {
    #[serde(rename = "R")]
    Red,
    #[serde(rename = "G")]
    Green,
    #[serde(rename = "B")]
    Blue,
    #[serde(rename = "O")]
    Orange,
    #[serde(rename = "Y")]
    Yellow,
    #[serde(rename = "W")]
    White,
}

impl CanonicalColor {
    pub const ALL: [CanonicalColor; 6] = [
        CanonicalColor::Red,
        CanonicalColor::Green,
        CanonicalColor::Blue,
        CanonicalColor::Orange,
        CanonicalColor::Yellow,
        CanonicalColor::White,
    ];

    pub fn code(self) -> &'static str {
        match self {
            CanonicalColor::Red => "R",
            CanonicalColor::Green => "G",
            CanonicalColor::Blue => "B",
            CanonicalColor::Orange => "O",
            CanonicalColor::Yellow => "Y",
            CanonicalColor::White => "W",
        }
    }

    /// Exact, case-sensitive lookup of a one-letter code.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            CanonicalColor::Red => "red",
            CanonicalColor::Green => "green",
            CanonicalColor::Blue => "blue",
            CanonicalColor::Orange => "orange",
            CanonicalColor::Yellow => "yellow",
            CanonicalColor::White => "white",
        }
    }
}

impl fmt::Display for CanonicalColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One cell of the 3x3 face grid, in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TilePosition {
    #[serde(rename = "TL")]
    TopLeft,
    #[serde(rename = "TC")]
    TopCenter,
    #[serde(rename = "TR")]
    TopRight,
    #[serde(rename = "ML")]
    MidLeft,
    #[serde(rename = "C")]
    Center,
    #[serde(rename = "MR")]
    MidRight,
    #[serde(rename = "BL")]
    BottomLeft,
    #[serde(rename = "BC")]
    BottomCenter,
    #[serde(rename = "BR")]
    BottomRight,
}

impl TilePosition {
    pub const ALL: [TilePosition; 9] = [
        TilePosition::TopLeft,
        TilePosition::TopCenter,
        TilePosition::TopRight,
        TilePosition::MidLeft,
        TilePosition::Center,
        TilePosition::MidRight,
        TilePosition::BottomLeft,
        TilePosition::BottomCenter,
        TilePosition::BottomRight,
    ];

    pub fn key(self) -> &'static str {
        match self {
            TilePosition::TopLeft => "TL",
            TilePosition::TopCenter => "TC",
            TilePosition::TopRight => "TR",
            TilePosition::MidLeft => "ML",
            TilePosition::Center => "C",
            TilePosition::MidRight => "MR",
            TilePosition::BottomLeft => "BL",
            TilePosition::BottomCenter => "BC",
            TilePosition::BottomRight => "BR",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.key() == key)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn row(self) -> u32 {
        (self.index() / 3) as u32
    }

    pub fn col(self) -> u32 {
        (self.index() % 3) as u32
    }
}

impl fmt::Display for TilePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A validated face: every position present exactly once with a canonical color.
///
/// The only ways to obtain one are [`CubeFace::from_colors`] (already total by
/// construction) and the validator, so holding a `CubeFace` means the
/// invariant holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CubeFace([CanonicalColor; 9]);

impl CubeFace {
    /// Colors in `TilePosition::ALL` order.
    pub fn from_colors(colors: [CanonicalColor; 9]) -> Self {
        Self(colors)
    }

    pub fn get(&self, position: TilePosition) -> CanonicalColor {
        self.0[position.index()]
    }

    pub fn colors(&self) -> &[CanonicalColor; 9] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (TilePosition, CanonicalColor)> + '_ {
        TilePosition::ALL.into_iter().zip(self.0.iter().copied())
    }

}

impl Serialize for CubeFace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(9))?;
        for (position, color) in self.iter() {
            map.serialize_entry(position.key(), color.code())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for CubeFace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let candidate = FaceCandidate::deserialize(deserializer)?;
        crate::core::validator::validate(&candidate).map_err(de::Error::custom)
    }
}

impl fmt::Display for CubeFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..3 {
            if row > 0 {
                f.write_str(" / ")?;
            }
            for col in 0..3 {
                f.write_str(self.0[row * 3 + col].code())?;
            }
        }
        Ok(())
    }
}

/// Unchecked (key, value) pairs as produced by either classification path.
///
/// Deserializing keeps every entry of the source object, including repeated
/// keys, so the validator can see duplicates a plain map would hide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaceCandidate {
    pub entries: Vec<(String, String)>,
}

impl FaceCandidate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<&CubeFace> for FaceCandidate {
    fn from(face: &CubeFace) -> Self {
        let entries = face
            .iter()
            .map(|(p, c)| (p.key().to_string(), c.code().to_string()))
            .collect();
        Self { entries }
    }
}

impl FromIterator<(TilePosition, CanonicalColor)> for FaceCandidate {
    fn from_iter<I: IntoIterator<Item = (TilePosition, CanonicalColor)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(p, c)| (p.key().to_string(), c.code().to_string()))
            .collect();
        Self { entries }
    }
}

impl Serialize for FaceCandidate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FaceCandidate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = FaceCandidate;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping tile positions to color codes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(9));
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    entries.push((key, value));
                }
                Ok(FaceCandidate { entries })
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// CIE L*a*b* (D65) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabColor {
    pub l: f32,
    pub a: f32,
    pub b: f32,
}

impl LabColor {
    pub fn from_rgb(rgb: [u8; 3]) -> Self {
        let srgb: Srgb<f32> = Srgb::new(
            rgb[0] as f32 / 255.0,
            rgb[1] as f32 / 255.0,
            rgb[2] as f32 / 255.0,
        );
        let lin: LinSrgb<f32> = srgb.into_linear();
        let lab: Lab = Lab::from_color(lin);
        Self {
            l: lab.l,
            a: lab.a,
            b: lab.b,
        }
    }

    /// Weighted CIE76 distance; `lightness_weight` scales the L* axis.
    pub fn distance(&self, other: &LabColor, lightness_weight: f32) -> f32 {
        let dl = (self.l - other.l) * lightness_weight;
        let da = self.a - other.a;
        let db = self.b - other.b;
        (dl * dl + da * da + db * db).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TileSample {
    pub position: TilePosition,
    /// Per-channel median of the sampling window.
    pub rgb: [u8; 3],
    pub lab: LabColor,
    /// Share of window pixels close to the median, in [0, 1].
    pub sample_confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TileClassification {
    pub position: TilePosition,
    pub color: CanonicalColor,
    pub runner_up: CanonicalColor,
    pub nearest_distance: f32,
    pub second_distance: f32,
    /// Separation combined with sample uniformity, in [0, 1].
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Cv,
    Fallback,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Cv => f.write_str("cv"),
            Provenance::Fallback => f.write_str("fallback"),
        }
    }
}

/// States of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Start,
    Preprocessed,
    Sampled,
    Classified,
    Accepted,
    Escalated,
    FallbackRequested,
    FallbackParsed,
    Validated,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub face: CubeFace,
    /// CV confidences in `TilePosition::ALL` order. On the fallback path
    /// these are the confidences that caused the escalation.
    pub tile_confidences: [f32; 9],
    pub overall_confidence: f32,
    pub provenance: Provenance,
    pub stages: Vec<PipelineState>,
    pub elapsed_ms: u64,
}

/// Request half of a fallback exchange. The reply is the model's raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    pub model: String,
    pub prompt: String,
    pub image_base64: String,
}
