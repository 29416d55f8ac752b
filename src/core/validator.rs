//! The single place that decides whether a mapping is a legal cube face.
//!
//! Both classification paths hand over a plain [`FaceCandidate`]; nothing
//! reaches the caller as a [`CubeFace`] without passing through here.

use crate::domain::model::{CanonicalColor, CubeFace, FaceCandidate, TilePosition};
use crate::utils::error::Violation;

pub fn validate(candidate: &FaceCandidate) -> Result<CubeFace, Violation> {
    let mut colors: [Option<CanonicalColor>; 9] = [None; 9];

    for (key, value) in &candidate.entries {
        let position =
            TilePosition::from_key(key).ok_or_else(|| Violation::UnknownPosition(key.clone()))?;
        let color = CanonicalColor::from_code(value).ok_or_else(|| Violation::UnknownColor {
            position: key.clone(),
            value: value.clone(),
        })?;

        let slot = &mut colors[position.index()];
        if slot.is_some() {
            return Err(Violation::DuplicatePosition(position));
        }
        *slot = Some(color);
    }

    let mut face = [CanonicalColor::White; 9];
    for position in TilePosition::ALL {
        face[position.index()] =
            colors[position.index()].ok_or(Violation::MissingPosition(position))?;
    }

    Ok(CubeFace::from_colors(face))
}
