use serde::{Deserialize, Serialize};

/// A physical dwelling identified by its composite key.
///
/// Keys come in two shapes:
/// - `building-section-room` (e.g. `9-1-3104`)
/// - `building-section-floor-room` (e.g. `9-1-31-3104`)
///
/// For the four-part shape the room is always the last segment and the third
/// segment is the floor. Anything else keeps building/section empty and uses
/// the whole key as the room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit {
    pub key: String,
    pub building: String,
    pub section: String,
    pub floor: Option<String>,
    pub room: String,
}

impl Unit {
    pub fn parse(key: &str) -> Self {
        let key = key.trim();
        let parts: Vec<&str> = key.split('-').map(str::trim).collect();
        let well_formed = parts.iter().all(|p| !p.is_empty());

        match parts.as_slice() {
            [building, section, room] if well_formed => Self {
                key: key.to_string(),
                building: building.to_string(),
                section: section.to_string(),
                floor: None,
                room: room.to_string(),
            },
            [building, section, floor, room] if well_formed => Self {
                key: key.to_string(),
                building: building.to_string(),
                section: section.to_string(),
                floor: Some(floor.to_string()),
                room: room.to_string(),
            },
            _ => Self {
                key: key.to_string(),
                building: String::new(),
                section: String::new(),
                floor: None,
                room: key.to_string(),
            },
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}
