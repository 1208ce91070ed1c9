// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Node layout versions
// Every on-disk node carries the tag of the layout it was written with. The engine reads every known layout and writes only the layout configured for the environment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Known on-disk node layouts, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum LayoutVersion {
    /// Little-endian lengths, additive checksum, no LSN stamp
    V4,
    /// Big-endian lengths with an LSN stamp
    V5,
    /// Serde-encoded node body with an LSN stamp
    #[default]
    V6,
}

impl LayoutVersion {
    /// The layout written by this release.
    pub const CURRENT: LayoutVersion = LayoutVersion::V6;

    /// All layouts this release can decode.
    pub const ALL: [LayoutVersion; 3] = [LayoutVersion::V4, LayoutVersion::V5, LayoutVersion::V6];

    /// Numeric tag stored in block headers.
    pub fn tag(self) -> u16 {
        match self {
            LayoutVersion::V4 => 4,
            LayoutVersion::V5 => 5,
            LayoutVersion::V6 => 6,
        }
    }

    /// Maps a stored tag back to a layout; unknown tags yield `None`.
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            4 => Some(LayoutVersion::V4),
            5 => Some(LayoutVersion::V5),
            6 => Some(LayoutVersion::V6),
            _ => None,
        }
    }

    pub fn is_current(self) -> bool {
        self == Self::CURRENT
    }
}

impl fmt::Display for LayoutVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for version in LayoutVersion::ALL {
            assert_eq!(LayoutVersion::from_tag(version.tag()), Some(version));
        }
        assert_eq!(LayoutVersion::from_tag(3), None);
        assert_eq!(LayoutVersion::from_tag(7), None);
    }

    #[test]
    fn test_ordering_follows_age() {
        assert!(LayoutVersion::V4 < LayoutVersion::V5);
        assert!(LayoutVersion::V5 < LayoutVersion::CURRENT);
        assert!(LayoutVersion::default().is_current());
    }
}
