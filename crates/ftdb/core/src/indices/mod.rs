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

// Ordered index structures over the node store

pub mod b_plus_tree;
pub mod lib;
pub mod secondary_key;

// Public exports
pub use b_plus_tree::{BPlusTree, TreeReader, TreeWriter, VerifyReport};
pub use lib::{ApplyOutcome, BYTEWISE, Comparator, ComparatorRegistry, Direction, SeekBound, bytewise};
