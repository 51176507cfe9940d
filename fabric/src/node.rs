// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate of a node in the mesh.
///
/// Row `rows` (one past the last mesh row) addresses the egress row where
/// the aggregators live.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct NodeId {
    pub row: usize,
    pub column: usize,
}

impl NodeId {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }

    /// Index of the node in a row-major flat array of `columns` columns.
    pub fn linearize(&self, columns: usize) -> usize {
        self.row * columns + self.column
    }

    pub fn delinearize(index: usize, columns: usize) -> Self {
        Self {
            row: index / columns,
            column: index % columns,
        }
    }

    /// The neighbor in `direction`, if it does not fall off the top/left edge.
    /// The caller checks the bottom/right bounds.
    pub fn step(&self, direction: Direction) -> Option<Self> {
        match direction {
            Direction::North => self.row.checked_sub(1).map(|row| Self::new(row, self.column)),
            Direction::East => Some(Self::new(self.row, self.column + 1)),
            Direction::South => Some(Self::new(self.row + 1, self.column)),
            Direction::West => self
                .column
                .checked_sub(1)
                .map(|column| Self::new(self.row, column)),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.column)
    }
}

/// Compass port of a node. The discriminants double as port numbers and as
/// the source order of the inbound arbiter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum Direction {
    North = 0,
    East = 1,
    South = 2,
    West = 3,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::East => Direction::West,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Direction::North => "north",
            Direction::East => "east",
            Direction::South => "south",
            Direction::West => "west",
        };
        write!(f, "{}", name)
    }
}
