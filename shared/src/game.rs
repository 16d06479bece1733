//! Grid world model shared by every replica.
//!
//! All tables are `BTreeMap`s so iteration order, and therefore any
//! serialized snapshot, is identical on every node.

use crate::{BombId, ExplosionId, PlayerId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LevelError {
    #[error("level layout is empty")]
    Empty,
    #[error("row {row} has {found} cells, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("unknown tile {tile:?} at ({x}, {y})")]
    UnknownTile { tile: char, x: usize, y: usize },
    #[error("player {0} is spawned more than once")]
    DuplicatePlayer(PlayerId),
}

/// Dense row-major grid addressed by signed coordinates so that
/// neighbour arithmetic can step off the edge and be bounds-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid<T> {
    width: usize,
    height: usize,
    cells: Vec<T>,
}

impl<T: Clone> Grid<T> {
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            cells: vec![value; width * height],
        }
    }
}

impl<T> Grid<T> {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if self.contains(x, y) {
            Some(y as usize * self.width + x as usize)
        } else {
            None
        }
    }

    pub fn get(&self, x: i32, y: i32) -> Option<&T> {
        self.index(x, y).map(|i| &self.cells[i])
    }

    pub fn get_mut(&mut self, x: i32, y: i32) -> Option<&mut T> {
        self.index(x, y).map(move |i| &mut self.cells[i])
    }

    /// Returns false when the coordinate is outside the grid.
    pub fn set(&mut self, x: i32, y: i32, value: T) -> bool {
        match self.get_mut(x, y) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub x: i32,
    pub y: i32,
    pub moving: bool,
    pub alive: bool,
}

impl Player {
    pub fn new(id: PlayerId, x: i32, y: i32) -> Self {
        Self {
            id,
            x,
            y,
            moving: false,
            alive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bomb {
    pub id: BombId,
    pub x: i32,
    pub y: i32,
    pub owner: PlayerId,
    pub explode_tick: Tick,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explosion {
    pub id: ExplosionId,
    pub x: i32,
    pub y: i32,
    pub owner: PlayerId,
    pub expires_tick: Tick,
}

/// Authoritative world. Only the transition function mutates it.
///
/// A cell holds at most one of wall, player or bomb. Explosions overlay
/// any cell and are reference counted because blasts can overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub walls: Grid<bool>,
    pub player_grid: Grid<Option<PlayerId>>,
    pub bomb_grid: Grid<Option<BombId>>,
    pub explosion_grid: Grid<u16>,
    pub players: BTreeMap<PlayerId, Player>,
    pub bombs: BTreeMap<BombId, Bomb>,
    pub explosions: BTreeMap<ExplosionId, Explosion>,
    pub next_bomb_id: BombId,
    pub next_explosion_id: ExplosionId,
}

impl GameState {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            walls: Grid::filled(width, height, false),
            player_grid: Grid::filled(width, height, None),
            bomb_grid: Grid::filled(width, height, None),
            explosion_grid: Grid::filled(width, height, 0),
            players: BTreeMap::new(),
            bombs: BTreeMap::new(),
            explosions: BTreeMap::new(),
            next_bomb_id: 1,
            next_explosion_id: 1,
        }
    }

    /// Parses a text layout: `#` wall, `.` floor, `1`-`9` player spawn.
    pub fn from_layout(layout: &str) -> Result<Self, LevelError> {
        let rows: Vec<&str> = layout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let width = rows.first().map(|row| row.chars().count()).unwrap_or(0);
        if rows.is_empty() || width == 0 {
            return Err(LevelError::Empty);
        }

        let mut state = Self::new(width, rows.len());
        for (y, row) in rows.iter().enumerate() {
            let found = row.chars().count();
            if found != width {
                return Err(LevelError::Ragged {
                    row: y,
                    expected: width,
                    found,
                });
            }

            for (x, tile) in row.chars().enumerate() {
                match tile {
                    '.' => {}
                    '#' => {
                        state.walls.set(x as i32, y as i32, true);
                    }
                    '1'..='9' => {
                        let id = tile.to_digit(10).unwrap_or(0);
                        if state.players.contains_key(&id) {
                            return Err(LevelError::DuplicatePlayer(id));
                        }
                        state.spawn_player(id, x as i32, y as i32);
                    }
                    _ => return Err(LevelError::UnknownTile { tile, x, y }),
                }
            }
        }

        Ok(state)
    }

    pub fn width(&self) -> usize {
        self.walls.width()
    }

    pub fn height(&self) -> usize {
        self.walls.height()
    }

    pub fn spawn_player(&mut self, id: PlayerId, x: i32, y: i32) {
        self.player_grid.set(x, y, Some(id));
        self.players.insert(id, Player::new(id, x, y));
    }

    pub fn is_wall(&self, x: i32, y: i32) -> bool {
        self.walls.get(x, y).copied().unwrap_or(false)
    }

    pub fn player_at(&self, x: i32, y: i32) -> Option<PlayerId> {
        self.player_grid.get(x, y).copied().flatten()
    }

    pub fn bomb_at(&self, x: i32, y: i32) -> Option<BombId> {
        self.bomb_grid.get(x, y).copied().flatten()
    }

    pub fn explosion_count(&self, x: i32, y: i32) -> u16 {
        self.explosion_grid.get(x, y).copied().unwrap_or(0)
    }

    /// True when the cell is off-grid or already holds a wall, player or bomb.
    pub fn is_blocked(&self, x: i32, y: i32) -> bool {
        !self.walls.contains(x, y)
            || self.is_wall(x, y)
            || self.player_at(x, y).is_some()
            || self.bomb_at(x, y).is_some()
    }

    pub fn alive_players(&self) -> impl Iterator<Item = &Player> {
        self.players.values().filter(|p| p.alive)
    }

    /// Text rendering for logs: walls, players, `o` bombs, `*` explosions.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity((self.width() + 1) * self.height());
        for y in 0..self.height() as i32 {
            for x in 0..self.width() as i32 {
                let tile = if self.is_wall(x, y) {
                    '#'
                } else if let Some(id) = self.player_at(x, y) {
                    char::from_digit(id % 10, 10).unwrap_or('P')
                } else if self.bomb_at(x, y).is_some() {
                    'o'
                } else if self.explosion_count(x, y) > 0 {
                    '*'
                } else {
                    '.'
                };
                out.push(tile);
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_LEVEL;

    #[test]
    fn test_grid_bounds() {
        let mut grid = Grid::filled(3, 2, 0u8);
        assert!(grid.contains(0, 0));
        assert!(grid.contains(2, 1));
        assert!(!grid.contains(3, 0));
        assert!(!grid.contains(-1, 0));
        assert!(!grid.set(0, 2, 9));
        assert!(grid.set(1, 1, 7));
        assert_eq!(grid.get(1, 1), Some(&7));
        assert_eq!(grid.get(1, -1), None);
    }

    #[test]
    fn test_layout_places_walls_and_players() {
        let state = GameState::from_layout(DEFAULT_LEVEL).unwrap();

        assert!(state.is_wall(2, 0));
        assert!(!state.is_wall(2, 2));
        assert_eq!(state.player_at(0, 0), Some(1));
        assert_eq!(state.player_at(4, 4), Some(4));
        assert_eq!(state.players[&2].x, 4);
        assert_eq!(state.players[&2].y, 0);
        assert!(state.is_blocked(-1, 0));
        assert!(state.is_blocked(0, 0));
        assert!(!state.is_blocked(1, 0));
    }

    #[test]
    fn test_layout_errors() {
        assert_eq!(GameState::from_layout("\n\n"), Err(LevelError::Empty));
        assert_eq!(
            GameState::from_layout("...\n..\n"),
            Err(LevelError::Ragged {
                row: 1,
                expected: 3,
                found: 2
            })
        );
        assert_eq!(
            GameState::from_layout("1.1"),
            Err(LevelError::DuplicatePlayer(1))
        );
        assert!(matches!(
            GameState::from_layout(".x."),
            Err(LevelError::UnknownTile { tile: 'x', x: 1, y: 0 })
        ));
    }

    #[test]
    fn test_render_matches_layout() {
        let state = GameState::from_layout(DEFAULT_LEVEL).unwrap();
        let rendered = state.render();
        let expected: String = DEFAULT_LEVEL.lines().map(|l| format!("{}\n", l)).collect();
        assert_eq!(rendered, expected);
    }
}
