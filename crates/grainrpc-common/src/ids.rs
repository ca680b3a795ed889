//! Identifiers shared by every layer of the protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! make_uuid {
    {$(
        $(#[$meta:meta])*
        $vis:vis struct $ident:ident;
    )*} => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
        $vis struct $ident(Uuid);

        impl $ident {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $ident {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::fmt::Display for $ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    )*}
}

make_uuid! {
	/// Identifies a player. Globally unique, persists across zone migrations (I4).
	pub struct PlayerId;

	/// Identifies an action server.
	pub struct ServerId;
}

/// A client's role, as minted by the directory alongside its session credential.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Guest,
	User,
	Server,
	Admin,
}

/// An integer-coordinate tile of the world's regular planar partition.
///
/// Two squares are neighbours iff their Chebyshev distance is 1.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GridSquare {
	pub x: i64,
	pub y: i64,
}

impl GridSquare {
	pub fn new(x: i64, y: i64) -> Self {
		Self { x, y }
	}

	/// Resolves a world position to the grid square containing it, via floor division.
	///
	/// A position exactly on a boundary resolves to the square whose
	/// floor(pos / cell_size) it equals, deterministic and unambiguous.
	pub fn from_position(x: f64, y: f64, cell_size: f64) -> Self {
		Self {
			x: (x / cell_size).floor() as i64,
			y: (y / cell_size).floor() as i64,
		}
	}

	pub fn chebyshev_distance(&self, other: &GridSquare) -> i64 {
		(self.x - other.x).abs().max((self.y - other.y).abs())
	}

	/// The up-to-8 neighbours of this square, not including itself.
	pub fn neighbours(&self) -> impl Iterator<Item = GridSquare> + '_ {
		(-1..=1).flat_map(move |dx| {
			(-1..=1).filter_map(move |dy| {
				if dx == 0 && dy == 0 {
					None
				} else {
					Some(GridSquare::new(self.x + dx, self.y + dy))
				}
			})
		})
	}

	/// Key used to index the neighbour connection pool ("x,y").
	pub fn pool_key(&self) -> String {
		format!("{},{}", self.x, self.y)
	}
}

impl std::fmt::Display for GridSquare {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{},{}", self.x, self.y)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_neighbours_count() {
		let sq = GridSquare::new(0, 0);
		assert_eq!(sq.neighbours().count(), 8);
	}

	#[test]
	fn test_chebyshev_distance() {
		assert_eq!(GridSquare::new(0, 0).chebyshev_distance(&GridSquare::new(1, 1)), 1);
		assert_eq!(GridSquare::new(0, 0).chebyshev_distance(&GridSquare::new(2, 0)), 2);
	}

	#[test]
	fn test_from_position_boundary_is_deterministic() {
		// Exactly on the boundary between (0,0) and (1,0) with cell_size 1000.
		assert_eq!(GridSquare::from_position(1000.0, 500.0, 1000.0), GridSquare::new(1, 0));
		assert_eq!(GridSquare::from_position(999.999, 500.0, 1000.0), GridSquare::new(0, 0));
		assert_eq!(GridSquare::from_position(-0.001, 0.0, 1000.0), GridSquare::new(-1, 0));
	}
}
