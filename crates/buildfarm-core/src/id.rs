//! Resource identifiers.
//!
//! Jobs and builds use monotonically increasing integer ids assigned by the
//! store, so a lower id always means an older record. Queue ordering relies
//! on that to break score ties.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identifier of a build worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct WorkerId(i64);

/// Identifier of a queue entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct JobId(i64);

/// Identifier of a build record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct BuildId(i64);

macro_rules! impl_raw {
    ($($ty:ident),*) => {
        $(
            impl $ty {
                pub fn new(raw: i64) -> Self {
                    Self(raw)
                }

                /// Get the underlying integer.
                pub fn get(&self) -> i64 {
                    self.0
                }
            }

            impl From<$ty> for i64 {
                fn from(id: $ty) -> Self {
                    id.0
                }
            }

            impl std::str::FromStr for $ty {
                type Err = std::num::ParseIntError;

                fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                    Ok(Self(s.parse()?))
                }
            }
        )*
    };
}

impl_raw!(WorkerId, JobId, BuildId);
