//! Authenticated principals and the role hierarchy.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Organizational roles, ordered by seniority.
///
/// The hierarchy is total: any action allowed for a role is allowed for
/// every role with a higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    CreativeDirector,
    Salesperson,
    Director,
    Leadership,
}

impl Role {
    /// Numeric rank; higher strictly dominates lower.
    pub fn rank(&self) -> u8 {
        match self {
            Role::CreativeDirector => 1,
            Role::Salesperson => 2,
            Role::Director => 3,
            Role::Leadership => 4,
        }
    }

    /// True when `self` can do everything `other` can.
    pub fn dominates(&self, other: Role) -> bool {
        self.rank() >= other.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::CreativeDirector => "creative_director",
            Role::Salesperson => "salesperson",
            Role::Director => "director",
            Role::Leadership => "leadership",
        }
    }

    pub fn all() -> [Role; 4] {
        [
            Role::CreativeDirector,
            Role::Salesperson,
            Role::Director,
            Role::Leadership,
        ]
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Bounds for the data-sensitivity lattice (inclusive).
pub const MIN_DATA_ACCESS_LEVEL: u8 = 1;
pub const MAX_DATA_ACCESS_LEVEL: u8 = 6;

/// An authenticated user with role and data-access attributes.
///
/// The role gates actions; `data_access_level` is an independent 1..=6 axis
/// that bounds which sensitive fields are returned unredacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    pub data_access_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role, data_access_level: u8) -> Result<Self> {
        if !(MIN_DATA_ACCESS_LEVEL..=MAX_DATA_ACCESS_LEVEL).contains(&data_access_level) {
            return Err(Error::validation(format!(
                "data_access_level must be in {MIN_DATA_ACCESS_LEVEL}..={MAX_DATA_ACCESS_LEVEL}, got {data_access_level}"
            )));
        }
        Ok(Self {
            id: id.into(),
            role,
            data_access_level,
            department: None,
        })
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    /// True when this principal sees at least everything `other` sees,
    /// on both the role and data-access axes.
    pub fn dominates(&self, other: &Principal) -> bool {
        self.role.dominates(other.role) && self.data_access_level >= other.data_access_level
    }

    /// Whether fields annotated at `level` are visible unredacted.
    pub fn can_see_level(&self, level: u8) -> bool {
        self.data_access_level >= level
    }
}
