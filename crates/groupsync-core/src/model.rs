use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Group identifier on the Community side.
    CommunityGroupId
);
numeric_id!(
    /// Member (user account) identifier on the Community side.
    CommunityMemberId
);
numeric_id!(
    /// Group identifier on the Directory side.
    DirectoryGroupId
);
numeric_id!(
    /// Contact identifier on the Directory side.
    ContactId
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MembershipStatus {
    Added,
    Pending,
    Removed,
}

impl MembershipStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "Added",
            Self::Pending => "Pending",
            Self::Removed => "Removed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Added" => Some(Self::Added),
            "Pending" => Some(Self::Pending),
            "Removed" => Some(Self::Removed),
            _ => None,
        }
    }

    /// Added and Pending both count as "in the group" for roster comparisons.
    #[must_use]
    pub fn is_present(self) -> bool {
        !matches!(self, Self::Removed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn from_admin_flag(is_admin: bool) -> Self {
        if is_admin {
            Self::Admin
        } else {
            Self::Member
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemberAction {
    Add,
    Remove,
}

/// Which of the two Directory groups of a pair a record belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MirrorKind {
    Membership,
    AccessControl,
}

impl MirrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Membership => "membership",
            Self::AccessControl => "access_control",
        }
    }
}

/// Which side is the source of truth for a reconciliation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    CommunityToDirectory,
    DirectoryToCommunity,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommunityToDirectory => "community_to_directory",
            Self::DirectoryToCommunity => "directory_to_community",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "community_to_directory" => Some(Self::CommunityToDirectory),
            "directory_to_community" => Some(Self::DirectoryToCommunity),
            _ => None,
        }
    }
}

/// The two Directory groups that mirror one Community group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct GroupPair {
    pub membership: DirectoryGroupId,
    pub access: DirectoryGroupId,
}

impl GroupPair {
    #[must_use]
    pub fn group(&self, kind: MirrorKind) -> DirectoryGroupId {
        match kind {
            MirrorKind::Membership => self.membership,
            MirrorKind::AccessControl => self.access,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommunityGroup {
    pub id: CommunityGroupId,
    pub title: String,
    pub description: String,
    pub is_active: bool,
    pub parent: Option<CommunityGroupId>,
}

/// One (group, member) row of a Community roster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommunityMembership {
    pub group: CommunityGroupId,
    pub member: CommunityMemberId,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryGroupKind {
    Membership,
    AccessControl,
    Container,
}

impl DirectoryGroupKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Membership => "membership",
            Self::AccessControl => "access_control",
            Self::Container => "container",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "membership" => Some(Self::Membership),
            "access_control" => Some(Self::AccessControl),
            "container" => Some(Self::Container),
            _ => None,
        }
    }
}

impl From<MirrorKind> for DirectoryGroupKind {
    fn from(value: MirrorKind) -> Self {
        match value {
            MirrorKind::Membership => Self::Membership,
            MirrorKind::AccessControl => Self::AccessControl,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DirectoryGroup {
    pub id: DirectoryGroupId,
    pub title: String,
    pub description: String,
    pub source: Option<String>,
    pub kind: DirectoryGroupKind,
    pub is_active: bool,
}

/// Field values pushed to a Directory group on create or update.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DirectoryGroupDraft {
    pub title: String,
    pub description: String,
    pub source: String,
    pub kind: DirectoryGroupKind,
    pub is_active: bool,
}

/// One (group, contact) row of a Directory group with its soft-delete status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MembershipRecord {
    pub group: DirectoryGroupId,
    pub contact: ContactId,
    pub status: MembershipStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_status_round_trips_through_storage_labels() {
        let statuses =
            [MembershipStatus::Added, MembershipStatus::Pending, MembershipStatus::Removed];
        for status in statuses {
            assert_eq!(MembershipStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MembershipStatus::parse("Deleted"), None);
        assert!(!MembershipStatus::Removed.is_present());
        assert!(MembershipStatus::Pending.is_present());
    }

    #[test]
    fn pair_selects_group_by_kind() {
        let pair = GroupPair { membership: DirectoryGroupId(4), access: DirectoryGroupId(5) };
        assert_eq!(pair.group(MirrorKind::Membership), DirectoryGroupId(4));
        assert_eq!(pair.group(MirrorKind::AccessControl), DirectoryGroupId(5));
    }
}
