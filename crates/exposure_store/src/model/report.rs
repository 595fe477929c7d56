//! Exposure report domain model.
//!
//! # Responsibility
//! - Define the canonical in-memory shape of one exposure report.
//! - Own identifier parsing and the owner-exclusivity rule.
//!
//! # Invariants
//! - Identifiers cross the public boundary only in canonical text form
//!   (lowercase, hyphenated, 36 characters).
//! - A report belongs to exactly one owner: a user or an organization.
//! - `exposed_count` is never negative and fits a 32-bit storage integer.
//! - `last_updated_at >= created_at`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Largest count accepted by every backend (`INTEGER` is 32-bit on Postgres).
pub const MAX_EXPOSED_COUNT: i64 = i32::MAX as i64;

static CANONICAL_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("canonical uuid pattern is valid")
});

/// Validation failures raised before anything touches storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportValidationError {
    /// Owner reference is absent, ambiguous or not a canonical identifier.
    InvalidOwner(String),
    /// Count is negative or larger than [`MAX_EXPOSED_COUNT`].
    InvalidCount(i64),
    /// Identifier text is not in canonical form.
    InvalidId(String),
    /// `last_updated_at` precedes `created_at`.
    TimestampOrder,
}

impl Display for ReportValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOwner(message) => write!(f, "invalid owner: {message}"),
            Self::InvalidCount(count) => write!(
                f,
                "invalid exposed count {count}; expected 0..={MAX_EXPOSED_COUNT}"
            ),
            Self::InvalidId(value) => write!(f, "invalid identifier `{value}`"),
            Self::TimestampOrder => write!(f, "last_updated_at precedes created_at"),
        }
    }
}

impl Error for ReportValidationError {}

fn parse_canonical_uuid(value: &str) -> Option<Uuid> {
    if !CANONICAL_UUID.is_match(value) {
        return None;
    }
    Uuid::parse_str(value).ok()
}

macro_rules! canonical_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Parses the canonical hyphenated form. Case is normalized;
            /// surrounding whitespace is not.
            pub fn parse(value: &str) -> Result<Self, ReportValidationError> {
                parse_canonical_uuid(value)
                    .map(Self)
                    .ok_or_else(|| ReportValidationError::InvalidId(value.to_string()))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = ReportValidationError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::parse(value)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ReportValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_string()
            }
        }
    };
}

canonical_id!(
    /// Stable report identifier, generated once at insertion.
    ReportId
);
canonical_id!(
    /// Identifier of a row in the external user directory.
    UserId
);
canonical_id!(
    /// Identifier of a row in the external organization directory.
    OrganizationId
);

impl ReportId {
    /// Generates a fresh random (v4) report id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Owner kind discriminator, mirrored by the two nullable owner columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    User,
    Organization,
}

impl OwnerKind {
    /// Storage column holding this owner kind.
    pub fn column(self) -> &'static str {
        match self {
            Self::User => "owner_user",
            Self::Organization => "owner_org",
        }
    }

    /// Directory table the owner column references.
    pub fn directory_table(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Organization => "organizations",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Organization => "organization",
        }
    }
}

/// The single owner of a report.
///
/// Reports reference either a user or an organization, never both. Storage
/// splits this into `owner_user` / `owner_org`; nothing above the storage
/// boundary sees those columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Owner {
    User(UserId),
    Organization(OrganizationId),
}

impl Owner {
    /// Builds a user owner from canonical id text.
    pub fn user(id: &str) -> Result<Self, ReportValidationError> {
        UserId::parse(id)
            .map(Self::User)
            .map_err(|_| ReportValidationError::InvalidOwner(format!("malformed user id `{id}`")))
    }

    /// Builds an organization owner from canonical id text.
    pub fn organization(id: &str) -> Result<Self, ReportValidationError> {
        OrganizationId::parse(id).map(Self::Organization).map_err(|_| {
            ReportValidationError::InvalidOwner(format!("malformed organization id `{id}`"))
        })
    }

    /// Builds an owner from the two nullable column values.
    ///
    /// Exactly one side must be present.
    pub fn from_columns(
        owner_user: Option<&str>,
        owner_org: Option<&str>,
    ) -> Result<Self, ReportValidationError> {
        match (owner_user, owner_org) {
            (Some(user), None) => Self::user(user),
            (None, Some(org)) => Self::organization(org),
            (Some(_), Some(_)) => Err(ReportValidationError::InvalidOwner(
                "both owner_user and owner_org are set".to_string(),
            )),
            (None, None) => Err(ReportValidationError::InvalidOwner(
                "neither owner_user nor owner_org is set".to_string(),
            )),
        }
    }

    /// Same as [`Owner::from_columns`] for natively typed columns.
    pub fn from_uuid_columns(
        owner_user: Option<Uuid>,
        owner_org: Option<Uuid>,
    ) -> Result<Self, ReportValidationError> {
        match (owner_user, owner_org) {
            (Some(user), None) => Ok(Self::User(UserId(user))),
            (None, Some(org)) => Ok(Self::Organization(OrganizationId(org))),
            (Some(_), Some(_)) => Err(ReportValidationError::InvalidOwner(
                "both owner_user and owner_org are set".to_string(),
            )),
            (None, None) => Err(ReportValidationError::InvalidOwner(
                "neither owner_user nor owner_org is set".to_string(),
            )),
        }
    }

    /// Splits the owner into `(owner_user, owner_org)` column values.
    pub fn to_columns(&self) -> (Option<Uuid>, Option<Uuid>) {
        match self {
            Self::User(id) => (Some(id.as_uuid()), None),
            Self::Organization(id) => (None, Some(id.as_uuid())),
        }
    }

    pub fn kind(&self) -> OwnerKind {
        match self {
            Self::User(_) => OwnerKind::User,
            Self::Organization(_) => OwnerKind::Organization,
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        match self {
            Self::User(id) => id.as_uuid(),
            Self::Organization(id) => id.as_uuid(),
        }
    }
}

impl Display for Owner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Organization(id) => write!(f, "organization:{id}"),
        }
    }
}

/// Checks a caller-supplied count and narrows it to the stored range.
pub fn validate_count(count: i64) -> Result<u32, ReportValidationError> {
    if !(0..=MAX_EXPOSED_COUNT).contains(&count) {
        return Err(ReportValidationError::InvalidCount(count));
    }
    u32::try_from(count).map_err(|_| ReportValidationError::InvalidCount(count))
}

/// Drops sub-microsecond precision so every backend stores the same instant.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Persisted exposure summary for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ReportRecord", into = "ReportRecord")]
pub struct Report {
    pub id: ReportId,
    pub owner: Owner,
    pub exposed_count: u32,
    /// Set once at insertion.
    pub created_at: DateTime<Utc>,
    /// Never earlier than `created_at`; never moves backwards.
    pub last_updated_at: DateTime<Utc>,
}

impl Report {
    /// Builds a report that has not been persisted yet.
    ///
    /// Both timestamps are `now`, truncated to microseconds.
    pub fn new(owner: Owner, count: i64, now: DateTime<Utc>) -> Result<Self, ReportValidationError> {
        let exposed_count = validate_count(count)?;
        let now = truncate_to_micros(now);
        Ok(Self {
            id: ReportId::generate(),
            owner,
            exposed_count,
            created_at: now,
            last_updated_at: now,
        })
    }

    pub fn owner_user(&self) -> Option<UserId> {
        match self.owner {
            Owner::User(id) => Some(id),
            Owner::Organization(_) => None,
        }
    }

    pub fn owner_org(&self) -> Option<OrganizationId> {
        match self.owner {
            Owner::User(_) => None,
            Owner::Organization(id) => Some(id),
        }
    }

    /// Checks the invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), ReportValidationError> {
        if i64::from(self.exposed_count) > MAX_EXPOSED_COUNT {
            return Err(ReportValidationError::InvalidCount(i64::from(
                self.exposed_count,
            )));
        }
        if self.last_updated_at < self.created_at {
            return Err(ReportValidationError::TimestampOrder);
        }
        Ok(())
    }
}

/// Column-shaped view of a report, used on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRecord {
    id: ReportId,
    owner_user: Option<UserId>,
    owner_org: Option<OrganizationId>,
    exposed_count: u32,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
}

impl From<Report> for ReportRecord {
    fn from(value: Report) -> Self {
        Self {
            id: value.id,
            owner_user: value.owner_user(),
            owner_org: value.owner_org(),
            exposed_count: value.exposed_count,
            created_at: value.created_at,
            last_updated_at: value.last_updated_at,
        }
    }
}

impl TryFrom<ReportRecord> for Report {
    type Error = ReportValidationError;

    fn try_from(value: ReportRecord) -> Result<Self, Self::Error> {
        let owner = Owner::from_uuid_columns(
            value.owner_user.map(|id| id.as_uuid()),
            value.owner_org.map(|id| id.as_uuid()),
        )?;
        let report = Self {
            id: value.id,
            owner,
            exposed_count: value.exposed_count,
            created_at: value.created_at,
            last_updated_at: value.last_updated_at,
        };
        report.validate()?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_count, Owner, ReportId, ReportValidationError, UserId};

    #[test]
    fn canonical_id_normalizes_case() {
        let id = UserId::parse("6F9619FF-8B86-D011-B42D-00C04FC964FF").unwrap();
        assert_eq!(id.to_string(), "6f9619ff-8b86-d011-b42d-00c04fc964ff");
    }

    #[test]
    fn non_canonical_forms_are_rejected() {
        for value in [
            "6f9619ff8b86d011b42d00c04fc964ff",
            "{6f9619ff-8b86-d011-b42d-00c04fc964ff}",
            "urn:uuid:6f9619ff-8b86-d011-b42d-00c04fc964ff",
            " 6f9619ff-8b86-d011-b42d-00c04fc964ff",
            "6f9619ff-8b86-d011-b42d-00c04fc964ff\n",
            "",
        ] {
            assert!(ReportId::parse(value).is_err(), "{value} should be rejected");
        }
    }

    #[test]
    fn from_columns_requires_exactly_one_owner() {
        let user = "6f9619ff-8b86-d011-b42d-00c04fc964ff";
        assert!(matches!(
            Owner::from_columns(Some(user), Some(user)),
            Err(ReportValidationError::InvalidOwner(_))
        ));
        assert!(matches!(
            Owner::from_columns(None, None),
            Err(ReportValidationError::InvalidOwner(_))
        ));
        assert!(matches!(
            Owner::from_columns(Some(user), None),
            Ok(Owner::User(_))
        ));
        assert!(matches!(
            Owner::from_columns(Some("nope"), None),
            Err(ReportValidationError::InvalidOwner(_))
        ));
    }

    #[test]
    fn validate_count_bounds() {
        assert_eq!(validate_count(0), Ok(0));
        assert_eq!(validate_count(42), Ok(42));
        assert_eq!(
            validate_count(-1),
            Err(ReportValidationError::InvalidCount(-1))
        );
        assert!(validate_count(i64::from(i32::MAX) + 1).is_err());
    }
}
