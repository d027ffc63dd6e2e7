use core::fmt;
use core::str::FromStr;

use time::{Duration, OffsetDateTime};
use typed_builder::TypedBuilder;

/// Repository visibility as reported by GitHub Enterprise.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Visibility {
    Public,
    Internal,
    #[default]
    Private,
}

impl Visibility {
    pub const fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Internal => "internal",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "internal" => Ok(Visibility::Internal),
            "private" => Ok(Visibility::Private),
            _ => anyhow::bail!("unknown visibility: {s}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub github_id: i64,
    pub email: Option<String>,
    pub suspended_at: Option<OffsetDateTime>,
    pub last_synced: Option<OffsetDateTime>,
    pub created: OffsetDateTime,
    pub modified: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Org {
    pub id: i64,
    pub org_name: String,
    pub github_id: i64,
    /// Local id of the owning [`User`].
    pub owner_id: i64,
    pub created: OffsetDateTime,
    pub modified: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Team {
    pub id: i64,
    pub github_id: i64,
    pub team_name: String,
    pub team_slug: String,
    /// Local id of the [`Org`] this team belongs to.
    pub org_id: i64,
    pub created: OffsetDateTime,
    pub modified: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Repo {
    pub id: i64,
    /// Full name, `owner/name`.
    pub repo_name: String,
    pub description: Option<String>,
    pub github_id: i64,
    pub classification: Option<String>,
    pub classification_modified: OffsetDateTime,
    pub visibility: Visibility,
    pub html_url: Option<String>,
    pub owner_id: i64,
    pub fork_source_id: Option<i64>,
    pub size: i64,
    pub disabled: bool,
    pub org_id: Option<i64>,
    pub collaborators_synced: Option<OffsetDateTime>,
    pub last_polling_check: Option<OffsetDateTime>,
    pub created: OffsetDateTime,
    pub modified: OffsetDateTime,
}

/// Margin absorbing the jitter between two polling rounds.
const REMINDER_GRACE: Duration = Duration::seconds(30);

impl Repo {
    /// Stores a new classification.
    ///
    /// Returns `false` and leaves `classification_modified` untouched when the
    /// classification doesn't change.
    pub fn set_classification(&mut self, classification: Option<String>, now: OffsetDateTime) -> bool {
        if self.classification == classification {
            return false;
        }

        self.classification = classification;
        self.classification_modified = now;

        true
    }

    /// Whether the next polling round should remind the owner about this repository.
    pub fn is_reminder_candidate(&self, now: OffsetDateTime, reminder_minutes: i64) -> bool {
        match self.last_polling_check {
            None => true,
            Some(last_check) => last_check + Duration::minutes(reminder_minutes) - REMINDER_GRACE < now,
        }
    }

    /// Classified repositories are compliant unless a polling policy says otherwise.
    pub fn is_non_compliant(&self) -> bool {
        false
    }

    pub fn owner_and_name(&self) -> (&str, &str) {
        self.repo_name.split_once('/').unwrap_or((self.repo_name.as_str(), ""))
    }

    pub fn is_classified(&self) -> bool {
        self.classification.is_some()
    }
}

/// Values for a repository that is not stored yet.
#[derive(Clone, Debug, TypedBuilder)]
pub struct NewRepo {
    #[builder(setter(into))]
    pub repo_name: String,
    pub github_id: i64,
    pub owner_id: i64,
    #[builder(default)]
    pub org_id: Option<i64>,
    #[builder(default)]
    pub description: Option<String>,
    #[builder(default)]
    pub classification: Option<String>,
    #[builder(default)]
    pub visibility: Visibility,
    #[builder(default)]
    pub html_url: Option<String>,
    #[builder(default)]
    pub fork_source_id: Option<i64>,
    #[builder(default)]
    pub size: i64,
    #[builder(default)]
    pub disabled: bool,
}
