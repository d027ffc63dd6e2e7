use core::str::FromStr;

use crate::model::Visibility;

/// `limit`/`offset` window over a listing.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Page {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Page {
    pub const ALL: Page = Page {
        limit: None,
        offset: None,
    };
}

/// One page of results, along with the number of records matching the filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Listing<T> {
    pub count: u64,
    pub results: Vec<T>,
}

/// Sort key of a listing, parsed from `field` or `-field` for descending order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ordering<F> {
    pub field: F,
    pub descending: bool,
}

/// Fields a listing can be sorted on.
pub trait OrderField: Copy + Sized {
    fn from_name(name: &str) -> Option<Self>;

    fn column(self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ordering field: {0}")]
pub struct InvalidOrdering(pub String);

impl<F: OrderField> FromStr for Ordering<F> {
    type Err = InvalidOrdering;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, descending) = match s.strip_prefix('-') {
            Some(name) => (name, true),
            None => (s, false),
        };

        let field = F::from_name(name).ok_or_else(|| InvalidOrdering(s.to_owned()))?;

        Ok(Ordering { field, descending })
    }
}

macro_rules! order_fields {
    ($name:ident { $($variant:ident => $column:literal),+ $(,)? }) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum $name {
            $($variant),+
        }

        impl OrderField for $name {
            fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($column => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn column(self) -> &'static str {
                match self {
                    $(Self::$variant => $column),+
                }
            }
        }
    };
}

order_fields!(UserOrderField {
    Username => "username",
    GithubId => "github_id",
    Email => "email",
});

order_fields!(OrgOrderField {
    OrgName => "org_name",
    GithubId => "github_id",
});

order_fields!(TeamOrderField {
    TeamName => "team_name",
    TeamSlug => "team_slug",
    GithubId => "github_id",
});

order_fields!(RepoOrderField {
    RepoName => "repo_name",
    GithubId => "github_id",
    Classification => "classification",
    Visibility => "visibility",
    Size => "size",
});

#[derive(Clone, Debug, Default)]
pub struct UserFilter {
    pub username: Option<String>,
    pub github_id: Option<i64>,
    pub email: Option<String>,
    pub ordering: Option<Ordering<UserOrderField>>,
}

#[derive(Clone, Debug, Default)]
pub struct OrgFilter {
    pub org_name: Option<String>,
    pub github_id: Option<i64>,
    pub owner_github_id: Option<i64>,
    pub ordering: Option<Ordering<OrgOrderField>>,
}

#[derive(Clone, Debug, Default)]
pub struct TeamFilter {
    pub team_name: Option<String>,
    pub team_slug: Option<String>,
    pub github_id: Option<i64>,
    pub ordering: Option<Ordering<TeamOrderField>>,
}

#[derive(Clone, Debug, Default)]
pub struct RepoFilter {
    pub repo_name: Option<String>,
    /// Case-insensitive substring match on the full name.
    pub repo_name_icontains: Option<String>,
    pub github_id: Option<i64>,
    pub classification: Option<String>,
    pub visibility: Option<Visibility>,
    pub html_url: Option<String>,
    pub owner_github_id: Option<i64>,
    /// Local id of the repository this one was forked from.
    pub fork_source: Option<i64>,
    pub size: Option<i64>,
    pub size_gte: Option<i64>,
    pub size_lte: Option<i64>,
    pub disabled: Option<bool>,
    pub ordering: Option<Ordering<RepoOrderField>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descending_prefix() {
        let ordering: Ordering<RepoOrderField> = "-size".parse().unwrap();
        assert_eq!(ordering.field, RepoOrderField::Size);
        assert!(ordering.descending);

        let ordering: Ordering<UserOrderField> = "email".parse().unwrap();
        assert_eq!(ordering.field.column(), "email");
        assert!(!ordering.descending);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert_eq!(
            "owner".parse::<Ordering<RepoOrderField>>(),
            Err(InvalidOrdering("owner".to_owned()))
        );
        assert!("--size".parse::<Ordering<RepoOrderField>>().is_err());
    }
}
