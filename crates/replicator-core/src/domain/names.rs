//! Storage names: accounts, containers, objects.
//!
//! Account and container names are validated on construction so that a typo
//! on the command line fails before any network call is made.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reason a name was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("account name `{0}` must be 3-24 lowercase letters or digits")]
    InvalidAccount(String),

    #[error(
        "container name `{0}` must be 3-63 lowercase letters, digits or single hyphens, \
         starting and ending with a letter or digit"
    )]
    InvalidContainer(String),

    #[error("object name must not be empty")]
    EmptyObject,
}

/// A storage account name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountName(String);

impl AccountName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        let valid = (3..=24).contains(&name.len())
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(name))
        } else {
            Err(NameError::InvalidAccount(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A container name inside an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerName(String);

impl ContainerName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        let bytes = name.as_bytes();
        let allowed = bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
        let valid = (3..=63).contains(&bytes.len())
            && allowed
            && bytes.first() != Some(&b'-')
            && bytes.last() != Some(&b'-')
            && !name.contains("--");
        if valid {
            Ok(Self(name))
        } else {
            Err(NameError::InvalidContainer(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_name_impls {
    ($name:ident) => {
        impl FromStr for $name {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

string_name_impls!(AccountName);
string_name_impls!(ContainerName);

/// Immutable identity of one object, as enumerated from a container listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub account: AccountName,
    pub container: ContainerName,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(
        account: AccountName,
        container: ContainerName,
        name: impl Into<String>,
    ) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::EmptyObject);
        }
        Ok(Self {
            account,
            container,
            name,
        })
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.container, self.name)
    }
}

/// A container that is known to exist.
///
/// Only the object store hands these out (from `create_container_if_absent`),
/// so holding one means the ensure-exists step already ran.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub account: AccountName,
    pub container: ContainerName,
}

impl ContainerHandle {
    pub fn new(account: AccountName, container: ContainerName) -> Self {
        Self { account, container }
    }

    /// Identity of an object with the given name inside this container.
    pub fn object(&self, name: impl Into<String>) -> Result<ObjectIdentity, NameError> {
        ObjectIdentity::new(self.account.clone(), self.container.clone(), name)
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("srcaccount")]
    #[case::digits("acct01")]
    #[case::min_len("abc")]
    fn valid_account_names(#[case] name: &str) {
        assert!(AccountName::new(name).is_ok());
    }

    #[rstest]
    #[case::too_short("ab")]
    #[case::upper("SrcAccount")]
    #[case::hyphen("src-account")]
    #[case::too_long("abcdefghijklmnopqrstuvwxyz")]
    #[case::empty("")]
    fn invalid_account_names(#[case] name: &str) {
        assert!(matches!(
            AccountName::new(name),
            Err(NameError::InvalidAccount(_))
        ));
    }

    #[rstest]
    #[case::default_name("blobdefaultcontainer")]
    #[case::hyphenated("my-container-1")]
    fn valid_container_names(#[case] name: &str) {
        assert!(ContainerName::new(name).is_ok());
    }

    #[rstest]
    #[case::leading_hyphen("-abc")]
    #[case::trailing_hyphen("abc-")]
    #[case::double_hyphen("a--bc")]
    #[case::upper("Blobs")]
    #[case::too_short("ab")]
    fn invalid_container_names(#[case] name: &str) {
        assert!(matches!(
            ContainerName::new(name),
            Err(NameError::InvalidContainer(_))
        ));
    }

    #[test]
    fn names_deserialize_with_validation() {
        let ok: AccountName = serde_json::from_str("\"dest01\"").unwrap();
        assert_eq!(ok.as_str(), "dest01");

        let bad: Result<AccountName, _> = serde_json::from_str("\"Dest-01\"");
        assert!(bad.is_err());
    }

    #[test]
    fn object_identity_display_is_account_container_name() {
        let handle = ContainerHandle::new(
            AccountName::new("src").unwrap(),
            ContainerName::new("blobs").unwrap(),
        );
        let object = handle.object("blob_1.txt").unwrap();
        assert_eq!(object.to_string(), "src/blobs/blob_1.txt");
        assert!(matches!(handle.object(""), Err(NameError::EmptyObject)));
    }
}
