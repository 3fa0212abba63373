use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// The credentials file: one JSON object with the four fields below, read
/// once at startup. Field names match case-insensitively on the first letter.
#[derive(Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Credentials {
    #[serde(alias = "user")]
    pub user: String,
    #[serde(alias = "pass")]
    pub pass: String,
    #[serde(alias = "elasticUser", alias = "elastic_user")]
    pub elastic_user: String,
    #[serde(alias = "elasticPass", alias = "elastic_pass")]
    pub elastic_pass: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("elastic_user", &self.elastic_user)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Loads and parses the file. Any failure is a `ConfigError`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&raw).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Store login, or `None` when the store runs without authentication.
    pub fn store(&self) -> Option<StoreCredentials> {
        if self.user.is_empty() && self.pass.is_empty() {
            None
        } else {
            Some(StoreCredentials { user: self.user.clone(), pass: self.pass.clone() })
        }
    }

    /// Basic-auth pair for the index service, or `None` when unset.
    pub fn index(&self) -> Option<(String, String)> {
        if self.elastic_user.is_empty() && self.elastic_pass.is_empty() {
            None
        } else {
            Some((self.elastic_user.clone(), self.elastic_pass.clone()))
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct StoreCredentials {
    pub user: String,
    pub pass: String,
}

impl fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_go_style_keys_file() {
        let c = Credentials::parse(
            r#"{"User": "redis", "Pass": "pw", "ElasticUser": "elastic", "ElasticPass": "epw"}"#,
        )
        .unwrap();
        assert_eq!(c.store(), Some(StoreCredentials { user: "redis".into(), pass: "pw".into() }));
        assert_eq!(c.index(), Some(("elastic".into(), "epw".into())));
    }

    #[test]
    fn lowercase_names_are_accepted() {
        let c = Credentials::parse(
            r#"{"user": "", "pass": "", "elasticUser": "e", "elasticPass": "p"}"#,
        )
        .unwrap();
        assert_eq!(c.store(), None);
        assert!(c.index().is_some());
    }

    #[test]
    fn missing_field_is_config_error() {
        let err = Credentials::parse(r#"{"User": "a", "Pass": "b", "ElasticUser": "c"}"#).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Credentials::load(Path::new("/definitely/not/here/keys.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"User":"u","Pass":"p","ElasticUser":"eu","ElasticPass":"ep"}}"#).unwrap();
        let c = Credentials::load(file.path()).unwrap();
        assert_eq!(c.elastic_user, "eu");
        assert!(!format!("{:?}", c).contains("ep\""));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(Credentials::load(file.path()), Err(Error::Config(_))));
    }
}
