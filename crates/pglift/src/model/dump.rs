use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Date format used in dump file names and manifests.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

pub const MANIFEST_HEADER: &str = "# File created by pglift to keep track of database dumps";

/// A logical dump found in an instance's dumps directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseDump {
    pub id: String,
    pub dbname: String,
    pub date: DateTime<FixedOffset>,
    #[serde(skip)]
    pub path: PathBuf,
}

fn hash10(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)[..10].to_string()
}

impl DatabaseDump {
    pub fn new(dbname: &str, date: DateTime<FixedOffset>, path: PathBuf) -> Self {
        let id = format!(
            "{}_{}",
            dbname,
            hash10(&format!("{}{}", dbname, date.format(DATE_FORMAT)))
        );
        Self {
            id,
            dbname: dbname.to_string(),
            date,
            path,
        }
    }

    /// Builds a dump from a `{dbname}_{date}.manifest` file path.
    pub fn from_manifest_path(path: &Path) -> Result<Self> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Validation(format!("invalid dump file {}", path.display())))?;
        let (dbname, date) = stem.rsplit_once('_').ok_or_else(|| {
            Error::Validation(format!("dump file {} has no date part", path.display()))
        })?;
        let date = DateTime::parse_from_str(date, DATE_FORMAT).map_err(|e| {
            Error::Validation(format!(
                "invalid date in dump file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::new(dbname, date, path.to_path_buf()))
    }

    /// Text of the sibling `.manifest` file.
    pub fn manifest_content(&self) -> String {
        format!(
            "{}\n# database: {}\n# date: {}\n",
            MANIFEST_HEADER,
            self.dbname,
            self.date.format(DATE_FORMAT)
        )
    }

    /// File name stem shared by the dump and its manifest.
    pub fn stem(dbname: &str, date: &DateTime<FixedOffset>) -> String {
        format!("{}_{}", dbname, date.format(DATE_FORMAT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-03-01T10:20:30+01:00").unwrap()
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = DatabaseDump::new("app", date(), PathBuf::new());
        let b = DatabaseDump::new("app", date(), PathBuf::from("/x"));
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("app_"));
        assert_eq!(a.id.len(), "app_".len() + 10);
        let c = DatabaseDump::new("other", date(), PathBuf::new());
        assert_ne!(a.id[a.id.len() - 10..], c.id[c.id.len() - 10..]);
    }

    #[test]
    fn test_from_manifest_path_with_underscored_dbname() {
        let path = PathBuf::from("/dumps/my_app_2024-03-01T10:20:30+01:00.manifest");
        let dump = DatabaseDump::from_manifest_path(&path).unwrap();
        assert_eq!(dump.dbname, "my_app");
        assert_eq!(dump.date, date());
    }

    #[test]
    fn test_manifest_content() {
        let dump = DatabaseDump::new("app", date(), PathBuf::new());
        assert_eq!(
            dump.manifest_content(),
            "# File created by pglift to keep track of database dumps\n\
             # database: app\n\
             # date: 2024-03-01T10:20:30+01:00\n"
        );
    }

    #[test]
    fn test_invalid_stem() {
        assert!(DatabaseDump::from_manifest_path(Path::new("/d/nodate.manifest")).is_err());
        assert!(DatabaseDump::from_manifest_path(Path::new("/d/app_yesterday.manifest")).is_err());
    }
}
