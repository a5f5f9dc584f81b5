//! Builders for manifests used across integration tests.

#![allow(dead_code)]

use pglift::model::{Password, PgBackRestManifest};
use pglift::{DatabaseManifest, InstanceManifest, InstanceState, RoleManifest, Value, Version};

/// Builder for `InstanceManifest`.
pub struct ManifestBuilder {
    manifest: InstanceManifest,
}

impl ManifestBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            manifest: InstanceManifest::new(name),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.manifest.version = Some(version.parse::<Version>().expect("valid version"));
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.manifest.port = Some(port);
        self
    }

    pub fn state(mut self, state: InstanceState) -> Self {
        self.manifest.state = state;
        self
    }

    pub fn setting(mut self, name: &str, value: Value) -> Self {
        self.manifest.settings.insert(name.to_string(), value);
        self
    }

    pub fn surole_password(mut self, password: &str) -> Self {
        self.manifest.surole_password = Some(Password::new(password));
        self
    }

    pub fn role(mut self, role: RoleManifest) -> Self {
        self.manifest.roles.push(role);
        self
    }

    pub fn database(mut self, database: DatabaseManifest) -> Self {
        self.manifest.databases.push(database);
        self
    }

    pub fn pgbackrest(mut self, stanza: &str) -> Self {
        self.manifest.pgbackrest = Some(PgBackRestManifest {
            stanza: stanza.to_string(),
            password: None,
        });
        self
    }

    pub fn build(self) -> InstanceManifest {
        self.manifest
    }
}

/// A login role.
pub fn login_role(name: &str) -> RoleManifest {
    let mut role = RoleManifest::new(name);
    role.login = true;
    role
}

/// A database owned by `owner`.
pub fn owned_database(name: &str, owner: &str) -> DatabaseManifest {
    let mut database = DatabaseManifest::new(name);
    database.owner = Some(owner.to_string());
    database
}
