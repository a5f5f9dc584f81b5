//! Roles of an instance.
//!
//! All functions work through a [`Session`] opened as the super-user; the
//! session also gives access to the context so that `role_change` hooks can
//! follow (password file entries, for instance).

use crate::db::{quote_ident, quote_literal, Session};
use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::model::{ApplyResult, ChangeState, PresenceState, Role, RoleManifest};
use crate::passfile::Passfile;

const ROLE_QUERY: &str = "SELECT r.rolname AS name, \
    r.rolpassword IS NOT NULL AS has_password, \
    r.rolinherit AS inherit, \
    r.rolcanlogin AS login, \
    r.rolsuper AS superuser, \
    r.rolreplication AS replication, \
    CASE WHEN r.rolconnlimit <> -1 THEN r.rolconnlimit ELSE NULL END AS connection_limit, \
    CASE WHEN r.rolvaliduntil = 'infinity' THEN NULL ELSE r.rolvaliduntil END AS validity, \
    ARRAY(SELECT b.rolname FROM pg_catalog.pg_auth_members m \
          JOIN pg_catalog.pg_roles b ON m.roleid = b.oid \
          WHERE m.member = r.oid ORDER BY 1) AS in_roles \
    FROM pg_catalog.pg_authid r";

fn with_pgpass(session: &Session<'_>, mut role: Role) -> Result<Role> {
    if let Some(path) = &session.ctx().settings().postgresql.auth.passfile {
        role.pgpass = Passfile::read(path)?
            .get(session.instance().port(), &role.name)
            .is_some();
    }
    Ok(role)
}

pub fn exists(session: &Session<'_>, name: &str) -> Result<bool> {
    #[derive(serde::Deserialize)]
    struct Row {
        #[allow(dead_code)]
        one: i32,
    }
    let row: Option<Row> = session.query_one(&format!(
        "SELECT 1 AS one FROM pg_catalog.pg_roles WHERE rolname = {}",
        quote_literal(name)
    ))?;
    Ok(row.is_some())
}

pub fn get(session: &Session<'_>, name: &str) -> Result<Role> {
    let role: Option<Role> = session.query_one(&format!(
        "{} WHERE r.rolname = {}",
        ROLE_QUERY,
        quote_literal(name)
    ))?;
    let role = role.ok_or_else(|| Error::RoleNotFound(name.to_string()))?;
    with_pgpass(session, role)
}

/// Roles of the instance, system ones (`pg_*`) excluded.
pub fn list(session: &Session<'_>) -> Result<Vec<Role>> {
    let roles: Vec<Role> = session.query(&format!(
        "{} WHERE r.rolname NOT LIKE 'pg\\_%' ORDER BY r.rolname",
        ROLE_QUERY
    ))?;
    roles.into_iter().map(|r| with_pgpass(session, r)).collect()
}

fn options(manifest: &RoleManifest) -> Vec<String> {
    let flag = |on: bool, name: &str| {
        if on {
            name.to_string()
        } else {
            format!("NO{}", name)
        }
    };
    let mut opts = vec![
        flag(manifest.login, "LOGIN"),
        flag(manifest.superuser, "SUPERUSER"),
        flag(manifest.replication, "REPLICATION"),
        flag(manifest.inherit, "INHERIT"),
    ];
    opts.push(format!(
        "CONNECTION LIMIT {}",
        manifest.connection_limit.unwrap_or(-1)
    ));
    opts.push(format!(
        "VALID UNTIL {}",
        match &manifest.validity {
            Some(validity) => quote_literal(&validity.to_rfc3339()),
            None => quote_literal("infinity"),
        }
    ));
    opts
}

/// Attributes of `current` differing from the manifest.
fn changed_options(manifest: &RoleManifest, current: &Role) -> Vec<String> {
    let mut opts = Vec::new();
    let flag = |on: bool, name: &str| {
        if on {
            name.to_string()
        } else {
            format!("NO{}", name)
        }
    };
    if manifest.login != current.login {
        opts.push(flag(manifest.login, "LOGIN"));
    }
    if manifest.superuser != current.superuser {
        opts.push(flag(manifest.superuser, "SUPERUSER"));
    }
    if manifest.replication != current.replication {
        opts.push(flag(manifest.replication, "REPLICATION"));
    }
    if manifest.inherit != current.inherit {
        opts.push(flag(manifest.inherit, "INHERIT"));
    }
    if manifest.connection_limit != current.connection_limit {
        opts.push(format!(
            "CONNECTION LIMIT {}",
            manifest.connection_limit.unwrap_or(-1)
        ));
    }
    if manifest.validity != current.validity {
        opts.push(format!(
            "VALID UNTIL {}",
            match &manifest.validity {
                Some(validity) => quote_literal(&validity.to_rfc3339()),
                None => quote_literal("infinity"),
            }
        ));
    }
    opts
}

fn password_clause(manifest: &RoleManifest) -> Option<String> {
    manifest
        .password
        .as_ref()
        .map(|p| format!("PASSWORD {}", quote_literal(p.expose())))
}

fn create(session: &Session<'_>, manifest: &RoleManifest) -> Result<()> {
    log::info!("creating role '{}'", manifest.name);
    let mut opts = options(manifest);
    opts.extend(password_clause(manifest));
    if !manifest.in_roles.is_empty() {
        opts.push(format!(
            "IN ROLE {}",
            manifest
                .in_roles
                .iter()
                .map(|r| quote_ident(r))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    // Through stdin: a password must not show up in the process list.
    session.execute_all(&[format!(
        "CREATE ROLE {} {}",
        quote_ident(&manifest.name),
        opts.join(" ")
    )])
}

/// Alters an existing role; `true` when an attribute or membership changed.
///
/// A given password is always set but never counts as a change, since the
/// stored hash cannot be compared.
fn alter(session: &Session<'_>, manifest: &RoleManifest) -> Result<bool> {
    let current = get(session, &manifest.name)?;
    let opts = changed_options(manifest, &current);
    let changed = !opts.is_empty();
    let mut statements = Vec::new();
    let mut all = opts;
    all.extend(password_clause(manifest));
    if !all.is_empty() {
        statements.push(format!(
            "ALTER ROLE {} {}",
            quote_ident(&manifest.name),
            all.join(" ")
        ));
    }
    let mut memberships = false;
    for parent in &manifest.in_roles {
        if !current.in_roles.contains(parent) {
            statements.push(format!(
                "GRANT {} TO {}",
                quote_ident(parent),
                quote_ident(&manifest.name)
            ));
            memberships = true;
        }
    }
    for parent in &current.in_roles {
        if !manifest.in_roles.contains(parent) {
            statements.push(format!(
                "REVOKE {} FROM {}",
                quote_ident(parent),
                quote_ident(&manifest.name)
            ));
            memberships = true;
        }
    }
    if changed || memberships {
        log::info!("altering role '{}'", manifest.name);
    }
    session.execute_all(&statements)?;
    Ok(changed || memberships)
}

fn role_change(session: &Session<'_>, manifest: &RoleManifest) -> Result<bool> {
    let ctx = session.ctx();
    let results = ctx.hooks().all(Hook::RoleChange, |p| {
        p.role_change(ctx, manifest, session.instance())
    })?;
    Ok(results.into_iter().any(|changed| changed))
}

/// Creates, alters or drops a role to match `manifest`.
pub fn apply(session: &Session<'_>, manifest: &RoleManifest) -> Result<ApplyResult> {
    manifest.validate()?;
    let existing = exists(session, &manifest.name)?;
    let mut state = match (manifest.state, existing) {
        (PresenceState::Absent, true) => {
            drop(session, manifest)?;
            return Ok(ApplyResult::new(Some(ChangeState::Dropped)));
        }
        (PresenceState::Absent, false) => return Ok(ApplyResult::new(None)),
        (PresenceState::Present, false) => {
            create(session, manifest)?;
            Some(ChangeState::Created)
        }
        (PresenceState::Present, true) => alter(session, manifest)?.then_some(ChangeState::Changed),
    };
    if role_change(session, manifest)? && state.is_none() {
        state = Some(ChangeState::Changed);
    }
    Ok(ApplyResult::new(state))
}

/// Names of roles managed by the site configuration or plugins.
pub fn protected_roles(session: &Session<'_>) -> Result<Vec<String>> {
    let ctx = session.ctx();
    Ok(ctx
        .hooks()
        .all(Hook::Rolename, |p| p.rolename(ctx))?
        .into_iter()
        .flatten()
        .collect())
}

/// Drops a role, first dropping or reassigning what it owns when asked.
pub fn drop(session: &Session<'_>, manifest: &RoleManifest) -> Result<()> {
    if !exists(session, &manifest.name)? {
        return Err(Error::RoleNotFound(manifest.name.clone()));
    }
    if protected_roles(session)?.contains(&manifest.name) {
        return Err(Error::Validation(format!(
            "role '{}' is managed by pglift and cannot be dropped",
            manifest.name
        )));
    }
    log::info!("dropping role '{}'", manifest.name);
    let mut statements = Vec::new();
    if let Some(target) = &manifest.reassign_owned {
        statements.push(format!(
            "REASSIGN OWNED BY {} TO {}",
            quote_ident(&manifest.name),
            quote_ident(target)
        ));
    }
    if manifest.drop_owned.unwrap_or(false) || manifest.reassign_owned.is_some() {
        statements.push(format!("DROP OWNED BY {}", quote_ident(&manifest.name)));
    }
    statements.push(format!("DROP ROLE {}", quote_ident(&manifest.name)));
    session.execute_all(&statements)?;
    let mut absent = manifest.clone();
    absent.state = PresenceState::Absent;
    role_change(session, &absent)?;
    Ok(())
}
