use std::collections::{BTreeMap, HashMap};

use super::{values_equal, Configuration, Value};

/// Parameter name to `(before, after)`; `None` means absent on that side.
pub type ChangeSet = BTreeMap<String, (Option<Value>, Option<Value>)>;

/// Parameters which always need a restart, whatever the catalog says.
const ALWAYS_RESTART: &[&str] = &["port"];

/// Semantic difference between two configurations.
pub fn diff(before: &Configuration, after: &Configuration) -> ChangeSet {
    let before = before.as_map();
    let after = after.as_map();
    let mut changes = ChangeSet::new();
    for (name, old) in &before {
        match after.get(name) {
            None => {
                changes.insert(name.clone(), (Some(old.clone()), None));
            }
            Some(new) if !values_equal(old, new) => {
                changes.insert(name.clone(), (Some(old.clone()), Some(new.clone())));
            }
            Some(_) => {}
        }
    }
    for (name, new) in after {
        if !before.contains_key(&name) {
            changes.insert(name, (None, Some(new)));
        }
    }
    changes
}

/// Splits changed parameters into `(reload, restart)` lists.
///
/// `contexts` maps parameter names to `pg_settings.context`; without it
/// (server not running) every change is classified as needing a restart.
pub fn classify(
    changes: &ChangeSet,
    contexts: Option<&HashMap<String, String>>,
) -> (Vec<String>, Vec<String>) {
    let mut reload = Vec::new();
    let mut restart = Vec::new();
    for name in changes.keys() {
        let needs_restart = ALWAYS_RESTART.contains(&name.as_str())
            || match contexts {
                None => true,
                Some(contexts) => match contexts.get(name) {
                    Some(context) => context == "postmaster",
                    None => true,
                },
            };
        if needs_restart {
            restart.push(name.clone());
        } else {
            reload.push(name.clone());
        }
    }
    (reload, restart)
}
