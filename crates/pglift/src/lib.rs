pub mod cmd;
pub mod conf;
pub mod ctx;
pub mod databases;
pub mod db;
pub mod dumps;
pub mod error;
pub mod hooks;
pub mod ini;
pub mod instances;
pub mod lock;
pub mod logging;
pub mod model;
pub mod passfile;
pub mod patroni;
pub mod pgbackrest;
pub mod postgresql;
pub mod powa;
pub mod prometheus;
pub mod roles;
pub mod sanitize;
pub mod service;
pub mod settings;
pub mod ssl;
pub mod task;
pub mod temboard;
pub mod upgrade;
pub mod version;

pub use cmd::{Cmd, CommandRunner, Output, SystemRunner};
pub use conf::{ChangeSet, Configuration, Value};
pub use ctx::{AssumeNo, AssumeYes, Confirm, Context, ContextBuilder};
pub use error::{CommandError, Error, Result, SettingsError};
pub use hooks::{Hook, HookManager, HookOrder, Plugin};
pub use logging::{LogFormat, LoggingError};
pub use model::{
    ApplyResult, BaseInstance, DatabaseManifest, Instance, InstanceManifest, InstanceState,
    PostgreSQLInstance, RoleManifest, Service, ServiceKind,
};
pub use settings::{load_from_sources, Settings, SettingsSource};
pub use upgrade::UpgradeOptions;
pub use version::Version;

/// Host name of this machine, `localhost` when it cannot be determined.
pub(crate) fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer outlives the call and its length is passed along.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..len]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}
