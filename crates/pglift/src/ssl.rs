//! Self-signed server certificates for instances with `ssl = on` and no
//! certificate of their own.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::cmd::Cmd;
use crate::conf::{Configuration, Value};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::model::BaseInstance;

const VALIDITY_DAYS: u32 = 365;

/// Certificate and key paths generated for `instance`.
pub fn certificate_paths(instance: &BaseInstance) -> (PathBuf, PathBuf) {
    let dir = instance.ssl_cert_directory();
    let qualname = instance.qualname();
    (
        dir.join(format!("{}.crt", qualname)),
        dir.join(format!("{}.key", qualname)),
    )
}

/// Generates the instance certificate unless both files exist.
pub fn ensure_certificate(ctx: &Context, instance: &BaseInstance) -> Result<(PathBuf, PathBuf)> {
    let (cert, key) = certificate_paths(instance);
    if cert.exists() && key.exists() {
        return Ok((cert, key));
    }
    let dir = instance.ssl_cert_directory();
    fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    log::info!("generating self-signed certificate for instance {}", instance);
    ctx.run(
        &Cmd::new("openssl")
            .args(["req", "-new", "-x509", "-nodes", "-days"])
            .arg(VALIDITY_DAYS.to_string())
            .arg("-subj")
            .arg(format!("/CN={}", crate::hostname()))
            .arg("-keyout")
            .arg(&key)
            .arg("-out")
            .arg(&cert),
    )?;
    if key.exists() {
        fs::set_permissions(&key, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(&key, e))?;
    }
    Ok((cert, key))
}

/// Points `ssl_cert_file`/`ssl_key_file` to a generated certificate when
/// SSL is enabled without one.
pub fn configure(ctx: &Context, config: &mut Configuration, instance: &BaseInstance) -> Result<()> {
    let enabled = config.get("ssl").and_then(Value::as_bool).unwrap_or(false);
    if !enabled || config.contains("ssl_cert_file") || config.contains("ssl_key_file") {
        return Ok(());
    }
    let (cert, key) = ensure_certificate(ctx, instance)?;
    config.set("ssl_cert_file", Value::Str(cert.to_string_lossy().into_owned()));
    config.set("ssl_key_file", Value::Str(key.to_string_lossy().into_owned()));
    Ok(())
}

/// Removes the generated certificate, if any.
pub fn remove_certificate(instance: &BaseInstance) -> Result<()> {
    let (cert, key) = certificate_paths(instance);
    for path in [cert, key] {
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&path, e)),
        }
    }
    Ok(())
}
