//! Direct supervision through pid files and signals.

use std::path::Path;

use super::{wait_until, Runnable, ServiceManager, DEFAULT_TIMEOUT};
use crate::cmd::{self, CommandRunner};
use crate::error::{Error, Result};

/// Pid recorded in the first line of `path`, if any.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(path, e)),
    };
    let first = content.lines().next().unwrap_or("").trim();
    if first.is_empty() {
        return Ok(None);
    }
    first.parse::<i32>().map(Some).map_err(|_| Error::Configuration {
        path: path.to_path_buf(),
        message: format!("invalid pid '{}'", first),
    })
}

/// Checks `pid` with signal 0.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs error checking only, nothing is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether the pid file points to a live process.
pub fn is_running(path: &Path) -> Result<bool> {
    Ok(read_pid(path)?.map(is_process_alive).unwrap_or(false))
}

pub fn signal(pid: i32, sig: libc::c_int) -> Result<()> {
    // SAFETY: plain syscall; failure is reported through errno.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(Error::Unsupported(format!(
            "failed to send signal {} to process {}: {}",
            sig, pid, err
        )));
    }
    Ok(())
}

/// Spawns processes in the background and tracks them by pid file.
#[derive(Debug, Default, Clone, Copy)]
pub struct PidFileManager;

impl ServiceManager for PidFileManager {
    fn name(&self) -> &'static str {
        "pidfile"
    }

    fn start(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        let pidfile = service.pidfile();
        if is_running(&pidfile)? {
            log::debug!(
                "{} for {} is already running",
                service.service_name(),
                service.qualname()
            );
            return Ok(());
        }
        for path in std::iter::once(Some(&pidfile))
            .chain(std::iter::once(service.logfile().as_ref()))
            .flatten()
        {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }
        let logfile = service.logfile();
        let pid = cmd::spawn(runner, &service.command()?, logfile.as_deref())?;
        std::fs::write(&pidfile, format!("{}\n", pid)).map_err(|e| Error::io(&pidfile, e))?;
        let name = format!("{} for {}", service.service_name(), service.qualname());
        wait_until(&name, DEFAULT_TIMEOUT, || {
            if !is_process_alive(pid as i32) {
                return Err(Error::InstanceState(format!(
                    "{} exited during startup{}",
                    name,
                    logfile
                        .as_ref()
                        .map(|p| format!(", see {}", p.display()))
                        .unwrap_or_default()
                )));
            }
            Ok(service.is_ready(runner))
        })
    }

    fn stop(&self, _runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        let pidfile = service.pidfile();
        let Some(pid) = read_pid(&pidfile)? else {
            log::debug!("no pid file for {} of {}", service.service_name(), service.qualname());
            return Ok(());
        };
        if is_process_alive(pid) {
            signal(pid, libc::SIGTERM)?;
            wait_until(
                &format!("{} for {} to stop", service.service_name(), service.qualname()),
                DEFAULT_TIMEOUT,
                || Ok(!is_process_alive(pid)),
            )?;
        }
        match std::fs::remove_file(&pidfile) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&pidfile, e)),
        }
    }

    fn reload(&self, _runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        match read_pid(&service.pidfile())? {
            Some(pid) if is_process_alive(pid) => signal(pid, libc::SIGHUP),
            _ => Err(Error::InstanceState(format!(
                "{} for {} is not running",
                service.service_name(),
                service.qualname()
            ))),
        }
    }

    fn enable(&self, _runner: &dyn CommandRunner, _service: &dyn Runnable) -> Result<()> {
        Ok(())
    }

    fn disable(&self, _runner: &dyn CommandRunner, _service: &dyn Runnable) -> Result<()> {
        Ok(())
    }

    fn is_active(&self, _runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<bool> {
        is_running(&service.pidfile())
    }

    fn is_enabled(&self, _runner: &dyn CommandRunner, _service: &dyn Runnable) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::SystemRunner;
    use std::path::PathBuf;

    struct Sleeper {
        pidfile: PathBuf,
    }

    impl Runnable for Sleeper {
        fn service_name(&self) -> &'static str {
            "sleeper"
        }

        fn qualname(&self) -> String {
            "15-test".to_string()
        }

        fn args(&self) -> Result<Vec<String>> {
            Ok(vec!["sleep".to_string(), "30".to_string()])
        }

        fn pidfile(&self) -> PathBuf {
            self.pidfile.clone()
        }
    }

    #[test]
    fn test_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pid");
        assert_eq!(read_pid(&path).unwrap(), None);
        std::fs::write(&path, "1234\n/var/lib/pg\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(1234));
        std::fs::write(&path, "abc\n").unwrap();
        assert!(read_pid(&path).is_err());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id() as i32));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_start_stop_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let service = Sleeper {
            pidfile: dir.path().join("run/sleeper.pid"),
        };
        let manager = PidFileManager;
        let runner = SystemRunner;
        manager.start(&runner, &service).unwrap();
        assert!(manager.is_active(&runner, &service).unwrap());
        manager.stop(&runner, &service).unwrap();
        assert!(!manager.is_active(&runner, &service).unwrap());
        assert!(!service.pidfile.exists());
    }
}
