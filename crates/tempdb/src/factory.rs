//! Cluster provisioning and server startup for one installation.

use std::ffi::CStr;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::TempDbConfig;
use crate::discover::{detect_version, find_installation, HostSystem, INITDB_BIN, POSTGRES_BIN};
use crate::error::{Result, TempDbError};
use crate::instance::{RunningInstance, StartupPolicy};
use crate::uri::{Params, Uri};
use crate::version::Version;

/// Server settings passed as `-c key=value`.
pub type ServerParams = Params;

/// Readiness wait bound used unless configured otherwise.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between socket readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const URI_SCHEME: &str = "postgresql";
const TEMP_DIR_PREFIX: &str = "tempdb-";

/// Creates clusters and starts servers from one bin directory.
#[derive(Debug)]
pub struct InstanceFactory {
    bin_dir: PathBuf,
    initdb: PathBuf,
    postgres: PathBuf,
    superuser: String,
    version: OnceCell<Version>,
    startup_timeout: Option<Duration>,
    poll_interval: Duration,
    default_params: ServerParams,
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Login name of the current user: `$USER`, `$LOGNAME`, then the passwd
/// entry of the real uid.
fn current_user() -> Result<String> {
    for key in ["USER", "LOGNAME"] {
        if let Ok(name) = std::env::var(key) {
            if !name.is_empty() {
                return Ok(name);
            }
        }
    }
    passwd_name().ok_or_else(|| {
        TempDbError::config("unable to determine the current user, pass a superuser explicitly")
    })
}

fn passwd_name() -> Option<String> {
    let uid = unsafe { libc::getuid() };
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 4096];

    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

fn is_empty_dir(dir: &Path) -> io::Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

impl InstanceFactory {
    /// Factory for the installation in `bin_dir`.
    ///
    /// Both `initdb` and `postgres` must be present and executable. The
    /// superuser defaults to the current OS user.
    pub fn new(bin_dir: impl AsRef<Path>, superuser: Option<&str>) -> Result<Self> {
        let bin_dir = bin_dir.as_ref().to_path_buf();
        let initdb = bin_dir.join(INITDB_BIN);
        let postgres = bin_dir.join(POSTGRES_BIN);

        for exe in [&initdb, &postgres] {
            if !is_executable(exe) {
                return Err(TempDbError::installation(
                    &bin_dir,
                    format!("{} is missing or not executable", exe.display()),
                ));
            }
        }

        let superuser = match superuser {
            Some(user) => user.to_string(),
            None => current_user()?,
        };

        Ok(Self {
            bin_dir,
            initdb,
            postgres,
            superuser,
            version: OnceCell::new(),
            startup_timeout: Some(DEFAULT_STARTUP_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_params: ServerParams::new(),
        })
    }

    /// Factory built from configuration, discovering an installation when
    /// no bin directory is configured.
    pub fn from_config(config: &TempDbConfig) -> Result<Self> {
        let bin_dir = match &config.bin_dir {
            Some(dir) => dir.clone(),
            None => {
                let hint = config.version_hint()?;
                match find_installation(hint.as_ref())? {
                    Some(dir) => dir,
                    None => {
                        warn!(
                            "No installation matches version {}",
                            config.version.as_deref().unwrap_or_default()
                        );
                        return Err(TempDbError::NoInstallation);
                    }
                }
            }
        };

        let mut factory = Self::new(bin_dir, config.superuser.as_deref())?
            .with_startup_timeout(config.startup_timeout())
            .with_poll_interval(config.poll_interval());
        factory.default_params = config.server_params();
        Ok(factory)
    }

    /// Bound on the readiness wait; `None` waits forever.
    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn superuser(&self) -> &str {
        &self.superuser
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout
    }

    /// Version of the installation, detected on first use.
    pub fn version(&self) -> Result<Version> {
        self.version
            .get_or_try_init(|| detect_version(&HostSystem, &self.postgres))
            .copied()
    }

    /// Initialize a new cluster owned by the superuser, trusting local
    /// connections.
    ///
    /// Without `data_dir` a private temporary directory is created. An
    /// existing directory must be empty.
    pub async fn provision(&self, data_dir: Option<&Path>) -> Result<PathBuf> {
        let (data_dir, allocated) = match data_dir {
            Some(dir) => {
                if dir.exists() && !is_empty_dir(dir)? {
                    return Err(TempDbError::NotEmpty(dir.to_path_buf()));
                }
                (dir.to_path_buf(), false)
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(TEMP_DIR_PREFIX)
                    .tempdir()?
                    .keep();
                (dir, true)
            }
        };

        info!(
            data_dir = %data_dir.display(),
            superuser = %self.superuser,
            "Initializing PostgreSQL cluster"
        );
        let output = Command::new(&self.initdb)
            .arg("-U")
            .arg(&self.superuser)
            .args(["-A", "trust", "-D"])
            .arg(&data_dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        debug!("initdb output: {}", String::from_utf8_lossy(&output.stdout).trim());

        if !output.status.success() {
            if allocated {
                if let Err(e) = std::fs::remove_dir_all(&data_dir) {
                    warn!("Failed to remove {}: {}", data_dir.display(), e);
                }
            }
            return Err(TempDbError::Provisioning {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(data_dir)
    }

    /// Provision a throwaway cluster and start it. The data directory is
    /// deleted when the instance is closed.
    ///
    /// UNSAFE for anything but disposable data: the server runs with
    /// `fsync=off` and `full_page_writes=off`, so a crash can corrupt it.
    pub async fn provision_and_start(&self) -> Result<RunningInstance> {
        self.provision_and_start_with(ServerParams::new()).await
    }

    /// [`provision_and_start`](Self::provision_and_start) with extra server
    /// settings applied on top. The same durability warning applies.
    pub async fn provision_and_start_with(&self, extra: ServerParams) -> Result<RunningInstance> {
        let data_dir = self.provision(None).await?;
        let mut params = ServerParams::new();
        params.insert("fsync", false);
        params.insert("full_page_writes", false);
        for (key, value) in extra.iter() {
            params.insert(key, value.clone());
        }
        self.load(&data_dir, true, params).await
    }

    /// Start a server on an existing data directory and wait until it
    /// accepts connections.
    ///
    /// The server listens only on a Unix socket inside the data directory.
    /// `params` override configured defaults of the same name. A transient
    /// instance deletes the data directory when closed, or when startup
    /// fails.
    pub async fn load(
        &self,
        data_dir: impl AsRef<Path>,
        transient: bool,
        params: ServerParams,
    ) -> Result<RunningInstance> {
        let data_dir = std::fs::canonicalize(data_dir.as_ref())?;
        let socket_dir = data_dir.to_str().ok_or_else(|| {
            TempDbError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("data directory {} is not valid UTF-8", data_dir.display()),
            ))
        })?;

        let mut settings = self.default_params.clone();
        for (key, value) in params.iter() {
            settings.insert(key, value.clone());
        }

        let mut command = Command::new(&self.postgres);
        command
            .arg("-D")
            .arg(&data_dir)
            .arg("-k")
            .arg(&data_dir)
            .args(["-c", "listen_addresses="]);
        for (key, value) in settings.iter() {
            command.arg("-c").arg(format!("{key}={value}"));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Starting {:?}", command.as_std());
        let child = command.spawn()?;
        info!(
            data_dir = %data_dir.display(),
            pid = ?child.id(),
            transient,
            "PostgreSQL server starting"
        );

        let uri = Uri::new(URI_SCHEME)
            .with_user(self.superuser.as_str())
            .with_host(socket_dir);
        let policy = StartupPolicy {
            timeout: self.startup_timeout,
            poll_interval: self.poll_interval,
        };
        RunningInstance::launch(child, data_dir, uri, transient, policy).await
    }
}
