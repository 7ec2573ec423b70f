//! A running server process, its administrative connection, and handles to
//! the databases it hosts.
//!
//! Lifecycle: spawned by [`crate::InstanceFactory::load`], ready once the
//! `.s.PGSQL.<port>` socket shows up in the data directory, stopped exactly
//! once by [`RunningInstance::close`]. Dropping an instance that was never
//! closed stops it as a last resort, but callers should close explicitly.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, TempDbError};
use crate::sql;
use crate::uri::{Uri, UriOverrides};

/// Socket file name prefix; the suffix is the port number.
pub const SOCKET_PREFIX: &str = ".s.PGSQL.";

/// Server output lines kept for error reports.
const OUTPUT_TAIL_LINES: usize = 200;

/// How long each shutdown signal is given before the next step.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// SQLSTATE `cannot_connect_now`, sent while the server is still starting.
const STARTING_UP_SQLSTATE: &str = "57P03";

/// Port of the ready Unix socket in `dir`, if the server has created it.
///
/// The `.s.PGSQL.<port>.lock` sibling appears first and does not count.
pub fn socket_port(dir: &Path) -> io::Result<Option<u16>> {
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(port) = name.strip_prefix(SOCKET_PREFIX) {
            if let Ok(port) = port.parse::<u16>() {
                return Ok(Some(port));
            }
        }
    }
    Ok(None)
}

/// Tail of the server's stdout and stderr.
#[derive(Debug, Clone, Default)]
struct ServerOutput {
    lines: Arc<StdMutex<VecDeque<String>>>,
}

impl ServerOutput {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == OUTPUT_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn snapshot(&self) -> String {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

fn spawn_drain<R>(reader: R, output: ServerOutput, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "tempdb::server", stream, "{}", line);
            output.push(line);
        }
    })
}

fn send_signal(child: &Child, signal: libc::c_int) -> io::Result<()> {
    // Already reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Poll `child` until it exits or `grace` runs out.
fn wait_blocking(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to wait for server: {}", e);
                return None;
            }
        }
    }
}

/// Stop a server without awaiting: fast shutdown (SIGINT) first, then
/// immediate shutdown (SIGQUIT), each with `grace` to exit. SIGKILL is never
/// sent, it would orphan the backends. `None` means the server is still
/// running.
fn stop_blocking(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    for signal in [libc::SIGINT, libc::SIGQUIT] {
        if let Err(e) = send_signal(child, signal) {
            debug!("Failed to signal server: {}", e);
        }
        if let Some(status) = wait_blocking(child, grace) {
            return Some(status);
        }
    }
    None
}

/// Remove a directory tree, files before the directories holding them,
/// the root last.
fn remove_tree(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            TempDbError::Cleanup {
                path,
                source: e.into(),
            }
        })?;
        let path = entry.path();
        let removed = if entry.file_type().is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        removed.map_err(|source| TempDbError::Cleanup {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Readiness settings for a starting server.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StartupPolicy {
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
}

/// One live server process with its own data directory.
pub struct RunningInstance {
    uri: Uri,
    data_dir: PathBuf,
    transient: bool,
    child: Option<Child>,
    admin: Mutex<Option<PgConnection>>,
    exit_status: Option<ExitStatus>,
    output: ServerOutput,
    drains: Vec<JoinHandle<()>>,
    closed: bool,
}

impl RunningInstance {
    /// Take ownership of a freshly spawned server and wait until it accepts
    /// connections. On failure the process is stopped and, for transient
    /// instances, the data directory removed.
    pub(crate) async fn launch(
        mut child: Child,
        data_dir: PathBuf,
        uri: Uri,
        transient: bool,
        policy: StartupPolicy,
    ) -> Result<Self> {
        let output = ServerOutput::default();
        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, output.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, output.clone(), "stderr"));
        }

        let mut instance = Self {
            uri,
            data_dir,
            transient,
            child: Some(child),
            admin: Mutex::new(None),
            exit_status: None,
            output,
            drains,
            closed: false,
        };

        match instance.wait_until_ready(policy).await {
            Ok(()) => {
                info!(uri = ?instance.uri, "PostgreSQL instance ready");
                Ok(instance)
            }
            Err(e) => {
                instance.abort().await;
                Err(e)
            }
        }
    }

    async fn wait_until_ready(&mut self, policy: StartupPolicy) -> Result<()> {
        let started = Instant::now();
        // Too far out to represent means no bound
        let deadline = policy.timeout.and_then(|t| started.checked_add(t));

        let port = loop {
            if let Some(port) = socket_port(&self.data_dir)? {
                break port;
            }

            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.exit_status = Some(status);
                    self.child = None;
                    self.finish_drains().await;
                    return Err(TempDbError::Startup {
                        status,
                        output: self.output.snapshot(),
                    });
                }
            }

            if let (Some(deadline), Some(limit)) = (deadline, policy.timeout) {
                if Instant::now() >= deadline {
                    warn!("Server not ready after {:?}", limit);
                    return Err(TempDbError::StartupTimeout(limit));
                }
            }

            sleep(policy.poll_interval).await;
        };

        debug!("Socket for port {} ready after {:?}", port, started.elapsed());
        self.uri = self.uri.replace(UriOverrides::new().port(Some(port)));

        let conn = self.connect_admin(deadline, policy).await?;
        *self.admin.get_mut() = Some(conn);
        Ok(())
    }

    /// The socket can exist before the server accepts sessions, so
    /// "starting up" rejections are retried within the startup deadline.
    async fn connect_admin(
        &self,
        deadline: Option<Instant>,
        policy: StartupPolicy,
    ) -> Result<PgConnection> {
        let options = self
            .uri
            .replace(UriOverrides::new().database(Some(sql::ADMIN_DATABASE)))
            .pg_connect_options();

        loop {
            match PgConnection::connect_with(&options).await {
                Ok(conn) => return Ok(conn),
                Err(sqlx::Error::Database(e))
                    if e.code().as_deref() == Some(STARTING_UP_SQLSTATE) =>
                {
                    debug!("Server still starting up, retrying admin connection");
                }
                Err(e) => return Err(e.into()),
            }

            if let (Some(deadline), Some(limit)) = (deadline, policy.timeout) {
                if Instant::now() >= deadline {
                    return Err(TempDbError::StartupTimeout(limit));
                }
            }
            sleep(policy.poll_interval).await;
        }
    }

    /// Stop a server that never became usable with an immediate shutdown
    /// (SIGQUIT). The data directory is only removed once the server has
    /// exited.
    async fn abort(&mut self) {
        self.closed = true;
        let mut stopped = true;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = send_signal(&child, libc::SIGQUIT) {
                debug!("Failed to signal server: {}", e);
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => self.exit_status = Some(status),
                Ok(Err(e)) => {
                    warn!("Failed to wait for server: {}", e);
                    stopped = false;
                }
                Err(_) => {
                    warn!(
                        "Server still running {:?} after SIGQUIT, leaving {} in place",
                        SHUTDOWN_GRACE,
                        self.data_dir.display()
                    );
                    stopped = false;
                }
            }
        }
        if !stopped {
            for drain in self.drains.drain(..) {
                drain.abort();
            }
            return;
        }
        self.finish_drains().await;
        if self.transient {
            if let Err(e) = remove_tree(&self.data_dir) {
                warn!("Failed to remove data directory after failed start: {}", e);
            }
        }
    }

    async fn finish_drains(&mut self) {
        for drain in self.drains.drain(..) {
            let _ = drain.await;
        }
    }

    /// Connection URI of the instance (socket directory, port, superuser).
    ///
    /// It names no database; use [`Self::get_database`] or
    /// [`Uri::with_database`] for something a client can connect to.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// True if the data directory is deleted on close.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Exit status of the server, once it has stopped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Exit code of the server, once it has stopped. `None` while running
    /// or when it was ended by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|s| s.code())
    }

    /// Most recent lines the server wrote to stdout and stderr.
    pub fn server_output(&self) -> String {
        self.output.snapshot()
    }

    /// Names of user databases, in server order.
    pub async fn list_databases(&self) -> Result<Vec<String>> {
        let mut guard = self.admin.lock().await;
        let conn = guard.as_mut().ok_or(TempDbError::Closed)?;
        let names: Vec<String> = sqlx::query_scalar(sql::LIST_DATABASES)
            .fetch_all(&mut *conn)
            .await?;
        Ok(names
            .into_iter()
            .filter(|name| !sql::is_builtin_database(name))
            .collect())
    }

    async fn database_exists(&self, conn: &mut PgConnection, name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(sql::DATABASE_EXISTS)
            .bind(name)
            .fetch_one(conn)
            .await?;
        Ok(exists)
    }

    /// Create a database, optionally from a template.
    ///
    /// The existence check and the create are separate statements; two
    /// callers racing on one name can both pass the check, and the loser
    /// gets the server's duplicate_database error as [`TempDbError::Sql`].
    pub async fn create_database(
        &self,
        name: &str,
        template: Option<&str>,
    ) -> Result<DatabaseHandle<'_>> {
        let statement = sql::create_database(name, template)?;

        let mut guard = self.admin.lock().await;
        let conn = guard.as_mut().ok_or(TempDbError::Closed)?;
        if self.database_exists(conn, name).await? {
            return Err(TempDbError::AlreadyExists(name.to_string()));
        }

        debug!("Creating database {}", name);
        sqlx::raw_sql(&statement).execute(&mut *conn).await?;
        Ok(self.handle(name))
    }

    /// Handle to an existing database.
    pub async fn get_database(&self, name: &str) -> Result<DatabaseHandle<'_>> {
        let mut guard = self.admin.lock().await;
        let conn = guard.as_mut().ok_or(TempDbError::Closed)?;
        if !self.database_exists(conn, name).await? {
            return Err(TempDbError::NotFound(name.to_string()));
        }
        Ok(self.handle(name))
    }

    fn handle(&self, name: &str) -> DatabaseHandle<'_> {
        DatabaseHandle {
            instance: self,
            uri: self.uri.replace(UriOverrides::new().database(Some(name))),
        }
    }

    /// Stop the server and release everything the instance owns.
    ///
    /// Other client sessions are terminated first so the shutdown cannot
    /// hang on them, then the admin connection is closed and the server
    /// gets SIGTERM. Transient data directories are removed afterwards.
    /// Calling this again is a no-op. When several steps fail, the first
    /// error is returned after the remaining steps have run.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error: Option<TempDbError> = None;

        if let Some(mut conn) = self.admin.get_mut().take() {
            if let Err(e) = sqlx::raw_sql(sql::TERMINATE_OTHER_BACKENDS)
                .execute(&mut conn)
                .await
            {
                warn!("Failed to terminate client sessions: {}", e);
                first_error.get_or_insert(e.into());
            }
            if let Err(e) = conn.close().await {
                debug!("Admin connection did not close cleanly: {}", e);
            }
        }

        if let Some(mut child) = self.child.take() {
            if let Err(e) = send_signal(&child, libc::SIGTERM) {
                warn!("Failed to signal server: {}", e);
            }
            match child.wait().await {
                Ok(status) => self.exit_status = Some(status),
                Err(e) => {
                    warn!("Failed to wait for server: {}", e);
                    first_error.get_or_insert(e.into());
                }
            }
        }
        self.finish_drains().await;

        info!(
            data_dir = %self.data_dir.display(),
            exit_code = ?self.exit_code(),
            "PostgreSQL instance stopped"
        );

        if self.transient {
            debug!("Removing transient data directory {}", self.data_dir.display());
            if let Err(e) = remove_tree(&self.data_dir) {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RunningInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningInstance")
            .field("uri", &self.uri)
            .field("data_dir", &self.data_dir)
            .field("transient", &self.transient)
            .field("closed", &self.closed)
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

impl Drop for RunningInstance {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        warn!(
            "Instance at {} dropped without close(), stopping it",
            self.data_dir.display()
        );

        let mut stopped = true;
        if let Some(mut child) = self.child.take() {
            // No async here to terminate sessions; fast shutdown disconnects
            // them itself.
            match stop_blocking(&mut child, SHUTDOWN_GRACE) {
                Some(status) => self.exit_status = Some(status),
                None => {
                    warn!(
                        "Server did not stop, leaving {} in place",
                        self.data_dir.display()
                    );
                    stopped = false;
                }
            }
        }

        for drain in self.drains.drain(..) {
            drain.abort();
        }

        if self.transient && stopped {
            if let Err(e) = remove_tree(&self.data_dir) {
                warn!("{}", e);
            }
        }
    }
}

/// A database inside a [`RunningInstance`]. Cannot outlive the instance.
#[derive(Debug, Clone)]
pub struct DatabaseHandle<'a> {
    instance: &'a RunningInstance,
    uri: Uri,
}

impl<'a> DatabaseHandle<'a> {
    pub fn name(&self) -> &str {
        self.uri.database().unwrap_or_default()
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Connection string for client libraries.
    pub fn dsn(&self) -> String {
        self.uri.to_string()
    }

    pub fn instance(&self) -> &'a RunningInstance {
        self.instance
    }

    /// Open a new client connection to this database.
    pub async fn connect(&self) -> Result<PgConnection> {
        let conn = PgConnection::connect_with(&self.uri.pg_connect_options()).await?;
        Ok(conn)
    }
}
