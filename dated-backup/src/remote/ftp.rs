//! FTP transport.
//!
//! One control connection per run, opened lazily on the first call and
//! logged in with the configured credentials. A network failure drops the
//! connection so the next call (usually the next upload attempt) starts a
//! fresh session. Reply codes map onto the error taxonomy: 4xx replies are
//! transient, 5xx are permanent.

use super::{join_remote, leaf_name, parent_of, DirectoryMemo, RemoteTransport};
use crate::config::FtpConfig;
use crate::utils::errors::{BackupError, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpResult, FtpStream};
use tracing::{debug, info, warn};

/// "Requested action not taken": missing file or directory, or no access
const REPLY_UNAVAILABLE: u32 = 550;
/// "Requested file action not taken", some servers' answer to NLST on an empty dir
const REPLY_NO_FILES: u32 = 450;

/// The FTP commands the transport issues on a logged-in session
pub trait FtpSession: Send {
    fn cwd(&mut self, path: &str) -> FtpResult<()>;
    fn mkdir(&mut self, path: &str) -> FtpResult<()>;
    fn put_file(&mut self, path: &str, reader: &mut dyn Read) -> FtpResult<u64>;
    fn nlst(&mut self, path: &str) -> FtpResult<Vec<String>>;
    fn rm(&mut self, path: &str) -> FtpResult<()>;
    fn rmdir(&mut self, path: &str) -> FtpResult<()>;
    fn rename(&mut self, from: &str, to: &str) -> FtpResult<()>;
    fn quit(&mut self) -> FtpResult<()>;
}

impl FtpSession for FtpStream {
    fn cwd(&mut self, path: &str) -> FtpResult<()> {
        FtpStream::cwd(self, path)
    }

    fn mkdir(&mut self, path: &str) -> FtpResult<()> {
        FtpStream::mkdir(self, path)
    }

    fn put_file(&mut self, path: &str, mut reader: &mut dyn Read) -> FtpResult<u64> {
        FtpStream::put_file(self, path, &mut reader)
    }

    fn nlst(&mut self, path: &str) -> FtpResult<Vec<String>> {
        FtpStream::nlst(self, Some(path))
    }

    fn rm(&mut self, path: &str) -> FtpResult<()> {
        FtpStream::rm(self, path)
    }

    fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        FtpStream::rmdir(self, path)
    }

    fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        FtpStream::rename(self, from, to)
    }

    fn quit(&mut self) -> FtpResult<()> {
        FtpStream::quit(self)
    }
}

type Connector = Box<dyn Fn(&FtpConfig) -> Result<Box<dyn FtpSession>> + Send>;

pub struct FtpTransport {
    config: FtpConfig,
    connector: Connector,
    session: Option<Box<dyn FtpSession>>,
    dirs: DirectoryMemo,
}

impl FtpTransport {
    pub fn new(config: FtpConfig) -> Self {
        Self::with_connector(config, connect)
    }

    /// Use `connector` to open sessions instead of dialing `config.host`
    pub fn with_connector<C>(config: FtpConfig, connector: C) -> Self
    where
        C: Fn(&FtpConfig) -> Result<Box<dyn FtpSession>> + Send + 'static,
    {
        Self {
            config,
            connector: Box::new(connector),
            session: None,
            dirs: DirectoryMemo::default(),
        }
    }

    /// Run one FTP command against the session, connecting if needed.
    /// A transient failure discards the session.
    fn call<T, F>(&mut self, context: &str, op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn FtpSession) -> FtpResult<T>,
    {
        if self.session.is_none() {
            self.session = Some((self.connector)(&self.config)?);
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BackupError::Network("no session".into()))?;

        match op(session.as_mut()) {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = classify(e, context);
                if err.is_transient() {
                    warn!(error = %err, "Dropping FTP session after network error");
                    self.session = None;
                    self.dirs = DirectoryMemo::default();
                }
                Err(err)
            }
        }
    }

    fn is_directory(&mut self, path: &str) -> Result<bool> {
        match self.call(&format!("CWD {}", path), |ftp| ftp.cwd(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// NLST that treats "no files" replies from a reachable directory as empty
    fn raw_list(&mut self, path: &str) -> Result<Vec<String>> {
        let listing = self.call(&format!("NLST {}", path), |ftp| match ftp.nlst(path) {
            Err(e) if matches!(reply_code(&e), Some(REPLY_NO_FILES) | Some(REPLY_UNAVAILABLE)) => {
                Ok(None)
            }
            other => other.map(Some),
        })?;

        if let Some(names) = listing {
            return Ok(names);
        }
        if self.is_directory(path)? {
            debug!(path, "Empty listing");
            Ok(Vec::new())
        } else {
            Err(BackupError::NotFound(path.to_string()))
        }
    }
}

/// Dial, log in and switch to binary mode
fn connect(config: &FtpConfig) -> Result<Box<dyn FtpSession>> {
    let timeout = config.timeout();
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| BackupError::Network(format!("resolving {}: {}", config.host, e)))?
        .collect();

    let mut last_error = None;
    let mut stream = None;
    for addr in addrs {
        match FtpStream::connect_timeout(addr, timeout) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let mut stream = match (stream, last_error) {
        (Some(s), _) => s,
        (None, Some(e)) => return Err(classify(e, &format!("connecting to {}", config.address()))),
        (None, None) => {
            return Err(BackupError::Network(format!(
                "{} resolved to no addresses",
                config.host
            )))
        }
    };

    // Per-operation timeout on the control channel
    let socket = stream.get_ref();
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;

    stream
        .login(config.username.as_str(), config.password.as_str())
        .map_err(|e| classify(e, "login"))?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|e| classify(e, "TYPE I"))?;

    info!(endpoint = %config.address(), user = %config.username, "Connected to FTP");
    Ok(Box::new(stream))
}

impl RemoteTransport for FtpTransport {
    fn endpoint(&self) -> String {
        format!("ftp://{}", self.config.address())
    }

    fn ensure_directory(&mut self, path: &str) -> Result<()> {
        for dir in self.dirs.missing(path) {
            if !self.is_directory(&dir)? {
                self.call(&format!("MKD {}", dir), |ftp| ftp.mkdir(&dir))?;
                info!(path = %dir, "Created remote directory");
            }
            self.dirs.insert(&dir);
        }
        Ok(())
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let file = File::open(local)?;
        let mut reader = BufReader::new(file);
        self.call(&format!("STOR {}", remote), |ftp| ftp.put_file(remote, &mut reader))
    }

    fn list_all(&mut self, path: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .raw_list(path)?
            .iter()
            .map(|entry| leaf_name(entry).to_string())
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn delete_tree(&mut self, path: &str) -> Result<()> {
        if !self.is_directory(path)? {
            return Err(BackupError::NotFound(path.to_string()));
        }

        // Hidden entries too, or RMD fails on a non-empty directory
        for name in self.list_all(path)? {
            let child = join_remote(path, &name);
            match self.call(&format!("DELE {}", child), |ftp| ftp.rm(&child)) {
                Ok(()) => debug!(path = %child, "Deleted remote file"),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    if self.is_directory(&child)? {
                        self.delete_tree(&child)?;
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        // Step out before removing the directory we may be sitting in
        let parent = parent_of(path);
        self.call(&format!("CWD {}", parent), |ftp| ftp.cwd(&parent))?;
        self.call(&format!("RMD {}", path), |ftp| ftp.rmdir(path))?;
        self.dirs.forget_tree(path);
        debug!(path, "Deleted remote directory");
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.call(&format!("RNFR {} / RNTO {}", from, to), |ftp| ftp.rename(from, to))?;
        self.dirs.forget_tree(from);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            match session.quit() {
                Ok(()) => info!(endpoint = %self.endpoint(), "FTP session closed"),
                Err(e) => debug!(error = %e, "QUIT failed, dropping connection"),
            }
        }
        Ok(())
    }
}

impl Drop for FtpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// FTP reply code carried by an error, if any
fn reply_code(err: &FtpError) -> Option<u32> {
    match err {
        FtpError::UnexpectedResponse(response) => Some(response.status.code()),
        _ => None,
    }
}

/// Map a reply code to the error taxonomy
fn classify_code(code: u32, message: String) -> BackupError {
    match code {
        400..=499 => BackupError::Network(message),
        _ => BackupError::Protocol(message),
    }
}

fn classify(err: FtpError, context: &str) -> BackupError {
    let message = format!("{}: {}", context, err);
    if let Some(code) = reply_code(&err) {
        return classify_code(code, message);
    }
    match err {
        FtpError::ConnectionError(_) | FtpError::BadResponse => BackupError::Network(message),
        _ => BackupError::Protocol(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};
    use std::sync::{Arc, Mutex};
    use suppaftp::types::Response;
    use suppaftp::Status;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn config() -> FtpConfig {
        FtpConfig {
            host: "ftp.example.com".into(),
            port: 2121,
            username: "me".into(),
            password: "secret".into(),
            root: "/backups".into(),
            timeout_secs: 5,
        }
    }

    fn reply(code: u32) -> FtpError {
        FtpError::UnexpectedResponse(Response::new(Status::from(code), format!("{} nope", code).into_bytes()))
    }

    /// In-memory server state shared by every session it hands out
    #[derive(Default)]
    struct ServerState {
        dirs: BTreeSet<String>,
        files: BTreeMap<String, Vec<u8>>,
        commands: Vec<String>,
        connects: usize,
        /// Reply code for NLST on an empty directory, `None` answers with an empty list
        empty_nlst_reply: Option<u32>,
        /// Errors returned by the next commands, in order
        inject: VecDeque<FtpError>,
    }

    impl ServerState {
        fn with_dirs(dirs: &[&str]) -> Self {
            let mut state = Self::default();
            state.dirs.insert("/".to_string());
            for dir in dirs {
                state.dirs.insert(dir.to_string());
            }
            state
        }

        fn children(&self, dir: &str) -> Vec<String> {
            let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
            self.dirs
                .iter()
                .chain(self.files.keys())
                .filter(|p| p.starts_with(&prefix) && p.len() > prefix.len() && !p[prefix.len()..].contains('/'))
                .cloned()
                .collect()
        }

        fn count(&self, command: &str) -> usize {
            self.commands.iter().filter(|c| c.starts_with(command)).count()
        }
    }

    struct ScriptedSession {
        state: Arc<Mutex<ServerState>>,
    }

    impl ScriptedSession {
        fn begin(&self, command: String) -> FtpResult<std::sync::MutexGuard<'_, ServerState>> {
            let mut state = self.state.lock().unwrap();
            state.commands.push(command);
            match state.inject.pop_front() {
                Some(err) => Err(err),
                None => Ok(state),
            }
        }
    }

    impl FtpSession for ScriptedSession {
        fn cwd(&mut self, path: &str) -> FtpResult<()> {
            let state = self.begin(format!("CWD {}", path))?;
            if state.dirs.contains(path) { Ok(()) } else { Err(reply(550)) }
        }

        fn mkdir(&mut self, path: &str) -> FtpResult<()> {
            let mut state = self.begin(format!("MKD {}", path))?;
            if state.dirs.contains(path) || !state.dirs.contains(&parent_of(path)) {
                return Err(reply(550));
            }
            state.dirs.insert(path.to_string());
            Ok(())
        }

        fn put_file(&mut self, path: &str, reader: &mut dyn Read) -> FtpResult<u64> {
            let mut state = self.begin(format!("STOR {}", path))?;
            if !state.dirs.contains(&parent_of(path)) {
                return Err(reply(553));
            }
            let mut body = Vec::new();
            reader.read_to_end(&mut body).map_err(FtpError::ConnectionError)?;
            let len = body.len() as u64;
            state.files.insert(path.to_string(), body);
            Ok(len)
        }

        fn nlst(&mut self, path: &str) -> FtpResult<Vec<String>> {
            let state = self.begin(format!("NLST {}", path))?;
            if !state.dirs.contains(path) {
                return Err(reply(550));
            }
            let children = state.children(path);
            match (children.is_empty(), state.empty_nlst_reply) {
                (true, Some(code)) => Err(reply(code)),
                // Full paths, as some servers answer
                _ => Ok(children),
            }
        }

        fn rm(&mut self, path: &str) -> FtpResult<()> {
            let mut state = self.begin(format!("DELE {}", path))?;
            state.files.remove(path).map(|_| ()).ok_or_else(|| reply(550))
        }

        fn rmdir(&mut self, path: &str) -> FtpResult<()> {
            let mut state = self.begin(format!("RMD {}", path))?;
            if !state.dirs.contains(path) || !state.children(path).is_empty() {
                return Err(reply(550));
            }
            state.dirs.remove(path);
            Ok(())
        }

        fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
            let mut state = self.begin(format!("RNFR {} RNTO {}", from, to))?;
            let moved = |p: &String| p == from || p.starts_with(&format!("{}/", from));
            let dirs: Vec<String> = state.dirs.iter().filter(|p| moved(p)).cloned().collect();
            let files: Vec<String> = state.files.keys().filter(|p| moved(p)).cloned().collect();
            if dirs.is_empty() && files.is_empty() {
                return Err(reply(550));
            }
            for dir in dirs {
                state.dirs.remove(&dir);
                state.dirs.insert(format!("{}{}", to, &dir[from.len()..]));
            }
            for file in files {
                if let Some(body) = state.files.remove(&file) {
                    state.files.insert(format!("{}{}", to, &file[from.len()..]), body);
                }
            }
            Ok(())
        }

        fn quit(&mut self) -> FtpResult<()> {
            self.begin("QUIT".to_string()).map(|_| ())
        }
    }

    fn scripted(state: ServerState) -> (FtpTransport, Arc<Mutex<ServerState>>) {
        let state = Arc::new(Mutex::new(state));
        let shared = Arc::clone(&state);
        let transport = FtpTransport::with_connector(config(), move |_| {
            shared.lock().unwrap().connects += 1;
            Ok(Box::new(ScriptedSession {
                state: Arc::clone(&shared),
            }) as Box<dyn FtpSession>)
        });
        (transport, state)
    }

    #[test]
    fn test_reply_classes() {
        assert!(classify_code(421, "service not available".into()).is_transient());
        assert!(classify_code(426, "connection closed".into()).is_transient());
        assert!(classify_code(450, "file busy".into()).is_transient());
        assert!(matches!(classify_code(530, "not logged in".into()), BackupError::Protocol(_)));
        assert!(matches!(classify_code(550, "no such file".into()), BackupError::Protocol(_)));
        assert!(matches!(classify_code(553, "bad name".into()), BackupError::Protocol(_)));
    }

    #[test]
    fn test_connection_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = classify(FtpError::ConnectionError(io), "STOR /x");
        assert!(err.is_transient());
        assert!(err.to_string().contains("STOR /x"));
    }

    #[test]
    fn test_new_does_not_connect() {
        let transport = FtpTransport::new(config());
        assert!(transport.session.is_none());
        assert_eq!(transport.endpoint(), "ftp://ftp.example.com:2121");
    }

    #[test]
    fn test_close_without_session_is_noop() {
        let mut transport = FtpTransport::new(config());
        assert!(transport.close().is_ok());
        assert!(transport.close().is_ok());
    }

    #[test]
    fn test_empty_directory_reply_is_an_empty_listing() {
        for code in [REPLY_NO_FILES, REPLY_UNAVAILABLE] {
            let mut state = ServerState::with_dirs(&["/b", "/b/empty"]);
            state.empty_nlst_reply = Some(code);
            let (mut transport, server) = scripted(state);

            assert!(transport.list_directory("/b/empty").unwrap().is_empty(), "reply {code}");
            assert_eq!(server.lock().unwrap().count("CWD /b/empty"), 1);

            let err = transport.list_directory("/b/missing").unwrap_err();
            assert!(err.is_not_found(), "reply {code}");
        }
    }

    #[test]
    fn test_listing_strips_prefixes_and_hides_dot_entries() {
        let (mut transport, _server) = scripted(ServerState::with_dirs(&[
            "/b",
            "/b/2024-03-01",
            "/b/2024-02-01",
            "/b/.2024-03-02.partial",
        ]));

        assert_eq!(transport.list_directory("/b").unwrap(), vec!["2024-02-01", "2024-03-01"]);
        assert_eq!(
            transport.list_all("/b").unwrap(),
            vec![".2024-03-02.partial", "2024-02-01", "2024-03-01"]
        );
    }

    #[test]
    fn test_ensure_directory_creates_only_missing_ancestors_once() {
        let (mut transport, server) = scripted(ServerState::with_dirs(&["/backups"]));

        transport.ensure_directory("/backups/notes/2024-03-01").unwrap();
        let issued = server.lock().unwrap().commands.len();
        transport.ensure_directory("/backups/notes/2024-03-01").unwrap();
        transport.ensure_directory("/backups/notes").unwrap();

        let server = server.lock().unwrap();
        assert!(server.dirs.contains("/backups/notes/2024-03-01"));
        assert_eq!(server.count("MKD"), 2);
        assert_eq!(server.count("MKD /backups/notes"), 2);
        assert_eq!(server.commands.len(), issued, "known directories cost no round trip");
    }

    #[test]
    fn test_delete_tree_tries_files_then_recurses() {
        let mut state = ServerState::with_dirs(&["/b", "/b/g", "/b/g/sub"]);
        state.files.insert("/b/g/a.md".into(), b"alpha".to_vec());
        state.files.insert("/b/g/sub/b.md".into(), b"beta".to_vec());
        state.files.insert("/b/keep.md".into(), b"keep".to_vec());
        let (mut transport, server) = scripted(state);

        transport.delete_tree("/b/g").unwrap();

        let server = server.lock().unwrap();
        assert_eq!(server.dirs.iter().collect::<Vec<_>>(), vec!["/", "/b"]);
        assert_eq!(server.files.keys().collect::<Vec<_>>(), vec!["/b/keep.md"]);

        let position = |cmd: &str| server.commands.iter().position(|c| c == cmd).unwrap();
        assert!(position("DELE /b/g/sub") < position("RMD /b/g/sub"));
        assert!(position("RMD /b/g/sub") < position("RMD /b/g"));
    }

    #[test]
    fn test_delete_missing_tree_is_not_found() {
        let (mut transport, _server) = scripted(ServerState::with_dirs(&["/b"]));

        let err = transport.delete_tree("/b/2024-01-01").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_network_error_drops_session_and_reconnects() {
        let (mut transport, server) = scripted(ServerState::with_dirs(&["/b"]));
        transport.ensure_directory("/b").unwrap();

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        server.lock().unwrap().inject.push_back(FtpError::ConnectionError(reset));
        let err = transport.list_directory("/b").unwrap_err();

        assert!(err.is_transient());
        assert!(transport.session.is_none());
        assert_eq!(server.lock().unwrap().connects, 1);

        assert!(transport.list_directory("/b").unwrap().is_empty());
        assert_eq!(server.lock().unwrap().connects, 2);
    }

    #[test]
    fn test_permanent_error_keeps_session() {
        let (mut transport, server) = scripted(ServerState::with_dirs(&["/b"]));
        server.lock().unwrap().inject.push_back(reply(553));

        let err = transport.rename("/b/x", "/b/y").unwrap_err();

        assert!(matches!(err, BackupError::Protocol(_)));
        assert!(transport.session.is_some());
    }

    #[test]
    fn test_upload_tree_and_publish() -> std::io::Result<()> {
        let local = TempDir::new()?;
        std::fs::create_dir(local.path().join("sub"))?;
        std::fs::write(local.path().join("a.md"), b"alpha")?;
        std::fs::write(local.path().join("sub/b.md"), b"beta")?;
        let (mut transport, server) = scripted(ServerState::with_dirs(&["/backups"]));

        let stats = transport
            .upload_tree(local.path(), "/backups/.2024-03-01.partial", &CancellationToken::new())
            .unwrap();
        transport
            .rename("/backups/.2024-03-01.partial", "/backups/2024-03-01")
            .unwrap();
        transport.close().unwrap();

        assert_eq!(stats.files, 2);
        let server = server.lock().unwrap();
        assert_eq!(server.files.get("/backups/2024-03-01/sub/b.md").map(Vec::as_slice), Some(&b"beta"[..]));
        assert!(!server.dirs.contains("/backups/.2024-03-01.partial"));
        assert_eq!(server.commands.last().map(String::as_str), Some("QUIT"));
        Ok(())
    }
}
