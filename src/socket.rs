//! Unix-socket output for UI processes.
//!
//! Each connected client receives one JSON [`WireEvent`] per line. Clients come
//! and go freely; a client whose write fails or stalls is dropped.

use crate::event::{ClassifiedEvent, WireEvent};
use crate::eventbus::{Disconnected, Subscriber};
use std::fs;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const WRITE_TIMEOUT: Duration = Duration::from_millis(50);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

type Clients = Arc<Mutex<Vec<UnixStream>>>;

/// Accepts clients on a Unix socket in a background thread.
pub struct SocketServer {
    path: PathBuf,
    clients: Clients,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SocketServer {
    /// Bind `path`, replacing a stale socket file left by an earlier run.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let clients: Clients = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new().name("keyrelay-socket".into()).spawn({
            let clients = Arc::clone(&clients);
            let stop = Arc::clone(&stop);
            move || accept_loop(listener, clients, stop)
        })?;
        info!(path = %path.display(), "event socket listening");

        Ok(Self {
            path,
            clients,
            stop,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// A bus subscriber writing to this server's clients. `ts_ms` counts from `epoch`.
    pub fn subscriber(&self, epoch: Instant) -> SocketSubscriber {
        SocketSubscriber {
            clients: Arc::clone(&self.clients),
            stop: Arc::clone(&self.stop),
            epoch,
        }
    }

    /// Stop accepting, disconnect every client and remove the socket file.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: UnixListener, clients: Clients, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
                    warn!(error = %e, "rejecting socket client");
                    continue;
                }
                let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
                clients.push(stream);
                debug!(clients = clients.len(), "socket client connected");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Writes events to every client of a [`SocketServer`].
///
/// Disconnects from the bus once the server shuts down.
pub struct SocketSubscriber {
    clients: Clients,
    stop: Arc<AtomicBool>,
    epoch: Instant,
}

impl SocketSubscriber {
    fn encode(&self, event: &ClassifiedEvent) -> Option<Vec<u8>> {
        let wire: WireEvent = event.to_wire(self.epoch);
        match serde_json::to_vec(&wire) {
            Ok(mut line) => {
                line.push(b'\n');
                Some(line)
            }
            Err(e) => {
                warn!(error = %e, "failed to encode event");
                None
            }
        }
    }
}

impl Subscriber for SocketSubscriber {
    fn deliver(&mut self, event: &ClassifiedEvent) -> Result<(), Disconnected> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(Disconnected);
        }
        let Some(line) = self.encode(event) else {
            return Ok(());
        };
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain_mut(|client| match client.write_all(&line) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "dropping socket client");
                false
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActionKind, SourceKind};
    use crate::key::LogicalKey;
    use std::io::{BufRead, BufReader};

    fn wait_for_clients(server: &SocketServer, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() < n {
            assert!(Instant::now() < deadline, "client never accepted");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn streams_json_lines_and_drops_gone_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("events.sock");
        let mut server = SocketServer::bind(&path).unwrap();

        let reader = UnixStream::connect(&path).unwrap();
        let gone = UnixStream::connect(&path).unwrap();
        wait_for_clients(&server, 2);
        drop(gone);

        let epoch = Instant::now();
        let mut subscriber = server.subscriber(epoch);
        let event = ClassifiedEvent {
            key: LogicalKey::new("KEY_UP").unwrap(),
            action: ActionKind::ShortRelease,
            at: epoch + Duration::from_millis(1234),
            source: SourceKind::Ir,
        };
        // The first write to a closed peer may still succeed; the second fails.
        subscriber.deliver(&event).unwrap();
        subscriber.deliver(&event).unwrap();
        assert_eq!(server.client_count(), 1);

        let mut lines = BufReader::new(reader).lines();
        let line = lines.next().unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<WireEvent>(&line).unwrap(),
            WireEvent {
                key: LogicalKey::new("KEY_UP").unwrap(),
                action: ActionKind::ShortRelease,
                source: SourceKind::Ir,
                ts_ms: 1234,
            }
        );

        server.shutdown();
        assert!(!path.exists());
        assert_eq!(subscriber.deliver(&event), Err(Disconnected));
    }

    #[test]
    fn replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sock");
        fs::write(&path, b"").unwrap();
        let server = SocketServer::bind(&path).unwrap();
        assert!(UnixStream::connect(server.path()).is_ok());
    }
}
