//! Unix-socket control server.
//!
//! Speaks the line protocol from [`crate::app::commands`].  Each line gets
//! one reply: `ok` or `err <reason>`.  Readings are pushed straight into
//! the [`ReadingCache`]; everything else is queued on the runtime's
//! [`ControlHandle`].
//!
//! ```text
//!  client ──line──▶ ControlServer thread ──┬─▶ ReadingCache::push
//!                                          └─▶ ControlHandle::send ──▶ Runtime
//! ```

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;

use log::{debug, info, warn};

use crate::app::commands::ControlLine;
use crate::app::ports::Clock;
use crate::cache::ReadingCache;
use crate::runtime::ControlHandle;

pub struct ControlServer<K: Clock> {
    path: PathBuf,
    listener: UnixListener,
    cache: ReadingCache,
    handle: ControlHandle,
    clock: K,
}

impl<K> ControlServer<K>
where
    K: Clock + Clone + Send + 'static,
{
    /// Bind `path`, replacing a stale socket file.
    pub fn bind(
        path: &Path,
        cache: ReadingCache,
        handle: ControlHandle,
        clock: K,
    ) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("Control: listening on {}", path.display());
        Ok(Self {
            path: path.to_owned(),
            listener,
            cache,
            handle,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve connections on a background thread, one thread per client.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("growctl-control".into())
            .spawn(move || self.serve())
    }

    fn serve(self) {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let cache = self.cache.clone();
                    let handle = self.handle.clone();
                    let clock = self.clock.clone();
                    let spawned = thread::Builder::new()
                        .name("growctl-client".into())
                        .spawn(move || serve_client(stream, &cache, &handle, &clock));
                    if let Err(e) = spawned {
                        warn!("Control: client thread failed: {}", e);
                    }
                }
                Err(e) => warn!("Control: accept failed: {}", e),
            }
        }
    }
}

fn serve_client<K: Clock>(stream: UnixStream, cache: &ReadingCache, handle: &ControlHandle, clock: &K) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!("Control: {}", e);
            return;
        }
    };
    for line in BufReader::new(stream).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&line, cache, handle, clock);
        if writeln!(writer, "{}", reply).is_err() {
            break;
        }
    }
    debug!("Control: client disconnected");
}

/// Apply one protocol line and return the reply.
pub fn handle_line<K: Clock>(
    line: &str,
    cache: &ReadingCache,
    handle: &ControlHandle,
    clock: &K,
) -> String {
    match line.parse::<ControlLine>() {
        Ok(ControlLine::Reading {
            zone,
            variable,
            value,
        }) => {
            cache.push(zone, variable, value, clock.now_ms());
            "ok".into()
        }
        Ok(ControlLine::Command(cmd)) => match handle.send(cmd) {
            Ok(()) => "ok".into(),
            Err(_) => "err busy".into(),
        },
        Err(e) => format!("err {}", e),
    }
}
