//! Local control surface (§6 "CLI/control surface"): a Unix domain
//! socket accepting single-line `reload` / `reopen` / `stop` /
//! `stats-dump` / `verify-config` commands, registered as an
//! [`FdSource`] on the pipeline's own main loop so handling a command
//! costs nothing beyond the reactor's normal poll cycle.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use nix::poll::PollFlags;

use logflow_runtime::FdSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Reload,
    Reopen,
    Stop,
    StatsDump,
    VerifyConfig,
}

/// What runs a command and produces the text written back to the
/// client. Implemented by `Pipeline`.
pub trait ControlHandler: Send + Sync {
    fn handle(&self, command: ControlCommand) -> String;
}

pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<dyn ControlHandler>,
}

impl ControlSocket {
    pub fn bind(path: impl Into<PathBuf>, handler: Arc<dyn ControlHandler>) -> std::io::Result<Self> {
        let path = path.into();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, path, handler })
    }

    fn serve(&self, stream: UnixStream) {
        let mut reader = match stream.try_clone() {
            Ok(s) => BufReader::new(s),
            Err(_) => return,
        };
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let mut stream = stream;
        match parse_command(line.trim()) {
            Some(command) => {
                let response = self.handler.handle(command);
                let _ = writeln!(stream, "{response}");
            }
            None => {
                let _ = writeln!(stream, "ERR unknown command {:?}", line.trim());
            }
        }
    }
}

fn parse_command(line: &str) -> Option<ControlCommand> {
    match line {
        "reload" => Some(ControlCommand::Reload),
        "reopen" => Some(ControlCommand::Reopen),
        "stop" => Some(ControlCommand::Stop),
        "stats-dump" => Some(ControlCommand::StatsDump),
        "verify-config" => Some(ControlCommand::VerifyConfig),
        _ => None,
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FdSource for ControlSocket {
    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn interest(&self) -> PollFlags {
        PollFlags::POLLIN
    }

    fn on_ready(&self, _revents: PollFlags) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.serve(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}
