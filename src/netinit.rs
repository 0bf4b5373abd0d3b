//! The netinit pipeline (§4.4): after authentication, an optional external
//! helper decides whether to admit the client and may hand back a small
//! opaque blob echoed to the client inside the `NETINIT` reply.

use std::ffi::OsStr;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use bytes::BytesMut;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{close, pipe};

use crate::error::NetinitError;

pub const NETINIT_BUFLEN: usize = 4096;

/// Live state for a connection's in-flight netinit helper run (§3: "at most
/// one child watcher and one pipe reader exist for that connection").
pub struct NetinitState {
    pub buffer: BytesMut,
    pub pipe_read_fd: RawFd,
    pub child: Child,
}

impl NetinitState {
    /// Spawn the helper: unidirectional pipe, non-blocking read end, child
    /// redirects stdout to the pipe's write end and execs the helper with
    /// `(basename, principal, peer_ip, peer_port)` (§4.4, §6). `udp_fd` and
    /// `tap_fd` are the parent event loop's own descriptors; the child closes
    /// them, along with its inherited copy of the pipe read end, before
    /// `execve` (§9 "Fork + event-loop inheritance"; `gssvpnd.c`'s
    /// `close(netfd); close(tapfd); close(fds[0]);`).
    pub fn spawn(
        helper_path: &Path,
        principal_name: &str,
        peer_ip: &str,
        peer_port: u16,
        udp_fd: RawFd,
        tap_fd: RawFd,
    ) -> Result<NetinitState, NetinitError> {
        let (read_fd, write_fd) = pipe().map_err(|e| {
            NetinitError::Pipe(std::io::Error::from_raw_os_error(e as i32))
        })?;
        set_nonblocking(read_fd)?;

        let basename: &OsStr = helper_path
            .file_name()
            .unwrap_or_else(|| helper_path.as_os_str());

        let write_stdio = duplicate_as_stdio(write_fd)?;
        // The child's copy of the write end is duplicated into stdio above;
        // the parent's original descriptors are closed once spawn returns so
        // only the child's stdout keeps the pipe alive.
        let spawn_result = unsafe {
            Command::new(helper_path)
                .arg0(basename)
                .arg(principal_name)
                .arg(peer_ip)
                .arg(peer_port.to_string())
                .stdin(Stdio::null())
                .stdout(write_stdio)
                .stderr(Stdio::null())
                .pre_exec(move || {
                    let _ = close(read_fd);
                    let _ = close(udp_fd);
                    let _ = close(tap_fd);
                    Ok(())
                })
                .spawn()
        };

        let _ = close(write_fd);

        let child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                let _ = close(read_fd);
                return Err(NetinitError::Spawn(e));
            }
        };

        Ok(NetinitState {
            buffer: BytesMut::with_capacity(NETINIT_BUFLEN),
            pipe_read_fd: read_fd,
            child,
        })
    }

    /// Append whatever is available on the pipe, stopping once the buffer is
    /// full (§4.4 step 4). Returns `true` if the buffer is now full, so the
    /// caller can drop this connection's read interest from the event loop.
    pub fn read_available(&mut self) -> bool {
        use std::io::Read;
        let mut file = unsafe { file_from_raw_fd_borrowed(self.pipe_read_fd) };
        loop {
            if self.buffer.len() >= NETINIT_BUFLEN {
                return true;
            }
            let remaining = NETINIT_BUFLEN - self.buffer.len();
            let mut chunk = vec![0u8; remaining];
            match file.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(_) => return false,
            }
        }
    }
}

impl Drop for NetinitState {
    fn drop(&mut self) {
        let _ = close(self.pipe_read_fd);
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), NetinitError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| NetinitError::Pipe(std::io::Error::from_raw_os_error(e as i32)))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| NetinitError::Pipe(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}

fn duplicate_as_stdio(fd: RawFd) -> Result<Stdio, NetinitError> {
    use std::os::unix::io::FromRawFd;
    let dup = nix::unistd::dup(fd)
        .map_err(|e| NetinitError::Pipe(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(unsafe { Stdio::from_raw_fd(dup) })
}

/// Borrow a raw fd as a `File` for reading without taking ownership; the
/// real fd lifecycle is managed by `NetinitState`'s own `Drop`.
unsafe fn file_from_raw_fd_borrowed(fd: RawFd) -> std::mem::ManuallyDrop<std::fs::File> {
    use std::os::unix::io::FromRawFd;
    std::mem::ManuallyDrop::new(std::fs::File::from_raw_fd(fd))
}
