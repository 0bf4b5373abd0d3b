//! Thin `mio::event::Source` wrapper around a tap device file descriptor.
//! Opening the tap device itself (the `TUNSETIFF` dance) is an external
//! collaborator (§1); this crate only reads and writes raw Ethernet frames
//! on an fd it is handed.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

pub const MAX_FRAME_LEN: usize = 1550;

pub struct TapDevice {
    fd: RawFd,
}

impl TapDevice {
    /// Wrap an already-open, already-configured tap fd. The caller owns the
    /// fd's lifetime; `TapDevice` does not close it on drop since ownership
    /// of tap teardown belongs to the external launcher that created it.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        TapDevice { fd }
    }

    /// The underlying fd, needed by the netinit child's pre-exec hook (§9
    /// "Fork + event-loop inheritance") so it can be closed before `execve`.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read up to one Ethernet frame (§4.5: up to 1550 bytes including any
    /// tag). `Ok(None)` means `EAGAIN` — the caller just returns.
    pub fn read_frame(&self, buf: &mut [u8; MAX_FRAME_LEN]) -> io::Result<Option<usize>> {
        let mut file = self.borrowed_file();
        match file.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut file = self.borrowed_file();
        file.write_all(frame)
    }

    fn borrowed_file(&self) -> std::mem::ManuallyDrop<std::fs::File> {
        use std::os::unix::io::FromRawFd;
        std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(self.fd) })
    }
}

impl Source for TapDevice {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.fd).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd).deregister(registry)
    }
}
