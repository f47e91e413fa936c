//! Host-process integration: fork/exec/pipe/redirect/wait.
//!
//! This module provides safe wrappers over the raw libc calls the
//! interpreter's process opcodes need, plus the LIFO table of scoped fd
//! redirections. Failures surface as `io::Error` built from errno; the
//! interpreter decides which of them are fatal and exits with the
//! sysexits-mirroring codes below, matching what a shell user expects
//! from a failed pipeline rather than a VM diagnostic.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

/// Exit code for fork/dup2/pipe failures (sysexits EX_OSERR).
pub const EX_OSERR: i32 = 71;
/// Exit code for open/read/write failures (sysexits EX_IOERR).
pub const EX_IOERR: i32 = 74;
/// Exit code of a child whose exec target could not be run.
pub const COMMAND_NOT_RUNNABLE: i32 = 126;
/// Exit code of a unit that terminated through an uncaught panic.
pub const PANIC: i32 = 255;

/// Prints a syscall diagnostic and terminates the process.
pub fn fatal(syscall: &str, err: io::Error, code: i32) -> ! {
    eprintln!("{}: {}", syscall, err);
    std::process::exit(code)
}

/// Outcome of a successful `fork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    Child,
    Parent { child: libc::pid_t },
}

pub fn fork() -> io::Result<ForkResult> {
    // SAFETY: fork has no memory-safety preconditions; the single-threaded
    // interpreter never holds locks across it.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(ForkResult::Child),
        child => Ok(ForkResult::Parent { child }),
    }
}

/// Replaces the process image with `argv[0]`, resolved through PATH.
/// Only returns on failure.
pub fn exec(argv: &[String]) -> io::Error {
    let args: Vec<CString> = match argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<_, _>>()
    {
        Ok(args) => args,
        Err(_) => return io::Error::new(io::ErrorKind::InvalidInput, "argument contains NUL"),
    };
    let mut ptrs: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
    ptrs.push(std::ptr::null());

    // SAFETY: ptrs is a NUL-terminated array of valid C strings that
    // outlive the call; execvp only returns on failure.
    unsafe { libc::execvp(ptrs[0], ptrs.as_ptr()) };
    io::Error::last_os_error()
}

/// Waits for `pid` and returns its exit status byte.
pub fn wait_pid(pid: libc::pid_t) -> io::Result<u8> {
    let mut status: libc::c_int = 0;
    // SAFETY: status is a valid out-pointer for the duration of the call.
    if unsafe { libc::waitpid(pid, &mut status, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((libc::WEXITSTATUS(status) & 0xFF) as u8)
}

/// Opens `path` with the given flags and user read/write permission.
pub fn open(path: &str, flags: i32) -> io::Result<RawFd> {
    let path = CString::new(path.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    // SAFETY: path is a valid C string for the duration of the call.
    let fd = unsafe { libc::open(path.as_ptr(), flags, 0o600 as libc::c_uint) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn close(fd: RawFd) {
    // SAFETY: closing an arbitrary fd is sound; a bad descriptor only
    // yields EBADF, which the bytecode contract ignores.
    unsafe { libc::close(fd) };
}

pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: no pointer arguments.
    let duplicated = unsafe { libc::dup(fd) };
    if duplicated == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(duplicated)
}

pub fn dup2(from: RawFd, to: RawFd) -> io::Result<()> {
    // SAFETY: no pointer arguments.
    if unsafe { libc::dup2(from, to) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Creates a pipe and returns `(read_fd, write_fd)`.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: fds is a valid 2-element out-array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Drains `fd` to EOF, retrying on EINTR/EAGAIN.
pub fn read_to_end(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        // SAFETY: buffer is a valid writable region of the given length.
        let n = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        match n {
            -1 => {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    _ => return Err(err),
                }
            }
            0 => return Ok(out),
            n => out.extend_from_slice(&buffer[..n as usize]),
        }
    }
}

/// Writes all of `bytes` to `fd`, retrying short writes and EINTR.
pub fn write_all(fd: RawFd, bytes: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        let remaining = &bytes[written..];
        // SAFETY: remaining is a valid readable region of the given length.
        let n = unsafe { libc::write(fd, remaining.as_ptr().cast(), remaining.len()) };
        if n == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        } else {
            written += n as usize;
        }
    }
    Ok(())
}

/// Raw contents of `/proc/self/cmdline` (NUL-separated argument list).
///
/// The single procfs read lives here so a non-procfs platform only has
/// one function to replace.
pub fn cmdline_bytes() -> io::Result<Vec<u8>> {
    std::fs::read("/proc/self/cmdline")
}

// =============================================================================
// FdTable - scoped redirections
// =============================================================================

/// One recorded redirection: `target_fd` can be restored from `back_fd`.
#[derive(Debug)]
struct Redirection {
    back_fd: RawFd,
    target_fd: RawFd,
}

/// LIFO of saved file-descriptor duplications for scoped redirection.
///
/// `push_redirection` captures the current meaning of `to_fd` with `dup`
/// before overwriting it, so a matching `pop_redirection` restores the
/// process fd table to its prior state.
#[derive(Debug, Default)]
pub struct FdTable {
    active: Vec<Redirection>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirects `to_fd` to refer to `from_fd`'s file, recording how to
    /// undo it.
    pub fn push_redirection(&mut self, from_fd: RawFd, to_fd: RawFd) -> io::Result<()> {
        let back_fd = dup(to_fd)?;
        if let Err(err) = dup2(from_fd, to_fd) {
            close(back_fd);
            return Err(err);
        }
        self.active.push(Redirection {
            back_fd,
            target_fd: to_fd,
        });
        Ok(())
    }

    /// Restores the most recent redirection. A pop without a matching
    /// push is a no-op.
    pub fn pop_redirection(&mut self) {
        if let Some(redirection) = self.active.pop() {
            if let Err(err) = dup2(redirection.back_fd, redirection.target_fd) {
                eprintln!("dup2: {}", err);
            }
            close(redirection.back_fd);
        }
    }

    pub fn depth(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_write_read_round_trip() {
        let (read_fd, write_fd) = pipe().unwrap();
        write_all(write_fd, b"hello pipe").unwrap();
        close(write_fd);
        let data = read_to_end(read_fd).unwrap();
        close(read_fd);
        assert_eq!(data, b"hello pipe");
    }

    #[test]
    fn test_redirection_push_and_pop_restores_target() {
        let (r1, w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();

        let mut table = FdTable::new();
        table.push_redirection(w2, w1).unwrap();
        assert_eq!(table.depth(), 1);

        // While redirected, writes to w1 land in the second pipe.
        write_all(w1, b"x").unwrap();
        table.pop_redirection();
        assert_eq!(table.depth(), 0);

        close(w2);
        assert_eq!(read_to_end(r2).unwrap(), b"x");
        close(r2);

        // After the pop, w1 reaches the first pipe again.
        write_all(w1, b"y").unwrap();
        close(w1);
        assert_eq!(read_to_end(r1).unwrap(), b"y");
        close(r1);
    }

    #[test]
    fn test_wait_reports_child_exit_status() {
        match fork().unwrap() {
            ForkResult::Child => std::process::exit(7),
            ForkResult::Parent { child } => {
                assert_eq!(wait_pid(child).unwrap(), 7);
            }
        }
    }

    #[test]
    fn test_open_missing_file_fails() {
        let err = open("/nonexistent/conch-test-path", libc::O_RDONLY).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
