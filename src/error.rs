//! Kernel error codes.
//!
//! Every fallible path returns `Result<T>`; the syscall layer turns the
//! error into a negated errno in the task's return register.

/// Numeric error kinds, with their Unix errno values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Operation not permitted.
    PermissionDenied,
    /// No such file or directory.
    NoEntry,
    /// No such process.
    NoProcess,
    /// Interrupted system call.
    Interrupted,
    /// I/O error.
    Io,
    /// No such device or address.
    NoDevice,
    /// Bad file descriptor.
    BadFd,
    /// No child processes.
    NoChild,
    /// Operation would block.
    WouldBlock,
    /// Out of memory.
    NoMemory,
    /// Permission denied on a file.
    Access,
    /// File exists.
    Exists,
    /// Cross-device link.
    CrossDevice,
    /// Not a directory.
    NotDir,
    /// Is a directory.
    IsDir,
    /// Invalid argument.
    InvalidArg,
    /// Bad user-space address.
    BadAddress,
    /// Too many open files in system.
    FileTableFull,
    /// Too many open files per task.
    TooManyOpen,
    /// Not a typewriter.
    NotTty,
    /// File too large.
    FileTooBig,
    /// No space left on device.
    NoSpace,
    /// Seek on a pipe.
    IllegalSeek,
    /// Broken pipe.
    BrokenPipe,
    /// Result out of range.
    Range,
    /// Resource deadlock would occur.
    Deadlock,
    /// File name too long.
    NameTooLong,
    /// Not implemented / not supported by this driver.
    NotSupported,
    /// Directory not empty.
    NotEmpty,
    /// Too many levels of symbolic links.
    Loop,
    /// Not a socket or unknown ioctl.
    NotSocket,
}

impl KernelError {
    /// The errno value reported to userspace.
    pub fn errno(self) -> i32 {
        match self {
            KernelError::PermissionDenied => 1,
            KernelError::NoEntry => 2,
            KernelError::NoProcess => 3,
            KernelError::Interrupted => 4,
            KernelError::Io => 5,
            KernelError::NoDevice => 6,
            KernelError::BadFd => 9,
            KernelError::NoChild => 10,
            KernelError::WouldBlock => 11,
            KernelError::NoMemory => 12,
            KernelError::Access => 13,
            KernelError::Exists => 17,
            KernelError::CrossDevice => 18,
            KernelError::NotDir => 20,
            KernelError::IsDir => 21,
            KernelError::BadAddress => 14,
            KernelError::InvalidArg => 22,
            KernelError::FileTableFull => 23,
            KernelError::TooManyOpen => 24,
            KernelError::NotTty => 25,
            KernelError::FileTooBig => 27,
            KernelError::NoSpace => 28,
            KernelError::IllegalSeek => 29,
            KernelError::BrokenPipe => 32,
            KernelError::Range => 34,
            KernelError::Deadlock => 35,
            KernelError::NameTooLong => 36,
            KernelError::NotSupported => 38,
            KernelError::NotEmpty => 39,
            KernelError::Loop => 40,
            KernelError::NotSocket => 88,
        }
    }

    /// Syscall return convention: errors are returned negated.
    pub fn to_ret(self) -> i32 {
        -self.errno()
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_unix() {
        assert_eq!(KernelError::NoEntry.errno(), 2);
        assert_eq!(KernelError::Interrupted.errno(), 4);
        assert_eq!(KernelError::BadFd.errno(), 9);
        assert_eq!(KernelError::WouldBlock.errno(), 11);
        assert_eq!(KernelError::InvalidArg.errno(), 22);
        assert_eq!(KernelError::BrokenPipe.errno(), 32);
        assert_eq!(KernelError::Loop.errno(), 40);
    }

    #[test]
    fn syscall_returns_are_negative() {
        assert_eq!(KernelError::NoEntry.to_ret(), -2);
        assert_eq!(KernelError::NotSupported.to_ret(), -38);
    }
}
