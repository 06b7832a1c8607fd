//! Core error kinds and the `Fubar` poisoning helper.

use core::fmt;

/// A negated-status-code error kind, as seen at the ABI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Out-of-range or otherwise malformed argument.
    Inval,
    /// The underlying block device reported a failure.
    Io,
    /// The volume's buffer pool or lock could not be acquired.
    Busy,
    /// Both imap scans failed to find a free block.
    NoSpace,
    /// No directory entry with that name.
    NoEntry,
    /// A directory entry with that name already exists.
    Exists,
    /// Expected a directory, found something else.
    NotDir,
    /// Expected a non-directory, found a directory.
    IsDir,
    /// Name exceeds the volume's configured maximum length.
    NameTooLong,
    /// Invalid or stale inode/file handle.
    BadF,
    /// Directory is not empty.
    NotEmpty,
    /// Offset or length is out of the representable range.
    Range,
    /// No free inode slot remains.
    TooManyFiles,
    /// Write would exceed the maximum logical file size.
    FileTooBig,
    /// Mutation attempted on a read-only mount.
    ReadOnly,
    /// Operation is not implemented by this build.
    NoSys,
    /// Operation is not supported by the underlying device.
    NotSupp,
    /// Allocation failure in the host allocator.
    NoMem,
    /// Operation would cross volumes.
    XDev,
    /// Permission denied by uid/gid/mode checks.
    Access,
    /// Hard link would create a cycle or cross directory boundaries.
    NoLink,
    /// Caller lacks the privilege required for the operation.
    Perm,
    /// Internal invariant violation. Sticky for the lifetime of the mount.
    Fubar,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result alias used throughout the core.
pub type Result<T> = core::result::Result<T, Error>;

/// Raise a `Fubar`: an invariant the core assumes can never be false was
/// false. Logs a critical-error site and returns the error; the caller is
/// responsible for propagating it so the volume gets marked read-only.
#[macro_export]
macro_rules! fubar {
    ($($arg:tt)*) => {{
        $crate::error!("fubar", $($arg)*);
        $crate::error::Error::Fubar
    }};
}
