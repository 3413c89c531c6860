use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error type used throughout the crate.
///
/// Each variant corresponds to one failure domain of the loading pipeline.
/// A failed load never leaves partial state behind: memory reserved for the
/// module is released and dependency references are dropped before the error
/// reaches the caller.
#[derive(Debug)]
pub enum Error {
    /// The buffer does not hold a well-formed ELF image.
    ///
    /// Bad magic, wrong class byte, unknown data encoding, a truncated
    /// header, or a segment whose `p_filesz` exceeds its `p_memsz`.
    InvalidImage {
        /// A descriptive message about the malformed image.
        msg: Cow<'static, str>,
    },

    /// The image is well-formed but asks for something this loader does not do.
    ///
    /// Unknown relocation type, missing hash table, a file type other than
    /// `ET_DYN`, or a machine incompatible with the host.
    Unsupported {
        /// A descriptive message about the unsupported construct.
        msg: Cow<'static, str>,
    },

    /// A `DT_NEEDED` entry named a module the resolver could not provide.
    DependencyNotFound {
        /// A descriptive message naming the missing dependency.
        msg: Cow<'static, str>,
    },

    /// A non-weak import was not exported by any dependency.
    SymbolNotFound {
        /// A descriptive message naming the unresolved symbol.
        msg: Cow<'static, str>,
    },

    /// An offset or RVA fell outside the underlying buffer.
    OutOfRange {
        /// A descriptive message about the out-of-range access.
        msg: Cow<'static, str>,
    },

    /// The host operating system refused a memory or library operation.
    Os {
        /// A descriptive message about the failed operation.
        msg: Cow<'static, str>,
        /// The OS-native error code (`errno` / `GetLastError`).
        code: i32,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidImage { msg } => write!(f, "invalid image: {msg}"),
            Error::Unsupported { msg } => write!(f, "unsupported: {msg}"),
            Error::DependencyNotFound { msg } => write!(f, "dependency not found: {msg}"),
            Error::SymbolNotFound { msg } => write!(f, "symbol not found: {msg}"),
            Error::OutOfRange { msg } => write!(f, "out of range: {msg}"),
            Error::Os { msg, code } => write!(f, "os error {code}: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn invalid_image(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidImage { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn unsupported(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Unsupported { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn dependency_not_found(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::DependencyNotFound { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn symbol_not_found(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::SymbolNotFound { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn out_of_range(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::OutOfRange { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn os_error(msg: impl Into<Cow<'static, str>>, code: i32) -> Error {
    Error::Os {
        msg: msg.into(),
        code,
    }
}

pub type Result<T> = core::result::Result<T, Error>;
