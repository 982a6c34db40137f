//! Error handling
//!
//! Every external library the harness drives reports failure through a return code. Those codes
//! are lifted into [`Error::Library`], tagged with the [`Subsystem`] that produced them and the
//! source location of the checked call, so a failing run points at the exact step that broke.
//!
//! The subsystem also decides how far a failure reaches: see [`Error::termination`].

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type used throughout the harness
pub type Result<T> = std::result::Result<T, Error>;

/// The external runtime an error originated from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Subsystem {
    /// The process group (MPI)
    Group,
    /// The accelerator runtime (CUDA)
    Device,
    /// The collective communication library (NCCL)
    Collective,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Subsystem::Group => "MPI",
            Subsystem::Device => "CUDA",
            Subsystem::Collective => "NCCL",
        })
    }
}

/// How a process ends once its run is over.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Termination {
    /// Exit this process with the given status, peers are not involved.
    Exit(u8),
    /// Abort every process in the group with the given code.
    AbortGroup(i32),
}

/// Errors produced by the verification harness
#[derive(Debug, Error)]
pub enum Error {
    /// The launcher environment could not be turned into a configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An external library reported a failure.
    #[error("{subsystem} error: {message} (code {code})\nError at {location}")]
    Library {
        /// Library that failed
        subsystem: Subsystem,
        /// Raw return code
        code: i32,
        /// Human readable description
        message: String,
        /// Call site of the failed check
        location: &'static Location<'static>,
    },

    /// The collective reported an asynchronous error after the reduction was issued.
    #[error("NCCL asynchronous error (code {code}) after all-reduce was issued")]
    AsyncFault {
        /// Raw asynchronous error code
        code: i32,
    },

    /// The output buffer came back from the device empty.
    #[error("reduction output buffer was empty after copy to host")]
    MissingResult,
}

impl Error {
    /// Build a library error, recording the caller as the failure location.
    #[track_caller]
    pub fn library(subsystem: Subsystem, code: i32, message: impl Into<String>) -> Self {
        Error::Library {
            subsystem,
            code,
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// The subsystem an error belongs to, if it came from an external library.
    pub fn subsystem(&self) -> Option<Subsystem> {
        match *self {
            Error::Library { subsystem, .. } => Some(subsystem),
            Error::AsyncFault { .. } => Some(Subsystem::Collective),
            Error::Config(_) | Error::MissingResult => None,
        }
    }

    /// How a process that hit this error after joining the group must terminate.
    ///
    /// Group and collective failures take every peer down with them, a peer left waiting inside
    /// a collective would otherwise hang. Device failures end only the local process.
    pub fn termination(&self) -> Termination {
        match *self {
            Error::Config(_) => Termination::Exit(2),
            Error::Library {
                subsystem: Subsystem::Device,
                ..
            }
            | Error::MissingResult => Termination::Exit(1),
            Error::Library { code, .. } | Error::AsyncFault { code } => {
                Termination::AbortGroup(if code == 0 { 1 } else { code })
            }
        }
    }
}

/// A failure value returned by an external library.
pub trait ReturnCode: fmt::Debug {
    /// Library the code belongs to
    const SUBSYSTEM: Subsystem;

    /// The raw numeric code
    fn code(&self) -> i32;

    /// A description of the failure
    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

/// Turns a library result into a harness [`Result`].
///
/// The location of the `check()` call becomes the reported failure location.
pub trait Check<T> {
    /// Lift a library failure into [`Error::Library`].
    fn check(self) -> Result<T>;
}

impl<T, E: ReturnCode> Check<T> for std::result::Result<T, E> {
    #[track_caller]
    fn check(self) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(Error::library(E::SUBSYSTEM, err.code(), err.describe())),
        }
    }
}
