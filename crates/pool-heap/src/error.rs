//! Error types of the pool heap.
//!
//! Every variant records the [`Location`] of the call that produced it, so a
//! failure surfaced far away from its origin (for example at the boot halt
//! path) still points at the offending call site.

use core::{error::Error, fmt};

use snafu::{GenerateImplicitData, Snafu};

/// Source location captured when an error is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The pool layout cannot describe a usable heap.
///
/// This is a build-time mistake in the layout table; the boot sequence is
/// expected to halt when it sees one.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("pool layout has no size classes"))]
    NoPools {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pool {pool} has no blocks"))]
    EmptyPool {
        pool: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "pool {pool} block size {block_size} cannot hold a {word}-byte free-list link"
    ))]
    BlockTooSmall {
        pool: usize,
        block_size: usize,
        word: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "pool {pool} block size {block_size} is not larger than the previous size {previous}"
    ))]
    UnorderedClasses {
        pool: usize,
        block_size: usize,
        previous: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pools cover {computed} bytes but the heap is declared as {declared} bytes"))]
    SizeMismatch {
        computed: usize,
        declared: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap region does not fit in the address space"))]
    RegionOverflow {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free bitmap tracks {capacity} blocks but the layout has {blocks}"))]
    BitmapTooSmall {
        capacity: usize,
        blocks: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// An allocation request could not be served.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("cannot serve {size} bytes, size classes cover 1..={max} bytes"))]
    InvalidArgument {
        size: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("alignment {align} is not a power of two"))]
    InvalidAlignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free block of at least {size} bytes"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A pointer could not be resolved to a block of the heap.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClassifyError {
    #[snafu(display("address {addr:#x} is outside the heap"))]
    OutOfRange {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address {addr:#x} is not the start of a block in pool {pool}"))]
    Misaligned {
        addr: usize,
        pool: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A block could not be returned to the heap.
///
/// Releasing a null or out-of-range pointer is not an error; see
/// [`PoolHeap::release`](crate::PoolHeap::release).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReleaseError {
    #[snafu(display("block {addr:#x} is already free"))]
    DoubleFree {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("cannot release {addr:#x}"))]
    InvalidPointer {
        addr: usize,
        source: ClassifyError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ConfigError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::NoPools { location }
            | Self::EmptyPool { location, .. }
            | Self::BlockTooSmall { location, .. }
            | Self::UnorderedClasses { location, .. }
            | Self::SizeMismatch { location, .. }
            | Self::RegionOverflow { location }
            | Self::BitmapTooSmall { location, .. } => *location,
        }
    }
}

impl AllocError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::InvalidArgument { location, .. }
            | Self::InvalidAlignment { location, .. }
            | Self::OutOfMemory { location, .. } => *location,
        }
    }
}

impl ClassifyError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::OutOfRange { location, .. } | Self::Misaligned { location, .. } => *location,
        }
    }
}

impl ReleaseError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::DoubleFree { location, .. } | Self::InvalidPointer { location, .. } => {
                *location
            }
        }
    }
}

fn location_of(err: &(dyn Error + 'static)) -> Option<Location> {
    if let Some(e) = err.downcast_ref::<ConfigError>() {
        return Some(e.location());
    }
    if let Some(e) = err.downcast_ref::<AllocError>() {
        return Some(e.location());
    }
    if let Some(e) = err.downcast_ref::<ClassifyError>() {
        return Some(e.location());
    }
    err.downcast_ref::<ReleaseError>().map(ReleaseError::location)
}

/// Renders an error, its location and its chain of sources.
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        if let Some(loc) = location_of(&self.error) {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            if let Some(loc) = location_of(s) {
                writeln!(f, "      at {loc}")?;
            }
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

/// Halts with a report of `err`.
#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: Error + 'static,
{
    let report = Report::new(err);
    panic!("Critical heap error occurred\n\n{report}");
}
