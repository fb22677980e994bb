//! Page-fault front end.
//!
//! The architecture fault handler describes the fault as a [`PageFault`] and
//! acts on the returned [`PageFaultResponse`]: resume the faulting thread,
//! kill it, or deliver an out-of-memory condition.

use crate::{VmError, VmObject};
use core::fmt;
use log::warn;

/// Kind of access that faulted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// A fault on one page of a memory object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    page_index: usize,
    access: Access,
}

impl PageFault {
    #[must_use]
    pub const fn new(page_index: usize, access: Access) -> Self {
        Self { page_index, access }
    }

    #[must_use]
    pub const fn read(page_index: usize) -> Self {
        Self::new(page_index, Access::Read)
    }

    #[must_use]
    pub const fn write(page_index: usize) -> Self {
        Self::new(page_index, Access::Write)
    }

    #[must_use]
    pub const fn page_index(&self) -> usize {
        self.page_index
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }
}

/// What the fault handler should do next.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageFaultResponse {
    /// The slot is populated; retry the access.
    Continue,
    /// The access can never succeed.
    ShouldCrash,
    /// No frame could be allocated.
    OutOfMemory,
}

impl PageFaultResponse {
    /// Map the outcome of a fault resolution.
    #[must_use]
    pub fn from_result<T>(result: &Result<T, VmError>) -> Self {
        match result {
            Ok(_) => Self::Continue,
            Err(VmError::OutOfMemory) => Self::OutOfMemory,
            Err(_) => Self::ShouldCrash,
        }
    }
}

impl fmt::Display for PageFaultResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continue => "continue",
            Self::ShouldCrash => "should crash",
            Self::OutOfMemory => "out of memory",
        })
    }
}

impl VmObject {
    /// Resolve a fault and translate the outcome for the fault handler.
    pub fn handle_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let result = self.map_page(fault.page_index(), fault.access() == Access::Write);
        let response = PageFaultResponse::from_result(&result);
        if let Err(e) = result {
            warn!(
                "{:?} fault on page {} of {} object: {e} ({response})",
                fault.access(),
                fault.page_index(),
                self.kind()
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InodeError;

    #[test]
    fn responses_follow_the_error_class() {
        assert_eq!(PageFaultResponse::from_result(&Ok::<(), VmError>(())), PageFaultResponse::Continue);
        assert_eq!(
            PageFaultResponse::from_result::<()>(&Err(VmError::OutOfMemory)),
            PageFaultResponse::OutOfMemory
        );
        assert_eq!(
            PageFaultResponse::from_result::<()>(&Err(VmError::Inode(InodeError::Io))),
            PageFaultResponse::ShouldCrash
        );
        assert_eq!(
            PageFaultResponse::from_result::<()>(&Err(VmError::InvalidRange {
                index: 9,
                page_count: 4
            })),
            PageFaultResponse::ShouldCrash
        );
    }

    #[test]
    fn fault_constructors() {
        assert_eq!(PageFault::write(3).access(), Access::Write);
        assert_eq!(PageFault::read(3), PageFault::new(3, Access::Read));
        assert_eq!(PageFault::read(7).page_index(), 7);
    }
}
