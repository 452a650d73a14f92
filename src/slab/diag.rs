use std::fmt;

/// Severity of a diagnostic report.
///
/// `Alert` marks caller protocol violations (bad free pointers, double
/// frees); `Crit` marks pool exhaustion. An embedding sink can route the two
/// straight to the matching levels of its own logger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Alert,
    Crit,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Alert => write!(f, "alert"),
            Severity::Crit => write!(f, "crit"),
        }
    }
}

/// Callback invoked on protocol violations and exhaustion.
///
/// The sink and its formatting are the embedder's concern; the pool only
/// supplies a severity and a short message. Installed per handle via
/// [`SlabPool::set_diagnostic_sink`](crate::SlabPool::set_diagnostic_sink),
/// never stored in the shared region (function pointers are meaningless in
/// another process).
pub type DiagnosticSink = Box<dyn Fn(Severity, &str) + Send + Sync>;

/// Errors returned by pool construction and allocation operations.
///
/// Every failure is local: the pool returns an error value and leaves shared
/// state untouched. Nothing is ever thrown across the shared-region
/// boundary.
#[derive(Debug)]
pub enum SlabError {
    /// No free page run long enough for the request. Covers both class
    /// allocations and oversized page-run requests.
    NoMemory { requested: usize },
    /// Freed pointer lies outside the arena.
    OutOfRange { ptr: usize },
    /// Freed pointer is not aligned to its chunk's class size.
    Misaligned { ptr: usize, chunk_size: usize },
    /// The chunk (or page run) addressed by the pointer is already free.
    DoubleFree { ptr: usize },
    /// Freed pointer addresses the interior of a multi-page run.
    WrongPage { ptr: usize },
    /// Freed pointer addresses a chunk permanently reserved for the page's
    /// own occupancy bitmap.
    Reserved { ptr: usize },
    /// Pool geometry is unusable (sizes not powers of two, too few classes).
    BadGeometry(String),
    /// The region cannot hold the pool tables plus at least one page.
    RegionTooSmall { len: usize, needed: usize },
    /// `attach` on a region whose ready marker was never written.
    NotInitialized,
    /// `attach` with a region length that disagrees with the header.
    SizeMismatch { header: usize, region: usize },
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlabError::NoMemory { requested } => {
                write!(f, "slab alloc of {requested} bytes failed: no memory")
            }
            SlabError::OutOfRange { ptr } => {
                write!(f, "slab free: pointer {ptr:#x} outside of pool")
            }
            SlabError::Misaligned { ptr, chunk_size } => write!(
                f,
                "slab free: pointer {ptr:#x} not aligned to {chunk_size}-byte chunk"
            ),
            SlabError::DoubleFree { ptr } => {
                write!(f, "slab free: chunk at {ptr:#x} is already free")
            }
            SlabError::WrongPage { ptr } => {
                write!(f, "slab free: pointer {ptr:#x} to wrong page")
            }
            SlabError::Reserved { ptr } => {
                write!(f, "slab free: pointer {ptr:#x} to reserved chunk")
            }
            SlabError::BadGeometry(msg) => write!(f, "bad pool geometry: {msg}"),
            SlabError::RegionTooSmall { len, needed } => write!(
                f,
                "region of {len} bytes too small for pool tables and one page ({needed} needed)"
            ),
            SlabError::NotInitialized => write!(f, "region is not an initialized pool"),
            SlabError::SizeMismatch { header, region } => write!(
                f,
                "region length {region} disagrees with pool header ({header})"
            ),
        }
    }
}

impl std::error::Error for SlabError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let e = SlabError::NoMemory { requested: 3000 };
        assert!(e.to_string().contains("3000"));

        let e = SlabError::Misaligned { ptr: 0x1001, chunk_size: 32 };
        let msg = e.to_string();
        assert!(msg.contains("0x1001") && msg.contains("32"));
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(Severity::Alert.to_string(), "alert");
        assert_eq!(Severity::Crit.to_string(), "crit");
    }
}
