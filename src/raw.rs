//! Bridge between rust types and raw library handles

/// A rust type that can identify as a raw handle understood by a C API.
pub trait AsRaw {
    /// The raw C API type
    type Raw;
    /// The raw value
    ///
    /// # Safety
    ///
    /// The handle is only valid while `self` is alive. It must not be destroyed through the C
    /// API, `self` owns it.
    unsafe fn as_raw(&self) -> Self::Raw;
}

