use std::ffi::c_void;
use std::fmt;

/// The tag stamped into the high bits of every handle we mint.
///
/// On 64-bit targets the whole tag sits in the upper 32 bits, which never
/// form a canonical user-mode address. On 32-bit targets only its upper half
/// fits, and that lands in kernel address space.
pub const HANDLE_TAG: u32 = 0xF00D_B00F;

#[cfg(target_pointer_width = "64")]
const TAG_SHIFT: u32 = 32;
#[cfg(target_pointer_width = "64")]
const TAG_VALUE: usize = HANDLE_TAG as usize;

#[cfg(target_pointer_width = "32")]
const TAG_SHIFT: u32 = 16;
#[cfg(target_pointer_width = "32")]
const TAG_VALUE: usize = (HANDLE_TAG >> 16) as usize;

const ID_MASK: usize = 0xFFFF;

/// A resource handle we hand to the host in place of a native one.
///
/// The value is a tag in the high bits and a 16-bit id in the low bits.
/// Classifying a value needs no state, so it's safe to call [is_synthetic] on
/// anything the host passes us.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntheticHandle(usize);

impl SyntheticHandle {
    /// Mints the handle for `id`.
    pub const fn encode(id: u16) -> Self {
        Self((TAG_VALUE << TAG_SHIFT) | id as usize)
    }

    /// Returns the handle if `raw` carries our tag.
    pub fn from_raw(raw: usize) -> Option<Self> {
        is_synthetic(raw).then_some(Self(raw))
    }

    /// Returns the handle if `ptr` carries our tag.
    pub fn from_ptr(ptr: *const c_void) -> Option<Self> {
        Self::from_raw(ptr as usize)
    }

    pub const fn id(self) -> u16 {
        decode_id(self.0)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    /// The handle as the pointer-typed value the host's resource API expects.
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl fmt::Debug for SyntheticHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyntheticHandle({:#x}, id = {})", self.0, self.id())
    }
}

/// Returns whether `raw` is a handle minted by [SyntheticHandle::encode].
pub const fn is_synthetic(raw: usize) -> bool {
    raw >> TAG_SHIFT == TAG_VALUE
}

/// Extracts the 16-bit id from a handle value.
pub const fn decode_id(raw: usize) -> u16 {
    (raw & ID_MASK) as u16
}
