use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::sync::OnceLock;

/// A module handle as the host's resource API sees it.
pub type ModuleHandle = *mut c_void;

pub type FindResourceWFn =
    unsafe extern "system" fn(module: ModuleHandle, name: *const u16, ty: *const u16) -> *mut c_void;
pub type LoadResourceFn =
    unsafe extern "system" fn(module: ModuleHandle, info: *mut c_void) -> *mut c_void;
pub type SizeofResourceFn = unsafe extern "system" fn(module: ModuleHandle, info: *mut c_void) -> u32;
pub type LockResourceFn = unsafe extern "system" fn(data: *mut c_void) -> *mut c_void;
pub type FreeResourceFn = unsafe extern "system" fn(data: *mut c_void) -> i32;

/// The `RT_RCDATA` resource type, which is where the host keeps its shader
/// bytecode.
pub const RT_RCDATA: u16 = 10;

/// A resource name or type exactly as the host passed it.
///
/// Win32 packs integer identifiers into the low 16 bits of a string pointer,
/// so a value is either such an identifier or a pointer to a nul-terminated
/// UTF-16 string.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ResourceId<'a> {
    raw: *const u16,
    _string: PhantomData<&'a u16>,
}

impl ResourceId<'static> {
    /// The equivalent of `MAKEINTRESOURCEW(id)`.
    pub const fn from_int(id: u16) -> Self {
        Self {
            raw: id as usize as *const u16,
            _string: PhantomData,
        }
    }
}

impl<'a> ResourceId<'a> {
    /// Wraps a raw value from the host.
    ///
    /// ## Safety
    ///
    /// Unless it's an integer identifier, `raw` must point to a nul-terminated
    /// UTF-16 string that outlives `'a`.
    pub const unsafe fn from_raw(raw: *const u16) -> Self {
        Self {
            raw,
            _string: PhantomData,
        }
    }

    /// Borrows a nul-terminated UTF-16 string.
    pub fn from_wide(string: &'a [u16]) -> Self {
        assert_eq!(string.last(), Some(&0), "resource names must be nul-terminated");
        Self {
            raw: string.as_ptr(),
            _string: PhantomData,
        }
    }

    pub fn as_raw(self) -> *const u16 {
        self.raw
    }

    /// The integer identifier, if this is one (`IS_INTRESOURCE`).
    pub fn as_int(self) -> Option<u16> {
        let value = self.raw as usize;
        (value >> 16 == 0).then_some(value as u16)
    }

    /// The string name, if this is one.
    pub fn name(self) -> Option<String> {
        if self.as_int().is_some() {
            return None;
        }
        // Safety: guaranteed by the constructors.
        Some(String::from_utf16_lossy(unsafe { wide_str(self.raw) }))
    }
}

impl fmt::Display for ResourceId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_int() {
            Some(id) => write!(f, "#{id}"),
            None => write!(f, "{:?}", self.name().unwrap_or_default()),
        }
    }
}

impl fmt::Debug for ResourceId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({self})")
    }
}

/// Borrows the nul-terminated UTF-16 string at `ptr`, without the terminator.
///
/// ## Safety
///
/// `ptr` must be non-null and point to a nul-terminated UTF-16 string.
pub unsafe fn wide_str<'a>(ptr: *const u16) -> &'a [u16] {
    let mut len = 0;
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    unsafe { std::slice::from_raw_parts(ptr, len) }
}

/// Encodes `s` as a nul-terminated UTF-16 string.
pub fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

/// The host's own implementation of one resource function, bound once when
/// its import is patched.
pub struct Original<F>(OnceLock<F>);

impl<F: Copy> Original<F> {
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Records `function` as the implementation to forward to. Returns false
    /// if one was already recorded.
    pub fn bind(&self, function: F) -> bool {
        self.0.set(function).is_ok()
    }

    pub fn get(&self) -> Option<F> {
        self.0.get().copied()
    }
}

impl<F: Copy> Default for Original<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// The host's implementations of the resource functions we intercept. Any of
/// them may be missing if its import couldn't be patched, in which case the
/// corresponding hook is never reached.
#[derive(Default)]
pub struct ResourceApi {
    pub find_resource: Original<FindResourceWFn>,
    pub load_resource: Original<LoadResourceFn>,
    pub sizeof_resource: Original<SizeofResourceFn>,
    pub lock_resource: Original<LockResourceFn>,
    pub free_resource: Original<FreeResourceFn>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ids() {
        let id = ResourceId::from_int(7);
        assert_eq!(id.as_int(), Some(7));
        assert_eq!(id.name(), None);
        assert_eq!(id.to_string(), "#7");
    }

    #[test]
    fn string_names() {
        let wide = to_wide("LANCZOS");
        let id = ResourceId::from_wide(&wide);
        assert_eq!(id.as_int(), None);
        assert_eq!(id.name().as_deref(), Some("LANCZOS"));
        assert_eq!(id.to_string(), "\"LANCZOS\"");
    }

    #[test]
    fn originals_bind_once() {
        unsafe extern "system" fn first(_: *mut c_void) -> i32 {
            1
        }
        unsafe extern "system" fn second(_: *mut c_void) -> i32 {
            2
        }

        let original = Original::<FreeResourceFn>::new();
        assert!(original.get().is_none());
        assert!(original.bind(first));
        assert!(!original.bind(second));
        assert_eq!(unsafe { original.get().unwrap()(std::ptr::null_mut()) }, 1);
    }
}
