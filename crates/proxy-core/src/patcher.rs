//! Rebinding entries in a loaded module's import address table.
//!
//! Headers and import tables are read with `pelite`. The writes themselves
//! go through a [ProtectMemory] implementation so the page protection dance
//! can be swapped out when the image isn't really a mapped module.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::*;
use pelite::image::IMAGE_DIRECTORY_ENTRY_IMPORT;
#[cfg(target_pointer_width = "32")]
use pelite::pe32 as pe;
#[cfg(target_pointer_width = "64")]
use pelite::pe64 as pe;
use pe::imports::Import;
use pe::{Pe, PeObject, PeView, Va};

use crate::error::PatchError;

const THUNK_SIZE: usize = size_of::<usize>();

/// A module image mapped into the current process.
pub struct ModuleImage {
    base: *mut u8,
    view: PeView<'static>,
}

// Safety: this is only an address range. Every write through it is
// individually unsafe and bounds-checked.
unsafe impl Send for ModuleImage {}
unsafe impl Sync for ModuleImage {}

impl ModuleImage {
    /// Wraps a module the system loader mapped at `base`.
    ///
    /// ## Safety
    ///
    /// `base` must be the handle of a loaded module, and the module must stay
    /// loaded for as long as the returned value is used.
    pub unsafe fn from_module(base: *mut u8) -> Self {
        Self {
            base,
            view: unsafe { PeView::module(base) },
        }
    }

    /// Validates the headers of an image laid out as the loader would map
    /// it, in the `len` bytes at `base`.
    ///
    /// ## Safety
    ///
    /// The `len` bytes at `base` must be readable and writable for as long
    /// as the returned value is used.
    pub unsafe fn from_mapped(base: *mut u8, len: usize) -> Result<Self, PatchError> {
        let bytes: &'static [u8] = unsafe { std::slice::from_raw_parts(base, len) };
        Ok(Self {
            base,
            view: PeView::from_bytes(bytes)?,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// The image's `SizeOfImage`.
    pub fn size(&self) -> usize {
        self.view.image().len()
    }

    /// Returns the address of `len` bytes at `rva`, or an error if any of them
    /// lie outside the image.
    pub fn address(&self, rva: usize, len: usize) -> Result<*mut u8, PatchError> {
        match rva.checked_add(len) {
            Some(end) if end <= self.size() => Ok(unsafe { self.base.add(rva) }),
            _ => Err(PatchError::OutOfBounds {
                rva,
                size: self.size(),
            }),
        }
    }

    /// Finds the import address table slot bound to `symbol` from `dll`.
    ///
    /// DLL names are compared case-insensitively, symbol names exactly.
    /// Symbols imported only by ordinal are skipped.
    pub fn find_import(&self, dll: &str, symbol: &str) -> Result<*mut usize, PatchError> {
        let not_found = || PatchError::ImportNotFound {
            dll: dll.to_string(),
            symbol: symbol.to_string(),
        };

        let has_imports = self
            .view
            .data_directory()
            .get(IMAGE_DIRECTORY_ENTRY_IMPORT)
            .is_some_and(|directory| directory.VirtualAddress != 0);
        if !has_imports {
            return Err(not_found());
        }

        for desc in self.view.imports()? {
            if desc.image().Name == 0 {
                break;
            }
            if !desc
                .dll_name()?
                .to_str()
                .is_ok_and(|name| name.eq_ignore_ascii_case(dll))
            {
                continue;
            }
            if desc.image().OriginalFirstThunk == 0 {
                // Without the lookup table the names are gone once the loader
                // has bound the address table.
                debug!("{dll} import descriptor has no lookup table, skipping");
                continue;
            }

            for (slot, import) in desc.iat()?.zip(desc.int()?) {
                let Ok(Import::ByName { name, .. }) = import else {
                    continue;
                };
                if name.to_str().is_ok_and(|name| name == symbol) {
                    let rva = slot as *const Va as usize - self.base as usize;
                    return Ok(self.address(rva, THUNK_SIZE)? as *mut usize);
                }
            }
        }

        Err(not_found())
    }
}

/// How a range of memory is used, which determines the protection it needs
/// while being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Plain data such as import address table slots.
    Data,

    /// Executable code.
    Code,
}

/// Temporarily lifts write protection from a range of memory.
pub trait ProtectMemory {
    /// Makes `len` bytes at `address` writable and returns the previous
    /// protection so it can be passed back to [Self::restore].
    ///
    /// ## Safety
    ///
    /// The range must be mapped.
    unsafe fn unprotect(&self, address: *mut u8, len: usize, access: Access)
    -> Result<u32, PatchError>;

    /// Restores the protection returned by [Self::unprotect].
    ///
    /// ## Safety
    ///
    /// The range must be mapped.
    unsafe fn restore(&self, address: *mut u8, len: usize, previous: u32) -> Result<(), PatchError>;

    /// Makes sure no stale instructions are executed after code was written.
    fn flush_instructions(&self, _address: *const u8, _len: usize) {}
}

/// A [ProtectMemory] for memory that is already writable.
pub struct NoProtection;

impl ProtectMemory for NoProtection {
    unsafe fn unprotect(&self, _: *mut u8, _: usize, _: Access) -> Result<u32, PatchError> {
        Ok(0)
    }

    unsafe fn restore(&self, _: *mut u8, _: usize, _: u32) -> Result<(), PatchError> {
        Ok(())
    }
}

#[cfg(windows)]
pub use self::windows_protection::VirtualProtection;

#[cfg(windows)]
mod windows_protection {
    use std::ffi::c_void;

    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualProtect,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    use super::*;

    /// Changes page protection with `VirtualProtect`.
    pub struct VirtualProtection;

    impl ProtectMemory for VirtualProtection {
        unsafe fn unprotect(
            &self,
            address: *mut u8,
            len: usize,
            access: Access,
        ) -> Result<u32, PatchError> {
            let protection = match access {
                Access::Data => PAGE_READWRITE,
                Access::Code => PAGE_EXECUTE_READWRITE,
            };
            let mut previous = PAGE_PROTECTION_FLAGS(0);
            unsafe { VirtualProtect(address as *const c_void, len, protection, &mut previous) }
                .map_err(|e| PatchError::Protect {
                    address: address as usize,
                    message: e.to_string(),
                })?;
            Ok(previous.0)
        }

        unsafe fn restore(
            &self,
            address: *mut u8,
            len: usize,
            previous: u32,
        ) -> Result<(), PatchError> {
            let mut ignored = PAGE_PROTECTION_FLAGS(0);
            unsafe {
                VirtualProtect(
                    address as *const c_void,
                    len,
                    PAGE_PROTECTION_FLAGS(previous),
                    &mut ignored,
                )
            }
            .map_err(|e| PatchError::Protect {
                address: address as usize,
                message: e.to_string(),
            })
        }

        fn flush_instructions(&self, address: *const u8, len: usize) {
            if let Err(e) = unsafe {
                FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), len)
            } {
                warn!("FlushInstructionCache failed: {e}");
            }
        }
    }
}

/// One import slot we've rebound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportBinding {
    slot: usize,
    original: usize,
    replacement: usize,
}

impl ImportBinding {
    /// The address the slot was bound to before we patched it.
    pub fn original(&self) -> usize {
        self.original
    }

    pub fn replacement(&self) -> usize {
        self.replacement
    }

    pub fn slot(&self) -> *mut usize {
        self.slot as *mut usize
    }

    /// Rebinds the slot to its original address, unless something else has
    /// rebound it since. Returns whether the slot was restored.
    ///
    /// ## Safety
    ///
    /// The module this binding came from must still be loaded.
    pub unsafe fn restore(&self, protect: &impl ProtectMemory) -> Result<bool, PatchError> {
        let slot = self.slot();
        let previous = unsafe { protect.unprotect(slot as *mut u8, THUNK_SIZE, Access::Data)? };
        // Safety: import address table slots are pointer-aligned.
        let restored = unsafe { AtomicUsize::from_ptr(slot) }
            .compare_exchange(
                self.replacement,
                self.original,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        restore_or_warn(protect, slot as *mut u8, THUNK_SIZE, previous);
        Ok(restored)
    }
}

/// Rebinds the slot `image` imports `symbol` from `dll` through so that it
/// points to `replacement`, and returns the binding with the address it
/// pointed to before.
///
/// Callers are expected to patch each symbol once. Patching it again rebinds
/// it to the new replacement and reports the previous replacement as the
/// original.
///
/// ## Safety
///
/// `replacement` must be a function with the same signature and calling
/// convention as the imported one, and must stay valid while the binding is
/// installed.
pub unsafe fn patch_import(
    image: &ModuleImage,
    dll: &str,
    symbol: &str,
    replacement: usize,
    protect: &impl ProtectMemory,
) -> Result<ImportBinding, PatchError> {
    let slot = image.find_import(dll, symbol)?;

    let previous = unsafe { protect.unprotect(slot as *mut u8, THUNK_SIZE, Access::Data)? };
    // Safety: import address table slots are pointer-aligned, and host
    // threads may read the slot while we write it.
    let original = unsafe { AtomicUsize::from_ptr(slot) }.swap(replacement, Ordering::SeqCst);
    restore_or_warn(protect, slot as *mut u8, THUNK_SIZE, previous);

    debug!("Rebound {dll}!{symbol}: {original:#x} -> {replacement:#x}");
    Ok(ImportBinding {
        slot: slot as usize,
        original,
        replacement,
    })
}

/// Overwrites the code at `rva` in `image` with `bytes`.
///
/// ## Safety
///
/// No thread may be executing the overwritten instructions, and `bytes` must
/// leave the function they belong to well-formed.
pub unsafe fn patch_code(
    image: &ModuleImage,
    rva: usize,
    bytes: &[u8],
    protect: &impl ProtectMemory,
) -> Result<(), PatchError> {
    let address = image.address(rva, bytes.len())?;
    let previous = unsafe { protect.unprotect(address, bytes.len(), Access::Code)? };
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), address, bytes.len()) };
    restore_or_warn(protect, address, bytes.len(), previous);
    protect.flush_instructions(address, bytes.len());
    Ok(())
}

// Once the write has happened the patch is live, so a failure to restore the
// old protection is only worth a warning.
fn restore_or_warn(protect: &impl ProtectMemory, address: *mut u8, len: usize, previous: u32) {
    if let Err(e) = unsafe { protect.restore(address, len, previous) } {
        warn!("{e}");
    }
}

/// Synthetic module images for exercising the patcher without a real loader.
#[cfg(test)]
pub(crate) mod test_image {
    use super::*;

    const IMAGE_SIZE: usize = 0x2000;
    const NT_HEADERS: usize = 0x80;
    const HEADERS_SIZE: usize = 0x200;
    const DESCRIPTORS: usize = 0x200;
    const DATA: usize = 0x400;

    const IMPORT_DESCRIPTOR_SIZE: usize = 20;
    const ORDINAL_FLAG: usize = 1 << (usize::BITS - 1);
    const HINT_SIZE: usize = 2;

    // Offsets into the file header, which follows the NT signature.
    const FILE_HEADER: usize = NT_HEADERS + 4;
    const MACHINE: usize = FILE_HEADER;
    const NUMBER_OF_SECTIONS: usize = FILE_HEADER + 2;
    const SIZE_OF_OPTIONAL_HEADER: usize = FILE_HEADER + 16;
    const CHARACTERISTICS: usize = FILE_HEADER + 18;
    const DLL_IMAGE_FLAGS: u16 = 0x2022;

    // Offsets into the optional header.
    const OPTIONAL_HEADER: usize = FILE_HEADER + 20;
    const SECTION_ALIGNMENT: usize = 32;
    const FILE_ALIGNMENT: usize = 36;
    const SIZE_OF_IMAGE: usize = 56;
    const SIZE_OF_HEADERS: usize = 60;
    const SUBSYSTEM: usize = 68;

    #[cfg(target_pointer_width = "64")]
    mod layout {
        pub const MACHINE_TYPE: u16 = 0x8664;
        pub const OPTIONAL_MAGIC: u16 = 0x20B;
        pub const OPTIONAL_HEADER_SIZE: usize = 240;
        pub const RVA_COUNT: usize = 108;
        pub const DATA_DIRECTORY: usize = 112;
    }

    #[cfg(target_pointer_width = "32")]
    mod layout {
        pub const MACHINE_TYPE: u16 = 0x14C;
        pub const OPTIONAL_MAGIC: u16 = 0x10B;
        pub const OPTIONAL_HEADER_SIZE: usize = 224;
        pub const RVA_COUNT: usize = 92;
        pub const DATA_DIRECTORY: usize = 96;
    }

    use layout::*;

    pub(crate) enum Import<'a> {
        /// A symbol imported by name, and the address it's bound to.
        Name(&'a str, usize),

        /// A symbol imported by ordinal, and the address it's bound to.
        Ordinal(u16, usize),
    }

    /// A fake mapped module with one section, laid out the way the loader
    /// maps a DLL, holding just an import directory.
    pub(crate) struct TestImage {
        // u64 storage keeps every thunk pointer-aligned.
        words: Vec<u64>,
        address_tables: Vec<usize>,
    }

    impl TestImage {
        /// An image whose import directory lists `dlls`, each with its
        /// imports in order.
        pub(crate) fn new(dlls: &[(&str, &[Import])]) -> Self {
            let mut image = Self::headers_only();
            image.put_import_directory(DESCRIPTORS as u32, dlls.len());

            let mut cursor = DATA;
            for (i, (dll, imports)) in dlls.iter().enumerate() {
                let name = cursor;
                cursor = image.put_str(cursor, dll);

                cursor = align(cursor, THUNK_SIZE);
                let lookup_table = cursor;
                let address_table = lookup_table + (imports.len() + 1) * THUNK_SIZE;
                cursor = address_table + (imports.len() + 1) * THUNK_SIZE;

                for (j, import) in imports.iter().enumerate() {
                    let (lookup, bound) = match import {
                        Import::Name(symbol, bound) => {
                            let hint = align(cursor, 2);
                            cursor = image.put_str(hint + HINT_SIZE, symbol);
                            (hint, *bound)
                        }
                        Import::Ordinal(ordinal, bound) => {
                            (ORDINAL_FLAG | *ordinal as usize, *bound)
                        }
                    };
                    image.put_usize(lookup_table + j * THUNK_SIZE, lookup);
                    image.put_usize(address_table + j * THUNK_SIZE, bound);
                }

                let descriptor = DESCRIPTORS + i * IMPORT_DESCRIPTOR_SIZE;
                image.put_u32(descriptor, lookup_table as u32);
                image.put_u32(descriptor + 12, name as u32);
                image.put_u32(descriptor + 16, address_table as u32);
                image.address_tables.push(address_table);
            }
            assert!(cursor < IMAGE_SIZE, "test image overflow");
            image
        }

        /// An image with valid headers and no import directory at all.
        pub(crate) fn headers_only() -> Self {
            let mut image = Self {
                words: vec![0; IMAGE_SIZE / 8],
                address_tables: vec![],
            };
            image.put_u16(0, 0x5A4D);
            image.put_u32(0x3C, NT_HEADERS as u32);
            image.put_u32(NT_HEADERS, 0x0000_4550);

            image.put_u16(MACHINE, MACHINE_TYPE);
            image.put_u16(NUMBER_OF_SECTIONS, 1);
            image.put_u16(SIZE_OF_OPTIONAL_HEADER, OPTIONAL_HEADER_SIZE as u16);
            image.put_u16(CHARACTERISTICS, DLL_IMAGE_FLAGS);

            image.put_u16(OPTIONAL_HEADER, OPTIONAL_MAGIC);
            image.put_u32(OPTIONAL_HEADER + SECTION_ALIGNMENT, HEADERS_SIZE as u32);
            image.put_u32(OPTIONAL_HEADER + FILE_ALIGNMENT, HEADERS_SIZE as u32);
            image.put_u32(OPTIONAL_HEADER + SIZE_OF_IMAGE, IMAGE_SIZE as u32);
            image.put_u32(OPTIONAL_HEADER + SIZE_OF_HEADERS, HEADERS_SIZE as u32);
            // IMAGE_SUBSYSTEM_WINDOWS_GUI
            image.put_u16(OPTIONAL_HEADER + SUBSYSTEM, 2);
            image.put_u32(OPTIONAL_HEADER + RVA_COUNT, 16);

            // A single .data section spanning everything after the headers.
            let section = OPTIONAL_HEADER + OPTIONAL_HEADER_SIZE;
            let body = (IMAGE_SIZE - HEADERS_SIZE) as u32;
            image.bytes_mut()[section..section + 5].copy_from_slice(b".data");
            image.put_u32(section + 8, body);
            image.put_u32(section + 12, HEADERS_SIZE as u32);
            image.put_u32(section + 16, body);
            image.put_u32(section + 20, HEADERS_SIZE as u32);
            // Initialized data, readable and writable.
            image.put_u32(section + 36, 0xC000_0040);
            image
        }

        /// Points the import directory at `count` descriptors and their null
        /// terminator at `rva`.
        pub(crate) fn put_import_directory(&mut self, rva: u32, count: usize) {
            let entry = OPTIONAL_HEADER + DATA_DIRECTORY + IMAGE_DIRECTORY_ENTRY_IMPORT * 8;
            self.put_u32(entry, rva);
            self.put_u32(entry + 4, ((count + 1) * IMPORT_DESCRIPTOR_SIZE) as u32);
        }

        pub(crate) fn image(&mut self) -> ModuleImage {
            // Safety: the buffer lives as long as `self`, which the tests
            // keep alive for as long as they use the image.
            unsafe { ModuleImage::from_mapped(self.words.as_mut_ptr() as *mut u8, IMAGE_SIZE) }
                .expect("test image headers should be valid")
        }

        /// The address currently bound in `dll`'s `index`th slot.
        pub(crate) fn bound(&self, dll: usize, index: usize) -> usize {
            self.get_usize(self.address_tables[dll] + index * THUNK_SIZE)
        }

        pub(crate) fn bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, IMAGE_SIZE) }
        }

        pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
            unsafe {
                std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, IMAGE_SIZE)
            }
        }

        fn put_str(&mut self, offset: usize, value: &str) -> usize {
            let end = offset + value.len();
            self.bytes_mut()[offset..end].copy_from_slice(value.as_bytes());
            self.bytes_mut()[end] = 0;
            end + 1
        }

        fn put_u16(&mut self, offset: usize, value: u16) {
            self.bytes_mut()[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }

        fn put_u32(&mut self, offset: usize, value: u32) {
            self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn put_usize(&mut self, offset: usize, value: usize) {
            self.bytes_mut()[offset..offset + THUNK_SIZE].copy_from_slice(&value.to_ne_bytes());
        }

        fn get_usize(&self, offset: usize) -> usize {
            let mut bytes = [0; THUNK_SIZE];
            bytes.copy_from_slice(&self.bytes()[offset..offset + THUNK_SIZE]);
            usize::from_ne_bytes(bytes)
        }
    }

    fn align(offset: usize, to: usize) -> usize {
        offset.next_multiple_of(to)
    }
}
