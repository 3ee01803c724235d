//! C API.
//!
//! Thin `extern "C"` layer over [`Bartleby`]. Every failure maps to
//! `EINVAL`, except allocation failure while exporting the archive, which
//! maps to `ENOMEM`. The buffer handed out by [`bartleby_build_archive`]
//! is allocated with `malloc` and owned by the caller.

use std::ffi::{c_char, c_int, c_void, CStr};

use crate::Bartleby;

/// Opaque handle exposed to C callers.
pub struct BartlebyHandle {
    handle: Bartleby,
}

/// Allocates a new, empty handle.
#[no_mangle]
pub extern "C" fn bartleby_new() -> *mut BartlebyHandle {
    Box::into_raw(Box::new(BartlebyHandle {
        handle: Bartleby::new(),
    }))
}

/// Frees a handle. A null pointer is allowed.
///
/// # Safety
///
/// `bh` must be null or a pointer previously returned by [`bartleby_new`]
/// that has not been freed or consumed by [`bartleby_build_archive`].
#[no_mangle]
pub unsafe extern "C" fn bartleby_free(bh: *mut BartlebyHandle) {
    if !bh.is_null() {
        drop(Box::from_raw(bh));
    }
}

/// Applies `prefix` to all global and defined symbols collected so far.
///
/// Returns 0, or `EINVAL` for a null handle, a null prefix, or a prefix
/// that is not valid UTF-8.
///
/// # Safety
///
/// `bh` must be null or a live handle pointer; `prefix` must be null or a
/// nul-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn bartleby_set_prefix(
    bh: *mut BartlebyHandle,
    prefix: *const c_char,
) -> c_int {
    let Some(bh) = bh.as_mut() else {
        return libc::EINVAL;
    };
    if prefix.is_null() {
        return libc::EINVAL;
    }
    let Ok(prefix) = CStr::from_ptr(prefix).to_str() else {
        return libc::EINVAL;
    };
    bh.handle.prefix_global_and_defined_symbols(prefix);
    0
}

/// Copies `n` bytes at `s` and ingests them as a new input binary.
///
/// Returns 0, or `EINVAL` for a null handle, a null or empty buffer, or a
/// binary the handle rejects.
///
/// # Safety
///
/// `bh` must be null or a live handle pointer; `s` must be null or valid
/// for reads of `n` bytes.
#[no_mangle]
pub unsafe extern "C" fn bartleby_add_binary(
    bh: *mut BartlebyHandle,
    s: *const c_void,
    n: usize,
) -> c_int {
    let Some(bh) = bh.as_mut() else {
        return libc::EINVAL;
    };
    if s.is_null() || n == 0 {
        return libc::EINVAL;
    }
    let binary = std::slice::from_raw_parts(s.cast::<u8>(), n).to_vec();
    match bh.handle.add_binary(binary) {
        Ok(()) => 0,
        Err(_) => libc::EINVAL,
    }
}

/// Builds the final archive into a `malloc`ed buffer stored in `*s`, with
/// its length in `*n`.
///
/// The handle is consumed whether or not the build succeeds. Returns 0,
/// `EINVAL` on invalid arguments or build failure, or `ENOMEM` when the
/// output buffer cannot be allocated.
///
/// # Safety
///
/// `bh` must be null or a live handle pointer; `s` and `n` must be null or
/// valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bartleby_build_archive(
    bh: *mut BartlebyHandle,
    s: *mut *mut c_void,
    n: *mut usize,
) -> c_int {
    if bh.is_null() {
        return libc::EINVAL;
    }
    let handle = Box::from_raw(bh).handle;
    if s.is_null() {
        return libc::EINVAL;
    }
    *s = std::ptr::null_mut();
    if n.is_null() {
        return libc::EINVAL;
    }
    *n = 0;

    let Ok(buffer) = handle.build_to_buffer() else {
        return libc::EINVAL;
    };
    let out = libc::malloc(buffer.len());
    if out.is_null() {
        return libc::ENOMEM;
    }
    libc::memcpy(out, buffer.as_ptr().cast(), buffer.len());
    *s = out;
    *n = buffer.len();
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{write, Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

    fn tiny_elf() -> Vec<u8> {
        let mut obj =
            write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        obj.mangling = write::Mangling::None;
        let text = obj.section_id(write::StandardSection::Text);
        obj.append_section_data(text, &[0xc3], 1);
        obj.add_symbol(write::Symbol {
            name: b"f".to_vec(),
            value: 0,
            size: 1,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.write().unwrap()
    }

    #[test]
    fn round_trips_through_the_c_api() {
        let binary = tiny_elf();
        unsafe {
            let bh = bartleby_new();
            assert_eq!(
                bartleby_add_binary(bh, binary.as_ptr().cast(), binary.len()),
                0
            );
            assert_eq!(bartleby_set_prefix(bh, b"p_\0".as_ptr().cast()), 0);
            let mut out: *mut c_void = std::ptr::null_mut();
            let mut out_len: usize = 0;
            assert_eq!(bartleby_build_archive(bh, &mut out, &mut out_len), 0);
            assert!(!out.is_null());
            let archive = std::slice::from_raw_parts(out.cast::<u8>(), out_len).to_vec();
            libc::free(out);
            assert!(archive.starts_with(b"!<arch>\n"));
        }
    }

    #[test]
    fn null_arguments_are_rejected() {
        unsafe {
            assert_eq!(
                bartleby_set_prefix(std::ptr::null_mut(), b"p\0".as_ptr().cast()),
                libc::EINVAL
            );
            assert_eq!(bartleby_add_binary(std::ptr::null_mut(), std::ptr::null(), 0), libc::EINVAL);
            let bh = bartleby_new();
            assert_eq!(bartleby_set_prefix(bh, std::ptr::null()), libc::EINVAL);
            assert_eq!(bartleby_add_binary(bh, std::ptr::null(), 4), libc::EINVAL);
            bartleby_free(bh);
            bartleby_free(std::ptr::null_mut());
        }
    }
}
