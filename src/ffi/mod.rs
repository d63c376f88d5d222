use core::ffi::{c_int, c_void};

use crate::{config::Settings, session::Session};

pub mod modules;

/// The entry point every native module exports under [`ENTRY_SYMBOL`].
///
/// `settings` points at a [`Settings`] and `session` at a [`Session`]; a
/// module built against this crate recovers them with [`context`]. Returning
/// `0` means success, anything else is handed to the processing policy.
pub type Entry = unsafe extern "C" fn(settings: *const c_void, session: *mut c_void) -> c_int;

pub const ENTRY_SYMBOL: &[u8] = b"load\0";

/// Recover the settings and session handed to a native module's entry point.
///
/// # Safety
///
/// The pointers must be the ones passed to an [`Entry`] by this crate, and
/// the returned references must not outlive that call.
pub unsafe fn context<'a>(
    settings: *const c_void,
    session: *mut c_void,
) -> Option<(&'a Settings, &'a mut Session)> {
    unsafe {
        Some((
            settings.cast::<Settings>().as_ref()?,
            session.cast::<Session>().as_mut()?,
        ))
    }
}
