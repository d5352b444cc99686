//! Console and launcher-handshake plumbing.

use tracing::{debug, warn};
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::Console::AllocConsole;
use windows::Win32::System::Threading::{EVENT_MODIFY_STATE, OpenEventW, SetEvent};
use windows::core::HSTRING;

use crate::READY_EVENT_VAR;

/// The host is a GUI-subsystem tool; give the logs somewhere to go.
pub(crate) fn attach_console() {
    // SAFETY: no preconditions; fails harmlessly if a console exists.
    let _ = unsafe { AllocConsole() };
}

/// Set the launcher's one-shot ready event, if one was named. Called
/// after every operation has been attempted, whatever the outcome.
pub(crate) fn signal_ready_event() {
    let Ok(name) = std::env::var(READY_EVENT_VAR) else {
        debug!("No ready event configured");
        return;
    };
    // SAFETY: the launcher owns the event; we only ask for modify access.
    let handle = match unsafe {
        OpenEventW(EVENT_MODIFY_STATE.0, false, &HSTRING::from(name.as_str()))
    } {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Could not open ready event {name:?}: {e}");
            return;
        }
    };
    // SAFETY: the handle is valid and open for modify access.
    unsafe {
        if let Err(e) = SetEvent(handle) {
            warn!("Could not signal ready event {name:?}: {e}");
        }
        let _ = CloseHandle(handle);
    }
    debug!("Ready event {name:?} signaled");
}
