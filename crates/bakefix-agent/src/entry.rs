//! DLL entry point.

use std::ffi::c_void;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use windows::Win32::Foundation::{BOOL, HINSTANCE};
use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

use crate::platform;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn on_attach() {
    // Console first, so the subscriber binds its output to it.
    platform::attach_console();
    init_tracing();
    info!("bakefix agent attached");

    let ok = std::panic::catch_unwind(crate::run_attach_pass).unwrap_or_else(|_| {
        warn!("Patch pass panicked");
        false
    });
    if ok {
        info!("All requested operations applied");
    } else {
        warn!("One or more operations did not apply");
    }
    platform::signal_ready_event();
}

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
extern "system" fn DllMain(_module: HINSTANCE, call_reason: u32, _reserved: *mut c_void) -> BOOL {
    if call_reason == DLL_PROCESS_ATTACH {
        on_attach();
    }
    BOOL::from(true)
}
