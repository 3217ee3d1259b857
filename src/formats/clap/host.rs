//! The `clap_host` object handed to every CLAP plugin.
//!
//! The shell is pinned so the vtable pointers the plugin retains stay valid
//! for the instance lifetime. Extension callbacks record requests into
//! atomics the adapter consumes at well-defined points (flush on the audio
//! thread when no block is in flight, restart from the control surface),
//! and `request_callback` dispatches `on_main_thread` through the host's
//! main-thread queue.

use std::ffi::{c_char, c_void, CStr, CString};
use std::pin::Pin;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, Ordering};

use clap_sys::ext::log::{
    clap_host_log, clap_log_severity, CLAP_EXT_LOG, CLAP_LOG_DEBUG, CLAP_LOG_ERROR,
    CLAP_LOG_WARNING,
};
use clap_sys::ext::params::{clap_host_params, clap_param_rescan_flags, CLAP_EXT_PARAMS};
use clap_sys::ext::thread_check::{clap_host_thread_check, CLAP_EXT_THREAD_CHECK};
use clap_sys::ext::timer_support::{clap_host_timer_support, CLAP_EXT_TIMER_SUPPORT};
use clap_sys::host::clap_host;
use clap_sys::id::clap_id;
use clap_sys::version::CLAP_VERSION;

use crate::event_loop;

const HOST_NAME: &CStr = c"uniplug";
const HOST_VENDOR: &CStr = c"uniplug project";
const HOST_URL: &CStr = c"https://github.com/uniplug/uniplug";
const HOST_VERSION: &CStr = c"0.1.0";

/// Requests raised by the plugin through host callbacks.
#[derive(Default)]
pub struct HostRequests {
    pub restart: AtomicBool,
    pub process: AtomicBool,
    pub callback: AtomicBool,
    pub flush: AtomicBool,
    pub rescan_params: AtomicBool,
}

pub struct ClapHostShell {
    host: clap_host,
    log_ext: clap_host_log,
    params_ext: clap_host_params,
    timer_ext: clap_host_timer_support,
    thread_check_ext: clap_host_thread_check,
    pub requests: HostRequests,
    plugin_name: CString,
    /// The plugin pointer for `on_main_thread` dispatch; set right after
    /// instantiation and cleared before destruction so late callbacks
    /// become no-ops.
    main_thread_target: std::sync::Mutex<usize>,
    timer_serial: std::sync::Mutex<clap_id>,
}

unsafe impl Send for ClapHostShell {}
unsafe impl Sync for ClapHostShell {}

impl ClapHostShell {
    pub fn new(plugin_name: &str) -> Pin<Box<Self>> {
        let mut shell = Box::pin(Self {
            host: clap_host {
                clap_version: CLAP_VERSION,
                host_data: null_mut(),
                name: HOST_NAME.as_ptr(),
                vendor: HOST_VENDOR.as_ptr(),
                url: HOST_URL.as_ptr(),
                version: HOST_VERSION.as_ptr(),
                get_extension: Some(Self::get_extension),
                request_restart: Some(Self::request_restart),
                request_process: Some(Self::request_process),
                request_callback: Some(Self::request_callback),
            },
            log_ext: clap_host_log {
                log: Some(Self::log),
            },
            params_ext: clap_host_params {
                rescan: Some(Self::params_rescan),
                clear: None,
                request_flush: Some(Self::params_request_flush),
            },
            timer_ext: clap_host_timer_support {
                register_timer: Some(Self::register_timer),
                unregister_timer: Some(Self::unregister_timer),
            },
            thread_check_ext: clap_host_thread_check {
                is_main_thread: Some(Self::is_main_thread),
                is_audio_thread: Some(Self::is_audio_thread),
            },
            requests: HostRequests::default(),
            plugin_name: CString::new(plugin_name).unwrap_or_default(),
            main_thread_target: std::sync::Mutex::new(0),
            timer_serial: std::sync::Mutex::new(1),
        });
        let ctx = &*shell as *const Self as *mut c_void;
        // Safety: only host_data is written; nothing moves.
        unsafe {
            Pin::get_unchecked_mut(shell.as_mut()).host.host_data = ctx;
        }
        shell
    }

    pub fn as_clap_host(self: &Pin<Box<Self>>) -> *const clap_host {
        &self.host
    }

    /// Install the plugin pointer used for deferred `on_main_thread` calls.
    pub fn set_main_thread_target(&self, plugin: *const clap_sys::plugin::clap_plugin) {
        *self.main_thread_target.lock().unwrap() = plugin as usize;
    }

    /// Neutralize callbacks arriving during teardown.
    pub fn clear_main_thread_target(&self) {
        *self.main_thread_target.lock().unwrap() = 0;
    }

    unsafe fn shell<'a>(host: *const clap_host) -> Option<&'a Self> {
        if host.is_null() || (*host).host_data.is_null() {
            return None;
        }
        Some(&*((*host).host_data as *const Self))
    }

    unsafe extern "C" fn get_extension(
        host: *const clap_host,
        extension_id: *const c_char,
    ) -> *const c_void {
        let Some(shell) = Self::shell(host) else {
            return std::ptr::null();
        };
        if extension_id.is_null() {
            return std::ptr::null();
        }
        let id = CStr::from_ptr(extension_id);
        if id == CLAP_EXT_LOG {
            &shell.log_ext as *const clap_host_log as *const c_void
        } else if id == CLAP_EXT_PARAMS {
            &shell.params_ext as *const clap_host_params as *const c_void
        } else if id == CLAP_EXT_TIMER_SUPPORT {
            &shell.timer_ext as *const clap_host_timer_support as *const c_void
        } else if id == CLAP_EXT_THREAD_CHECK {
            &shell.thread_check_ext as *const clap_host_thread_check as *const c_void
        } else {
            std::ptr::null()
        }
    }

    unsafe extern "C" fn request_restart(host: *const clap_host) {
        if let Some(shell) = Self::shell(host) {
            shell.requests.restart.store(true, Ordering::SeqCst);
        }
    }

    unsafe extern "C" fn request_process(host: *const clap_host) {
        if let Some(shell) = Self::shell(host) {
            shell.requests.process.store(true, Ordering::SeqCst);
        }
    }

    unsafe extern "C" fn request_callback(host: *const clap_host) {
        let Some(shell) = Self::shell(host) else {
            return;
        };
        shell.requests.callback.store(true, Ordering::SeqCst);
        let target = *shell.main_thread_target.lock().unwrap();
        if target == 0 {
            return;
        }
        event_loop::post_task_on_main_thread(move || {
            let plugin = target as *const clap_sys::plugin::clap_plugin;
            unsafe {
                if let Some(on_main_thread) = (*plugin).on_main_thread {
                    on_main_thread(plugin);
                }
            }
        });
    }

    unsafe extern "C" fn log(
        host: *const clap_host,
        severity: clap_log_severity,
        message: *const c_char,
    ) {
        let name = Self::shell(host)
            .map(|s| s.plugin_name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let message = if message.is_null() {
            String::new()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        };
        match severity {
            CLAP_LOG_DEBUG => log::debug!("[{name}] {message}"),
            CLAP_LOG_WARNING => log::warn!("[{name}] {message}"),
            s if s >= CLAP_LOG_ERROR => log::error!("[{name}] {message}"),
            _ => log::info!("[{name}] {message}"),
        }
    }

    unsafe extern "C" fn params_rescan(host: *const clap_host, _flags: clap_param_rescan_flags) {
        if let Some(shell) = Self::shell(host) {
            shell.requests.rescan_params.store(true, Ordering::SeqCst);
        }
    }

    unsafe extern "C" fn params_request_flush(host: *const clap_host) {
        if let Some(shell) = Self::shell(host) {
            shell.requests.flush.store(true, Ordering::SeqCst);
        }
    }

    unsafe extern "C" fn register_timer(
        host: *const clap_host,
        _period_ms: u32,
        timer_id: *mut clap_id,
    ) -> bool {
        let Some(shell) = Self::shell(host) else {
            return false;
        };
        if timer_id.is_null() {
            return false;
        }
        let mut serial = shell.timer_serial.lock().unwrap();
        *timer_id = *serial;
        *serial += 1;
        true
    }

    unsafe extern "C" fn unregister_timer(_host: *const clap_host, _timer_id: clap_id) -> bool {
        true
    }

    unsafe extern "C" fn is_main_thread(_host: *const clap_host) -> bool {
        event_loop::is_main_thread()
    }

    unsafe extern "C" fn is_audio_thread(_host: *const clap_host) -> bool {
        !event_loop::is_main_thread()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_flags() {
        let shell = ClapHostShell::new("test");
        let host = shell.as_clap_host();
        unsafe {
            ((*host).request_restart.unwrap())(host);
            ClapHostShell::params_request_flush(host);
        }
        assert!(shell.requests.restart.load(Ordering::SeqCst));
        assert!(shell.requests.flush.load(Ordering::SeqCst));
        assert!(!shell.requests.process.load(Ordering::SeqCst));
    }

    #[test]
    fn test_get_extension_lookup() {
        let shell = ClapHostShell::new("test");
        let host = shell.as_clap_host();
        unsafe {
            let log = ClapHostShell::get_extension(host, CLAP_EXT_LOG.as_ptr());
            assert!(!log.is_null());
            let missing = ClapHostShell::get_extension(host, c"clap.nope".as_ptr());
            assert!(missing.is_null());
        }
    }
}
