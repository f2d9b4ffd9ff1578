use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Human-readable name of the run/stop hotkey on this OS.
pub fn hotkey_label() -> &'static str {
    if cfg!(target_os = "macos") {
        "Cmd+Shift+K"
    } else if cfg!(target_os = "windows") {
        "Ctrl+Shift+K"
    } else {
        "none"
    }
}

/// Take the pending hotkey press, if any.
pub fn take_press(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::AcqRel)
}

/// Listen for Cmd+Shift+K on a background thread and raise `flag` on
/// every press. The UI loop consumes it with [`take_press`].
#[cfg(target_os = "macos")]
pub fn start_hotkey_listener(flag: Arc<AtomicBool>) {
    use std::ffi::c_void;

    type CGEventTapProxy = *mut c_void;
    type CGEventRef = *mut c_void;
    type CFMachPortRef = *mut c_void;
    type CFRunLoopSourceRef = *mut c_void;
    type CFRunLoopRef = *mut c_void;
    type CFStringRef = *const c_void;
    type CGEventMask = u64;
    type CGEventType = u32;
    type CGEventFlags = u64;

    type CGEventTapCallBack =
        unsafe extern "C" fn(CGEventTapProxy, CGEventType, CGEventRef, *mut c_void) -> CGEventRef;

    const K_CG_HID_EVENT_TAP: u32 = 0;
    const K_CG_HEAD_INSERT_EVENT_TAP: u32 = 0;
    const K_CG_EVENT_TAP_OPTION_LISTEN_ONLY: u32 = 1;
    const CG_EVENT_KEY_DOWN: u32 = 10;
    const K_CG_KEYBOARD_EVENT_KEYCODE: u32 = 9;
    const K_CG_KEYBOARD_EVENT_AUTOREPEAT: u32 = 8;

    const FLAG_SHIFT: u64 = 0x0002_0000;
    const FLAG_CONTROL: u64 = 0x0004_0000;
    const FLAG_ALTERNATE: u64 = 0x0008_0000;
    const FLAG_COMMAND: u64 = 0x0010_0000;

    const KEYCODE_K: i64 = 40;

    extern "C" {
        fn CGEventTapCreate(
            tap: u32,
            place: u32,
            options: u32,
            events_of_interest: CGEventMask,
            callback: CGEventTapCallBack,
            user_info: *mut c_void,
        ) -> CFMachPortRef;
        fn CFMachPortCreateRunLoopSource(
            allocator: *const c_void,
            port: CFMachPortRef,
            order: i64,
        ) -> CFRunLoopSourceRef;
        fn CFRunLoopGetCurrent() -> CFRunLoopRef;
        fn CFRunLoopAddSource(rl: CFRunLoopRef, source: CFRunLoopSourceRef, mode: CFStringRef);
        fn CFRunLoopRun();
        fn CGEventGetFlags(event: CGEventRef) -> CGEventFlags;
        fn CGEventGetIntegerValueField(event: CGEventRef, field: u32) -> i64;
        fn CGEventTapEnable(tap: CFMachPortRef, enable: bool);

        static kCFRunLoopCommonModes: CFStringRef;
    }

    unsafe extern "C" fn on_key(
        _proxy: CGEventTapProxy,
        event_type: CGEventType,
        event: CGEventRef,
        user_info: *mut c_void,
    ) -> CGEventRef {
        if event_type != CG_EVENT_KEY_DOWN {
            return event;
        }
        if CGEventGetIntegerValueField(event, K_CG_KEYBOARD_EVENT_AUTOREPEAT) != 0 {
            return event;
        }
        let flags = CGEventGetFlags(event);
        let keycode = CGEventGetIntegerValueField(event, K_CG_KEYBOARD_EVENT_KEYCODE);
        let wanted = flags & FLAG_COMMAND != 0
            && flags & FLAG_SHIFT != 0
            && flags & (FLAG_ALTERNATE | FLAG_CONTROL) == 0;
        if keycode == KEYCODE_K && wanted {
            let flag = &*(user_info as *const AtomicBool);
            flag.store(true, Ordering::Release);
        }
        event
    }

    std::thread::spawn(move || unsafe {
        let flag_ptr = Arc::into_raw(flag) as *mut c_void;
        let tap = CGEventTapCreate(
            K_CG_HID_EVENT_TAP,
            K_CG_HEAD_INSERT_EVENT_TAP,
            K_CG_EVENT_TAP_OPTION_LISTEN_ONLY,
            1 << CG_EVENT_KEY_DOWN,
            on_key,
            flag_ptr,
        );
        if tap.is_null() {
            tracing::error!("failed to create event tap for {}; grant Accessibility permission to your terminal", hotkey_label());
            drop(Arc::from_raw(flag_ptr as *const AtomicBool));
            return;
        }
        let source = CFMachPortCreateRunLoopSource(std::ptr::null(), tap, 0);
        CFRunLoopAddSource(CFRunLoopGetCurrent(), source, kCFRunLoopCommonModes);
        CGEventTapEnable(tap, true);
        info!("global hotkey {} registered", hotkey_label());
        CFRunLoopRun();
    });
}

/// Bring the terminal that owns this process to the front.
#[cfg(target_os = "macos")]
pub fn activate_terminal() {
    let ppid = unsafe { libc::getppid() };
    let script = format!(
        "tell application \"System Events\" to set frontmost of first process whose unix id is {} to true",
        ppid
    );
    let _ = std::process::Command::new("osascript")
        .arg("-e")
        .arg(&script)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}

/// Listen for Ctrl+Shift+K on a background thread and raise `flag` on
/// every press.
#[cfg(target_os = "windows")]
pub fn start_hotkey_listener(flag: Arc<AtomicBool>) {
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::Input::KeyboardAndMouse::{RegisterHotKey, MOD_CONTROL, MOD_NOREPEAT, MOD_SHIFT};
    use windows::Win32::UI::WindowsAndMessaging::{GetMessageW, MSG, WM_HOTKEY};

    const HOTKEY_ID: i32 = 1;
    const VK_K: u32 = 0x4B;

    std::thread::spawn(move || unsafe {
        if let Err(e) = RegisterHotKey(HWND::default(), HOTKEY_ID, MOD_CONTROL | MOD_SHIFT | MOD_NOREPEAT, VK_K) {
            tracing::error!("failed to register global hotkey {}: {}", hotkey_label(), e);
            return;
        }
        info!("global hotkey {} registered", hotkey_label());

        // Hotkey messages are posted to the registering thread's queue.
        let mut msg = MSG::default();
        while GetMessageW(&mut msg, HWND::default(), 0, 0).as_bool() {
            if msg.message == WM_HOTKEY && msg.wParam.0 == HOTKEY_ID as usize {
                flag.store(true, Ordering::Release);
            }
        }
    });
}

/// Bring the console window that owns this process to the foreground.
#[cfg(target_os = "windows")]
pub fn activate_terminal() {
    use windows::Win32::System::Console::GetConsoleWindow;
    use windows::Win32::UI::WindowsAndMessaging::{SetForegroundWindow, ShowWindow, SW_RESTORE};

    unsafe {
        let hwnd = GetConsoleWindow();
        if !hwnd.is_invalid() {
            let _ = ShowWindow(hwnd, SW_RESTORE);
            let _ = SetForegroundWindow(hwnd);
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn start_hotkey_listener(_flag: Arc<AtomicBool>) {
    info!("global hotkey not supported on this OS");
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn activate_terminal() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_is_consumed_once() {
        let flag = AtomicBool::new(true);
        assert!(take_press(&flag));
        assert!(!take_press(&flag));
    }
}
