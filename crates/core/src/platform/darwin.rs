use std::process::{Command as ProcessCommand, Stdio};

use core_foundation::array::CFArray;
use core_foundation::base::TCFType;
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use core_graphics::window::*;
use tracing::{info, warn};

use super::WindowHandle;

struct DarwinWindow {
    title: String,
    pid: i32,
    on_screen: bool,
}

/// Normal-layer windows whose title or owner contains `title`.
pub fn find_windows(title: &str) -> anyhow::Result<Vec<Box<dyn WindowHandle>>> {
    let needle = title.to_lowercase();
    let mut windows: Vec<Box<dyn WindowHandle>> = Vec::new();

    unsafe {
        let option = kCGWindowListOptionAll | kCGWindowListExcludeDesktopElements;
        let window_list_ref = CGWindowListCopyWindowInfo(option, kCGNullWindowID);
        if window_list_ref.is_null() {
            anyhow::bail!("failed to get window list");
        }

        let list: CFArray = CFArray::wrap_under_create_rule(window_list_ref as _);
        for dict_ptr in &list.get_all_values() {
            let dict: CFDictionary<CFString, *const std::ffi::c_void> =
                CFDictionary::wrap_under_get_rule(*dict_ptr as _);

            if get_cf_number(&dict, "kCGWindowLayer") != Some(0) {
                continue;
            }
            let name = get_cf_string(&dict, "kCGWindowName").unwrap_or_default();
            let owner = get_cf_string(&dict, "kCGWindowOwnerName").unwrap_or_default();
            let is_match = [&name, &owner]
                .iter()
                .any(|s| !s.is_empty() && s.to_lowercase().contains(&needle));
            let Some(pid) = get_cf_number(&dict, "kCGWindowOwnerPID") else { continue };
            if !is_match {
                continue;
            }

            let title = if !name.is_empty() { name } else { owner };
            info!("found window: \"{}\" (pid: {})", title, pid);
            windows.push(Box::new(DarwinWindow {
                title,
                pid: pid as i32,
                on_screen: get_cf_bool(&dict, "kCGWindowIsOnscreen").unwrap_or(false),
            }));
        }
    }

    Ok(windows)
}

fn osascript(script: &str) -> anyhow::Result<()> {
    let status = ProcessCommand::new("osascript")
        .arg("-e")
        .arg(script)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        warn!("osascript exited with {}", status);
        anyhow::bail!("osascript failed");
    }
    Ok(())
}

impl WindowHandle for DarwinWindow {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn is_minimized(&self) -> bool {
        !self.on_screen
    }

    fn restore(&mut self) -> anyhow::Result<()> {
        let script = format!(
            "tell application \"System Events\" to tell (first process whose unix id is {}) \
             to set value of attribute \"AXMinimized\" of (first window whose name is \"{}\") to false",
            self.pid,
            self.title.replace('"', "\\\"")
        );
        osascript(&script)?;
        self.on_screen = true;
        Ok(())
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        let script = format!(
            "tell application \"System Events\" to set frontmost of first process whose unix id is {} to true",
            self.pid
        );
        osascript(&script)
    }
}

// --- CF Dictionary helpers ---

unsafe fn get_cf_string(
    dict: &CFDictionary<CFString, *const std::ffi::c_void>,
    key: &str,
) -> Option<String> {
    let cf_key = CFString::new(key);
    let value = dict.find(&cf_key)?;
    let cf_str: CFString = CFString::wrap_under_get_rule(*value as _);
    Some(cf_str.to_string())
}

unsafe fn get_cf_number(
    dict: &CFDictionary<CFString, *const std::ffi::c_void>,
    key: &str,
) -> Option<i64> {
    let cf_key = CFString::new(key);
    let value = dict.find(&cf_key)?;
    let cf_num: CFNumber = CFNumber::wrap_under_get_rule(*value as _);
    cf_num.to_i64()
}

unsafe fn get_cf_bool(
    dict: &CFDictionary<CFString, *const std::ffi::c_void>,
    key: &str,
) -> Option<bool> {
    let cf_key = CFString::new(key);
    let value = dict.find(&cf_key)?;
    let cf_bool: CFBoolean = CFBoolean::wrap_under_get_rule(*value as _);
    Some(cf_bool.into())
}
