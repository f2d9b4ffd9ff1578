use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowTextLengthW, GetWindowTextW, IsIconic, IsWindowVisible, SetForegroundWindow,
    ShowWindow, SW_RESTORE,
};

use super::WindowHandle;

/// Raw HWND value; window handles are process-independent integers.
struct Win32Window {
    hwnd: isize,
    title: String,
}

impl Win32Window {
    fn hwnd(&self) -> HWND {
        HWND(self.hwnd as *mut _)
    }
}

unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let list = &mut *(lparam.0 as *mut Vec<(isize, String)>);
    if IsWindowVisible(hwnd).as_bool() {
        let len = GetWindowTextLengthW(hwnd);
        if len > 0 {
            let mut buf = vec![0u16; len as usize + 1];
            let n = GetWindowTextW(hwnd, &mut buf);
            list.push((hwnd.0 as isize, String::from_utf16_lossy(&buf[..n.max(0) as usize])));
        }
    }
    BOOL(1)
}

pub fn find_windows(title: &str) -> anyhow::Result<Vec<Box<dyn WindowHandle>>> {
    let mut all: Vec<(isize, String)> = Vec::new();
    unsafe {
        EnumWindows(Some(collect), LPARAM(&mut all as *mut _ as isize))?;
    }
    let needle = title.to_lowercase();
    Ok(all
        .into_iter()
        .filter(|(_, t)| t.to_lowercase().contains(&needle))
        .map(|(hwnd, title)| Box::new(Win32Window { hwnd, title }) as Box<dyn WindowHandle>)
        .collect())
}

impl WindowHandle for Win32Window {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn is_minimized(&self) -> bool {
        unsafe { IsIconic(self.hwnd()).as_bool() }
    }

    fn restore(&mut self) -> anyhow::Result<()> {
        unsafe {
            let _ = ShowWindow(self.hwnd(), SW_RESTORE);
        }
        Ok(())
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        let ok = unsafe { SetForegroundWindow(self.hwnd()) };
        if !ok.as_bool() {
            anyhow::bail!("SetForegroundWindow refused '{}'", self.title);
        }
        Ok(())
    }
}
