use std::ffi::c_void;

use tracing::debug;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, RECT};
use windows::Win32::UI::WindowsAndMessaging::{
    BringWindowToTop, EnumWindows, GetClassNameW, GetForegroundWindow, GetSystemMetrics,
    GetWindowRect, GetWindowTextW, IsIconic, IsWindow, IsWindowVisible, SetForegroundWindow,
    SetWindowPos, ShowWindow, SM_CXSCREEN, SM_CYSCREEN, SWP_SHOWWINDOW, SW_RESTORE, SW_SHOW,
    SW_SHOWMAXIMIZED, SW_SHOWNORMAL,
};

use super::{Rect, WindowCommand, WindowHandle, WindowInfo, WindowSystem};
use crate::errors::AutomationError;

// Minimized windows are parked around (-32000, -32000)
const PARKED_COORDINATE: i32 = -30000;

/// Win32 implementation of [`WindowSystem`].
#[derive(Debug, Default)]
pub struct Win32WindowSystem;

impl Win32WindowSystem {
    pub fn new() -> Self {
        Self
    }
}

fn to_hwnd(handle: WindowHandle) -> HWND {
    HWND(handle.0 as *mut c_void)
}

fn to_handle(hwnd: HWND) -> WindowHandle {
    WindowHandle(hwnd.0 as isize)
}

unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let handles = &mut *(lparam.0 as *mut Vec<WindowHandle>);
    handles.push(to_handle(hwnd));
    BOOL(1)
}

fn read_utf16(buffer: &[u16], len: i32) -> String {
    if len <= 0 {
        return String::new();
    }
    String::from_utf16_lossy(&buffer[..len as usize])
}

fn read_window(handle: WindowHandle) -> Result<WindowInfo, AutomationError> {
    let hwnd = to_hwnd(handle);
    unsafe {
        if !IsWindow(hwnd).as_bool() {
            return Err(AutomationError::PlatformError(format!(
                "window {handle} no longer exists"
            )));
        }

        let mut title = [0u16; 512];
        let title_len = GetWindowTextW(hwnd, &mut title);
        let mut class = [0u16; 256];
        let class_len = GetClassNameW(hwnd, &mut class);

        let mut rect = RECT::default();
        GetWindowRect(hwnd, &mut rect).map_err(|e| {
            AutomationError::PlatformError(format!("GetWindowRect({handle}) failed: {e}"))
        })?;
        let rect = Rect::from_edges(rect.left, rect.top, rect.right, rect.bottom);

        let minimized = IsIconic(hwnd).as_bool()
            || rect.x < PARKED_COORDINATE
            || rect.y < PARKED_COORDINATE;

        Ok(WindowInfo {
            handle,
            title: read_utf16(&title, title_len),
            class_name: read_utf16(&class, class_len),
            rect,
            minimized,
            visible: IsWindowVisible(hwnd).as_bool(),
        })
    }
}

impl WindowSystem for Win32WindowSystem {
    fn enumerate(&self) -> Result<Vec<WindowInfo>, AutomationError> {
        let mut handles: Vec<WindowHandle> = Vec::new();
        unsafe {
            EnumWindows(
                Some(collect_window),
                LPARAM(&mut handles as *mut Vec<WindowHandle> as isize),
            )
            .map_err(|e| AutomationError::PlatformError(format!("EnumWindows failed: {e}")))?;
        }

        let mut windows = Vec::with_capacity(handles.len());
        for handle in handles {
            match read_window(handle) {
                Ok(info) if !info.title.is_empty() => windows.push(info),
                Ok(_) => {}
                Err(e) => debug!("Skipping window {}: {}", handle, e),
            }
        }
        debug!("Enumerated {} titled top-level windows", windows.len());
        Ok(windows)
    }

    fn foreground(&self) -> Option<WindowHandle> {
        let hwnd = unsafe { GetForegroundWindow() };
        if hwnd.0.is_null() {
            None
        } else {
            Some(to_handle(hwnd))
        }
    }

    fn window(&self, handle: WindowHandle) -> Result<WindowInfo, AutomationError> {
        read_window(handle)
    }

    fn apply(&self, handle: WindowHandle, command: WindowCommand) -> Result<(), AutomationError> {
        let hwnd = to_hwnd(handle);
        debug!("Applying {:?} to window {}", command, handle);
        unsafe {
            match command {
                WindowCommand::Restore => {
                    let _ = ShowWindow(hwnd, SW_RESTORE);
                }
                WindowCommand::Show => {
                    let _ = ShowWindow(hwnd, SW_SHOW);
                }
                WindowCommand::ShowNormal => {
                    let _ = ShowWindow(hwnd, SW_SHOWNORMAL);
                }
                WindowCommand::BringToFront => {
                    let _ = BringWindowToTop(hwnd);
                    if !SetForegroundWindow(hwnd).as_bool() {
                        // Windows refuses foreground changes from background processes
                        debug!("SetForegroundWindow refused for {}, continuing", handle);
                    }
                }
                WindowCommand::Maximize => {
                    let _ = ShowWindow(hwnd, SW_SHOWMAXIMIZED);
                }
                WindowCommand::MoveResize(rect) => {
                    SetWindowPos(
                        hwnd,
                        HWND::default(),
                        rect.x,
                        rect.y,
                        rect.width,
                        rect.height,
                        SWP_SHOWWINDOW,
                    )
                    .map_err(|e| {
                        AutomationError::PlatformError(format!(
                            "SetWindowPos({handle}) failed: {e}"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    fn screen_size(&self) -> (i32, i32) {
        unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) }
    }
}
