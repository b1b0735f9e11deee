//! Elevation check run before any destructive operation.

/// Returns `true` when the process runs as root.
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Returns `true` when the process runs with administrator rights.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    // SAFETY: IsUserAnAdmin takes no arguments and only inspects the process token.
    unsafe { windows_sys::Win32::UI::Shell::IsUserAnAdmin() != 0 }
}
