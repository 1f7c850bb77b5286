//! Platform-specific names for launchers, release assets and the tunnel binary

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Base names of the backend's entry-point executable, in lookup order
pub const LAUNCHER_BASE_NAMES: &[&str] = &["koboldcpp-launcher", "koboldcpp"];

/// Executable suffixes to try, in platform-preferred order
pub fn executable_suffixes() -> &'static [&'static str] {
    if cfg!(windows) {
        &[".exe", ""]
    } else {
        &["", ".exe"]
    }
}

/// Every launcher file name to look for inside a backend folder, in order
pub fn launcher_candidates() -> Vec<String> {
    let mut names = Vec::new();
    for base in LAUNCHER_BASE_NAMES {
        for suffix in executable_suffixes() {
            names.push(format!("{}{}", base, suffix));
        }
    }
    names
}

/// File name the installer renames an unpacked entry point to
pub fn primary_launcher_name() -> String {
    let suffix = if cfg!(windows) { ".exe" } else { "" };
    format!("{}{}", LAUNCHER_BASE_NAMES[0], suffix)
}

/// Name of the tunnel binary as stored in the install directory
pub fn tunnel_binary_name() -> &'static str {
    if cfg!(windows) {
        "cloudflared.exe"
    } else {
        "cloudflared"
    }
}

/// Release asset holding the tunnel binary for this OS/arch
pub fn tunnel_asset_name() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("windows", "x86_64") => Some("cloudflared-windows-amd64.exe"),
        ("windows", "x86") => Some("cloudflared-windows-386.exe"),
        ("linux", "x86_64") => Some("cloudflared-linux-amd64"),
        ("linux", "aarch64") => Some("cloudflared-linux-arm64"),
        ("linux", "arm") => Some("cloudflared-linux-arm"),
        // macOS assets are tarballs; a plain binary is published for neither arch
        _ => None,
    }
}

/// Whether a backend release asset targets the running OS
pub fn release_asset_matches_platform(asset_name: &str) -> bool {
    let name = asset_name.to_lowercase();
    if name.ends_with(".packed") || name.ends_with(".zip") || name.ends_with(".tar.gz") {
        return false;
    }

    match std::env::consts::OS {
        "windows" => name.ends_with(".exe"),
        "macos" => name.contains("mac"),
        "linux" => name.contains("linux"),
        _ => false,
    }
}

/// Keep child processes from flashing a console window on Windows
pub fn hide_console_window(cmd: &mut tokio::process::Command) {
    #[cfg(target_os = "windows")]
    cmd.creation_flags(CREATE_NO_WINDOW);
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_cover_every_base_name() {
        let candidates = launcher_candidates();
        assert_eq!(candidates.len(), LAUNCHER_BASE_NAMES.len() * 2);
        assert!(candidates[0].starts_with("koboldcpp-launcher"));
        assert!(candidates.contains(&"koboldcpp.exe".to_string()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_asset_matching() {
        assert!(release_asset_matches_platform("koboldcpp-linux-x64-cuda1210"));
        assert!(!release_asset_matches_platform("koboldcpp.exe"));
        assert!(!release_asset_matches_platform("koboldcpp-mac-arm64"));
        assert_eq!(executable_suffixes()[0], "");
    }
}
