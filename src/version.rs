//! Version information for the rutunnel library

/// Current version of the rutunnel library
pub const VERSION: &str = "v0.1.0";

/// Platform information (OS/architecture)
pub fn platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}
