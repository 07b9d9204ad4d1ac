use std::path::{Path, PathBuf};

/// Environment variable overriding the broker bus address.
pub const BROKER_ADDRESS_ENV: &str = "VFS_BROKER_ADDRESS";

/// Get the address of the broker bus
///
/// Priority:
/// 1. `VFS_BROKER_ADDRESS` environment variable (if set)
/// 2. `unix:path=$XDG_RUNTIME_DIR/vfs/broker.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `unix:path=/tmp/vfs/broker.sock` (fallback)
pub fn broker_address() -> String {
    if let Ok(address) = std::env::var(BROKER_ADDRESS_ENV) {
        return address;
    }
    let path = dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vfs")
        .join("broker.sock");
    socket_address(&path)
}

/// Address string for a Unix socket at `path`.
pub fn socket_address(path: &Path) -> String {
    format!("unix:path={}", path.display())
}

/// Resolve an address string to a socket path.
///
/// Accepts `unix:path=<path>` (other `key=value` pairs after a comma are
/// ignored) or a bare absolute path.
pub fn parse_address(address: &str) -> Option<PathBuf> {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix("unix:") {
        return rest
            .split(',')
            .find_map(|kv| kv.strip_prefix("path="))
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
    }
    let path = Path::new(address);
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        None
    }
}
