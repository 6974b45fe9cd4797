use std::path::{Path, PathBuf};

use crate::name::Name;

/// Default runtime directory for sockets and console FIFOs. Overridable at
/// daemon startup; nothing else is read from the environment.
pub const DEFAULT_TMPDIR: &str = "/tmp/vmmd";

/// The supervisor's command socket.
pub fn command_socket(dir: &Path) -> PathBuf {
    dir.join("vmmd.sock")
}

/// The console multiplexer's listen socket.
pub fn console_socket(dir: &Path) -> PathBuf {
    dir.join("cons.sock")
}

/// The stats helper's listen socket (optional helper).
pub fn stats_socket(dir: &Path) -> PathBuf {
    dir.join("stat.sock")
}

/// The log helper's listen socket.
pub fn log_socket(dir: &Path) -> PathBuf {
    dir.join("log.sock")
}

/// The serial-console FIFO for a VM, keyed by its dotted name.
pub fn console_fifo(dir: &Path, name: &Name) -> PathBuf {
    dir.join(format!("{name}.fifo"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names() {
        let dir = Path::new("/run/x");
        assert_eq!(command_socket(dir), Path::new("/run/x/vmmd.sock"));
        assert_eq!(console_socket(dir), Path::new("/run/x/cons.sock"));
        assert_eq!(stats_socket(dir), Path::new("/run/x/stat.sock"));
        assert_eq!(log_socket(dir), Path::new("/run/x/log.sock"));
    }

    #[test]
    fn fifo_uses_dotted_name() {
        let name: Name = "vm.a".parse().unwrap();
        assert_eq!(
            console_fifo(Path::new("/run/x"), &name),
            Path::new("/run/x/vm.a.fifo")
        );
    }
}
