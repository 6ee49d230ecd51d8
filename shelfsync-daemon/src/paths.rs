use std::path::{Path, PathBuf};

use shelfsync_core::config::root_at;

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const JOBS_JOURNAL: &str = "jobs.json";
/// Store namespace holding subscriptions.
pub const STORE_NAMESPACE: &str = "subscriptions";

pub fn shelfsync_root(home: &Path) -> PathBuf {
    root_at(home)
}

pub fn run_dir(home: &Path) -> PathBuf {
    shelfsync_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}

pub fn jobs_path(home: &Path) -> PathBuf {
    shelfsync_root(home).join(JOBS_JOURNAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn everything_lives_under_the_root() {
        let home = Path::new("/home/reader");
        assert_eq!(
            socket_path(home),
            PathBuf::from("/home/reader/.shelfsync/run/daemon.sock")
        );
        assert_eq!(jobs_path(home), PathBuf::from("/home/reader/.shelfsync/jobs.json"));
    }
}
