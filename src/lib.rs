pub mod archive;
pub mod config;
pub mod package;
pub mod pipeline;
pub mod repository;
pub mod runtime;

/// Test utilities shared by the unit tests.
#[cfg(test)]
pub mod test_utils {
    use crate::runtime::{MockRuntime, RealRuntime, Runtime};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Commands passed to `Runtime::run`, with their working directory.
    pub type CallLog = Arc<Mutex<Vec<(String, Option<PathBuf>)>>>;

    /// Returns the test cache directory based on the platform.
    /// - Unix: `/home/user/.cache/conda-release`
    /// - Windows: `C:\Users\user\AppData\Local\conda-release`
    pub fn test_cachedir() -> PathBuf {
        #[cfg(not(windows))]
        {
            PathBuf::from("/home/user/.cache/conda-release")
        }
        #[cfg(windows)]
        {
            PathBuf::from(r"C:\Users\user\AppData\Local\conda-release")
        }
    }

    /// Make every `run` call succeed and record it.
    pub fn record_runs(runtime: &mut MockRuntime) -> CallLog {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        runtime.expect_run().returning(move |cmd| {
            sink.lock()
                .unwrap()
                .push((cmd.to_string(), cmd.cwd().map(|p| p.to_path_buf())));
            Ok(())
        });
        log
    }

    /// Rendered command lines from a [`CallLog`], in call order.
    pub fn commands(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Route file system calls on the mock to the real file system, for tests
    /// that work inside a temporary directory but still mock processes.
    pub fn delegate_fs_to_real(runtime: &mut MockRuntime) {
        runtime.expect_exists().returning(|p| RealRuntime.exists(p));
        runtime.expect_is_dir().returning(|p| RealRuntime.is_dir(p));
        runtime
            .expect_create_dir_all()
            .returning(|p| RealRuntime.create_dir_all(p));
        runtime
            .expect_remove_dir_all()
            .returning(|p| RealRuntime.remove_dir_all(p));
        runtime
            .expect_read_to_string()
            .returning(|p| RealRuntime.read_to_string(p));
        runtime
            .expect_write()
            .returning(|p, c| RealRuntime.write(p, c));
        runtime.expect_open().returning(|p| RealRuntime.open(p));
        runtime
            .expect_create_file()
            .returning(|p| RealRuntime.create_file(p));
        runtime
            .expect_set_permissions()
            .returning(|p, m| RealRuntime.set_permissions(p, m));
        runtime
            .expect_symlink()
            .returning(|o, l| RealRuntime.symlink(o, l));
    }
}
