//! Guest-side paths and task script generation.

/// Project drive mount point inside a guest.
pub const DEV_DIR: &str = "/home/hocus/dev";

/// Repository checkout inside the project drive.
pub const REPO_DIR: &str = "/home/hocus/dev/project";

/// Scripts and logs of prebuild tasks.
pub const PREBUILD_TASK_DIR: &str = "/home/hocus/dev/.hocus/init";

/// Scripts and logs of workspace tasks.
pub const WORKSPACE_TASK_DIR: &str = "/home/hocus/dev/.hocus/command";

/// Render the wrapper script for a task command. The wrapper makes the
/// command fail fast and observable no matter what the user wrote.
pub fn task_script(command: &str) -> String {
    format!(
        "#!/bin/bash\n\
         set -o pipefail -o errexit\n\
         source /etc/profile > /dev/null 2>&1 || true\n\
         \n\
         {command}\n"
    )
}

/// Guest path of the script for task `idx`.
pub fn script_path(dir: &str, idx: i64) -> String {
    format!("{dir}/task-{idx}.sh")
}

/// Guest path of the log for task `idx`.
pub fn log_path(dir: &str, idx: i64) -> String {
    format!("{dir}/task-{idx}.log")
}

/// Foreground invocation used by the prebuild supervisor: both streams are
/// interleaved and teed into the in-guest log. pipefail makes the script's
/// exit code win over tee's.
pub fn foreground_invocation(script: &str, log: &str) -> String {
    format!("set -o pipefail\nbash \"{script}\" 2>&1 | tee \"{log}\"")
}

/// Background invocation used by workspaces: the shell detaches and prints
/// its PID.
pub fn background_invocation(script: &str, log: &str) -> String {
    format!("bash \"{script}\" > \"{log}\" 2>&1 & echo \"$!\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_script_is_deterministic() {
        let a = task_script("yarn install");
        let b = task_script("yarn install");
        assert_eq!(a, b);
        assert!(a.starts_with("#!/bin/bash\n"));
        assert!(a.contains("set -o pipefail -o errexit"));
        assert!(a.ends_with("yarn install\n"));
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            script_path(PREBUILD_TASK_DIR, 3),
            "/home/hocus/dev/.hocus/init/task-3.sh"
        );
        assert_eq!(
            log_path(WORKSPACE_TASK_DIR, 0),
            "/home/hocus/dev/.hocus/command/task-0.log"
        );
    }

    #[test]
    fn test_invocations() {
        let fg = foreground_invocation("/a/t.sh", "/a/t.log");
        assert!(fg.contains("2>&1 | tee"));
        assert!(fg.starts_with("set -o pipefail\n"));

        let bg = background_invocation("/a/t.sh", "/a/t.log");
        assert!(bg.ends_with("& echo \"$!\""));
    }
}
