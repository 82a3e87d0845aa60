//! Task records.
//!
//! The metadata store has no task bucket; every container may have had a
//! task, named after the container. When a state directory is available
//! the pid recorded in the task bundle is reported, which may be stale.

use std::fmt;

use serde::Serialize;

use crate::container::Container;
use crate::environment::{RecordedPid, TaskState};

/// Task status as far as on-disk state can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Stopped,
    Unknown,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Unknown => "UNKNOWN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub namespace: String,
    pub container_id: String,
    pub container_type: String,
    pub pid: u32,
    pub status: TaskStatus,
}

/// Derive the task of each container.
pub fn tasks_for(containers: &[Container], state: Option<&TaskState>) -> Vec<Task> {
    containers
        .iter()
        .map(|c| {
            let (pid, status) = match state.map(|s| s.recorded_pid(&c.namespace, &c.id)) {
                Some(RecordedPid::Pid(pid)) => (pid, TaskStatus::Running),
                Some(RecordedPid::Missing) => (0, TaskStatus::Stopped),
                Some(RecordedPid::Malformed) => {
                    tracing::warn!(namespace = %c.namespace, id = %c.id, "unparsable init.pid");
                    (0, TaskStatus::Unknown)
                }
                None => (0, TaskStatus::Unknown),
            };
            Task {
                namespace: c.namespace.clone(),
                container_id: c.id.clone(),
                container_type: c.container_type.clone(),
                pid,
                status,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExplorerConfig;
    use crate::environment::{Environment, TASK_PLUGIN_DIR};
    use std::collections::BTreeMap;

    fn container(ns: &str, id: &str) -> Container {
        Container {
            namespace: ns.into(),
            id: id.into(),
            image: String::new(),
            created_at: None,
            updated_at: None,
            labels: BTreeMap::new(),
            hostname: String::new(),
            support_container: false,
            container_type: "container".into(),
            snapshotter: String::new(),
            snapshot_key: String::new(),
            runtime: String::new(),
            sandbox_id: String::new(),
        }
    }

    #[test]
    fn test_without_state_is_unknown() {
        let tasks = tasks_for(&[container("default", "a")], None);
        assert_eq!(tasks[0].status, TaskStatus::Unknown);
        assert_eq!(tasks[0].pid, 0);
        assert_eq!(tasks[0].container_type, "container");
    }

    #[test]
    fn test_with_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let bundle = dir.path().join(TASK_PLUGIN_DIR).join("default/a");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("init.pid"), "1234\n").unwrap();
        let config = ExplorerConfig {
            state: Some(dir.path().to_path_buf()),
            ..ExplorerConfig::default()
        };
        let state = Environment::new(config).task_state().unwrap();

        let tasks = tasks_for(
            &[container("default", "a"), container("default", "b")],
            Some(&state),
        );
        assert_eq!((tasks[0].pid, tasks[0].status), (1234, TaskStatus::Running));
        assert_eq!((tasks[1].pid, tasks[1].status), (0, TaskStatus::Stopped));
        assert_eq!(TaskStatus::Running.to_string(), "RUNNING");
    }
}
