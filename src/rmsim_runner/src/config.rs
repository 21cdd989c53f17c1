//! Task set description files
use rmsim_kernel::{analysis::AnalysisPolicy, cfg::TaskSetCfg, ResourceId, TaskCfg};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};
use thiserror::Error;

use crate::payload::ToyPayload;

/// The built-in task set description
pub const DEFAULT: &str = include_str!("default.toml");

#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("Could not read the file.")]
    Read(#[source] std::io::Error),
    #[error("Could not parse the file.")]
    Parse(#[source] toml::de::Error),
    #[error("Could not serialize the task set description.")]
    Serialize(#[source] toml::ser::Error),
    #[error("Task {task} refers to an undefined resource '{name}'.")]
    UnknownResource { task: usize, name: String },
    #[error("Task {task} accesses resource '{name}' without locking it.")]
    NotLocked { task: usize, name: String },
}

/// Selects the schedulability test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Liu–Layland bound on the total utilization
    #[default]
    Utilization,
    /// Liu–Layland bound per task, including blocking time
    Blocking,
    /// Exact response-time analysis, including blocking time
    ResponseTime,
}

impl From<Policy> for AnalysisPolicy {
    fn from(x: Policy) -> Self {
        match x {
            Policy::Utilization => Self::UtilizationBound,
            Policy::Blocking => Self::BlockingAware,
            Policy::ResponseTime => Self::ResponseTime,
        }
    }
}

/// The root of a task set description file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSetFile {
    /// The number of jobs each task runs, unless overridden by the task
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_profile_reps")]
    pub profile_reps: usize,
    #[serde(default)]
    pub policy: Policy,
    /// The CPU to pin the task threads to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<usize>,
    /// In lock order
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceFile>,
    #[serde(rename = "task")]
    pub tasks: Vec<TaskFile>,
}

fn default_iterations() -> usize {
    rmsim_kernel::cfg::DEFAULT_ITERATIONS
}

fn default_profile_reps() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceFile {
    pub name: String,
    #[serde(default)]
    pub initial: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    pub id: usize,
    pub period_ms: u64,
    /// The resources locked by each job, in lock order
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub awaited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<usize>,
    /// Busy-wait for this long inside the critical section
    #[serde(default)]
    pub spin_us: u64,
    /// Sleep for this long inside the critical section
    #[serde(default)]
    pub sleep_ms: u64,
}

impl TaskSetFile {
    pub fn parse(text: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(text).map_err(ConfigFileError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let text = std::fs::read_to_string(path).map_err(ConfigFileError::Read)?;
        Self::parse(&text)
    }

    pub fn builtin() -> Result<Self, ConfigFileError> {
        Self::parse(DEFAULT)
    }

    pub fn to_toml(&self) -> Result<String, ConfigFileError> {
        toml::to_string(self).map_err(ConfigFileError::Serialize)
    }

    /// Make every task run `iterations` jobs.
    pub fn override_iterations(&mut self, iterations: usize) {
        self.iterations = iterations;
        for task in self.tasks.iter_mut() {
            task.iterations = None;
        }
    }

    /// Convert the description to a kernel configuration. Validation of the
    /// task set itself is left to [`TaskSetCfg::prepare`].
    pub fn build(&self) -> Result<TaskSetCfg<i32>, ConfigFileError> {
        let mut cfg = TaskSetCfg::new();
        let mut ids = HashMap::new();
        for r in &self.resources {
            let id = cfg.resource(r.name.clone(), r.initial);
            // Duplicate names are reported by `prepare`
            ids.entry(r.name.as_str()).or_insert(id);
        }

        let lookup = |task: &TaskFile, name: &String| -> Result<(String, ResourceId), ConfigFileError> {
            ids.get(name.as_str())
                .map(|&id| (name.clone(), id))
                .ok_or_else(|| ConfigFileError::UnknownResource {
                    task: task.id,
                    name: name.clone(),
                })
        };

        for task in &self.tasks {
            let resources = task
                .resources
                .iter()
                .map(|name| lookup(task, name).map(|(_, id)| id))
                .collect::<Result<Vec<_>, _>>()?;

            let mut accessed = Vec::new();
            for names in [&task.reads, &task.writes] {
                let mut list = Vec::with_capacity(names.len());
                for name in names {
                    let (name, id) = lookup(task, name)?;
                    if !resources.contains(&id) {
                        return Err(ConfigFileError::NotLocked { task: task.id, name });
                    }
                    list.push((name, id));
                }
                accessed.push(list);
            }
            let writes = accessed.pop().unwrap_or_default();
            let reads = accessed.pop().unwrap_or_default();

            let payload = ToyPayload::new(
                task.id,
                reads,
                writes,
                Duration::from_micros(task.spin_us),
                Duration::from_millis(task.sleep_ms),
            );

            cfg.task(
                TaskCfg::new(task.id, Duration::from_millis(task.period_ms))
                    .resources(resources)
                    .iterations(task.iterations.unwrap_or(self.iterations))
                    .awaited(task.awaited)
                    .payload(move |cs| payload.run(cs)),
            );
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rmsim_kernel::{CfgError, Priority, TaskId};

    #[test]
    fn builtin_set() {
        let file = TaskSetFile::builtin().unwrap();
        assert_eq!(file.iterations, 100);
        assert_eq!(file.profile_reps, 100);
        assert_eq!(file.policy, Policy::Utilization);
        assert_eq!(file.cpu, Some(0));
        assert_eq!(file.resources.len(), 3);
        assert_eq!(
            file.tasks.iter().map(|t| t.period_ms).collect::<Vec<_>>(),
            [80, 100, 160, 200]
        );

        let prepared = file.build().unwrap().prepare().unwrap();
        // T1T2 and T1T4 are shared with task 1, T2T3 is shared by tasks 2
        // and 3
        assert_eq!(prepared.ceilings(), [Priority(0), Priority(1), Priority(0)]);
        assert_eq!(prepared.priority_of(TaskId(4)), Some(Priority(3)));
        let awaited: Vec<_> = prepared
            .tasks()
            .iter()
            .filter(|t| t.cfg().is_awaited())
            .map(|t| t.cfg().id())
            .collect();
        assert_eq!(awaited, [TaskId(1), TaskId(2)]);
    }

    #[test]
    fn defaults() {
        let file = TaskSetFile::parse(
            r#"
            [[task]]
            id = 7
            period_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(file.iterations, 100);
        assert_eq!(file.policy, Policy::Utilization);
        assert_eq!(file.cpu, None);
        assert!(file.resources.is_empty());
        assert_eq!(file.tasks[0].iterations, None);
        assert!(!file.tasks[0].awaited);
    }

    #[test]
    fn policies() {
        for (text, policy) in [
            ("utilization", Policy::Utilization),
            ("blocking", Policy::Blocking),
            ("response-time", Policy::ResponseTime),
        ] {
            let file = TaskSetFile::parse(&format!(
                "policy = \"{text}\"\n[[task]]\nid = 1\nperiod_ms = 10\n"
            ))
            .unwrap();
            assert_eq!(file.policy, policy);
        }

        assert_matches!(
            TaskSetFile::parse("policy = \"edf\"\n[[task]]\nid = 1\nperiod_ms = 10\n"),
            Err(ConfigFileError::Parse(_))
        );
    }

    #[test]
    fn unknown_field() {
        assert_matches!(
            TaskSetFile::parse("[[task]]\nid = 1\nperiod = 10\n"),
            Err(ConfigFileError::Parse(_))
        );
    }

    #[test]
    fn dump_and_reload() {
        let mut file = TaskSetFile::builtin().unwrap();
        file.tasks[2].iterations = Some(5);
        file.tasks[3].spin_us = 100;
        let text = file.to_toml().unwrap();
        assert_eq!(TaskSetFile::parse(&text).unwrap(), file);
    }

    #[test]
    fn iteration_override() {
        let mut file = TaskSetFile::builtin().unwrap();
        file.tasks[0].iterations = Some(3);
        file.override_iterations(7);
        assert!(file.tasks.iter().all(|t| t.iterations.is_none()));
        assert_eq!(file.iterations, 7);
    }

    #[test]
    fn undefined_resource() {
        let mut file = TaskSetFile::builtin().unwrap();
        file.tasks[1].resources.push("T3T4".to_owned());
        assert_matches!(
            file.build(),
            Err(ConfigFileError::UnknownResource { task: 2, name }) if name == "T3T4"
        );
    }

    #[test]
    fn access_without_lock() {
        let mut file = TaskSetFile::builtin().unwrap();
        file.tasks[2].writes.push("T1T2".to_owned());
        assert_matches!(
            file.build(),
            Err(ConfigFileError::NotLocked { task: 3, name }) if name == "T1T2"
        );
    }

    #[test]
    fn lock_order_is_checked_by_prepare() {
        let mut file = TaskSetFile::builtin().unwrap();
        file.tasks[1].resources.reverse();
        assert_matches!(
            file.build().unwrap().prepare(),
            Err(CfgError::LockOrder { task: TaskId(2), .. })
        );
    }
}
