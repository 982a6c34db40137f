//! Launcher environment and run configuration
//!
//! A process launcher tells each process where it sits on its node through environment
//! variables. This module turns those variables into a typed [`LocalTopology`] and fails with a
//! [`ConfigError`] naming the variable when one is absent or malformed.
//!
//! Loading goes through a lookup function rather than reading the process environment directly,
//! see [`LocalTopology::from_lookup`].

use std::env;
use std::fmt;
use std::num::ParseIntError;

use thiserror::Error;

/// Errors raised while reading the launcher environment
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("environment variable {var} is not set")]
    Missing {
        /// Variable name
        var: &'static str,
    },
    /// A variable is set but does not hold a non-negative integer.
    #[error("environment variable {var}={value:?} is not a non-negative integer")]
    Malformed {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
        /// Parse failure
        #[source]
        source: ParseIntError,
    },
    /// The local group size is zero, so no device can be selected.
    #[error("environment variable {var} reports an empty local group")]
    ZeroSize {
        /// Variable name
        var: &'static str,
    },
    /// Auto-detection found no known launcher.
    #[error("no process launcher detected (tried {})", .tried.join(", "))]
    NoLauncher {
        /// Ordinal variables that were looked up
        tried: Vec<&'static str>,
    },
    /// A per-node list has no entry for this node.
    #[error("environment variable {var} describes {nodes} nodes, node {node} is not one of them")]
    NodeOutOfRange {
        /// Variable name
        var: &'static str,
        /// Index of this node
        node: usize,
        /// Number of nodes in the list
        nodes: usize,
    },
}

/// The process launcher whose environment describes the local topology.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, clap::ValueEnum)]
pub enum Launcher {
    /// Use the first launcher whose ordinal variable is present.
    #[default]
    Auto,
    /// Open MPI `mpirun`
    OpenMpi,
    /// MPICH Hydra `mpiexec`
    Hydra,
    /// Slurm `srun`
    Slurm,
}

impl Launcher {
    /// Launchers tried by [`Launcher::Auto`], in order.
    pub const DETECTION_ORDER: [Launcher; 3] = [Launcher::OpenMpi, Launcher::Hydra, Launcher::Slurm];

    /// Variable holding the ordinal of this process on its node
    pub fn ordinal_var(self) -> Option<&'static str> {
        match self {
            Launcher::Auto => None,
            Launcher::OpenMpi => Some("OMPI_COMM_WORLD_LOCAL_RANK"),
            Launcher::Hydra => Some("MPI_LOCALRANKID"),
            Launcher::Slurm => Some("SLURM_LOCALID"),
        }
    }

    /// Variable holding the number of processes on this node
    pub fn size_var(self) -> Option<&'static str> {
        match self {
            Launcher::Auto => None,
            Launcher::OpenMpi => Some("OMPI_COMM_WORLD_LOCAL_SIZE"),
            Launcher::Hydra => Some("MPI_LOCALNRANKS"),
            Launcher::Slurm => Some("SLURM_NTASKS_PER_NODE"),
        }
    }
}

impl fmt::Display for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Launcher::Auto => "auto",
            Launcher::OpenMpi => "Open MPI",
            Launcher::Hydra => "Hydra",
            Launcher::Slurm => "Slurm",
        })
    }
}

/// What to do when the collective reports an asynchronous error after the reduction is issued.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, clap::ValueEnum)]
pub enum AsyncErrorPolicy {
    /// Fail the run.
    #[default]
    Escalate,
    /// Log the error and carry on to synchronization and verification.
    Advisory,
}

/// Where this process sits on its node, as reported by the launcher.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LocalTopology {
    /// Launcher the values were read from
    pub launcher: Launcher,
    /// Ordinal of this process among the processes on its node
    pub ordinal: usize,
    /// Number of processes on this node, never zero
    pub size: usize,
}

impl LocalTopology {
    /// Read the topology from the process environment.
    pub fn from_env(launcher: Launcher) -> Result<Self, ConfigError> {
        Self::from_lookup(launcher, |var| env::var(var).ok())
    }

    /// Read the topology through `lookup`, which maps a variable name to its value.
    ///
    /// With [`Launcher::Auto`] the first launcher in [`Launcher::DETECTION_ORDER`] whose ordinal
    /// variable is present is used.
    pub fn from_lookup<F>(launcher: Launcher, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let launcher = match launcher {
            Launcher::Auto => detect(&lookup)?,
            other => other,
        };
        // concrete launchers always name both variables
        let (ordinal_var, size_var) = match (launcher.ordinal_var(), launcher.size_var()) {
            (Some(ordinal_var), Some(size_var)) => (ordinal_var, size_var),
            _ => return Err(ConfigError::NoLauncher { tried: Vec::new() }),
        };

        let ordinal = parse(ordinal_var, lookup(ordinal_var))?;
        let size = match (launcher, lookup(size_var)) {
            (Launcher::Slurm, None) => slurm_tasks_per_node(&lookup)?,
            (_, value) => parse(size_var, value)?,
        };
        if size == 0 {
            return Err(ConfigError::ZeroSize { var: size_var });
        }

        Ok(LocalTopology {
            launcher,
            ordinal,
            size,
        })
    }

    /// The device this process binds to.
    pub fn device(&self) -> usize {
        crate::device::select_device(self.ordinal, self.size)
    }
}

fn detect<F>(lookup: &F) -> Result<Launcher, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Launcher::DETECTION_ORDER
        .iter()
        .copied()
        .find(|launcher| {
            launcher
                .ordinal_var()
                .map_or(false, |var| lookup(var).is_some())
        })
        .ok_or_else(|| ConfigError::NoLauncher {
            tried: Launcher::DETECTION_ORDER
                .iter()
                .filter_map(|launcher| launcher.ordinal_var())
                .collect(),
        })
}

fn parse(var: &'static str, value: Option<String>) -> Result<usize, ConfigError> {
    let value = value.ok_or(ConfigError::Missing { var })?;
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::Malformed { var, value, source })
}

/// `SLURM_TASKS_PER_NODE` lists the task count of every node of the job in a compressed form:
/// `4(x2),3` is two nodes of four tasks followed by one of three. `SLURM_NODEID` picks the entry
/// of this node.
fn slurm_tasks_per_node<F>(lookup: &F) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    const VAR: &str = "SLURM_TASKS_PER_NODE";
    const NODE_VAR: &str = "SLURM_NODEID";

    let value = lookup(VAR).ok_or(ConfigError::Missing {
        var: "SLURM_NTASKS_PER_NODE",
    })?;
    let node = parse(NODE_VAR, lookup(NODE_VAR))?;
    let malformed = |source| ConfigError::Malformed {
        var: VAR,
        value: value.clone(),
        source,
    };

    let mut nodes = 0usize;
    for entry in value.split(',') {
        let entry = entry.trim();
        let (tasks, repeat) = match entry
            .strip_suffix(')')
            .and_then(|entry| entry.split_once("(x"))
        {
            Some((tasks, repeat)) => (tasks, repeat.parse::<usize>().map_err(malformed)?),
            None => (entry, 1),
        };
        let tasks = tasks.parse::<usize>().map_err(malformed)?;
        nodes = nodes.saturating_add(repeat);
        if node < nodes {
            return Ok(tasks);
        }
    }
    Err(ConfigError::NodeOutOfRange {
        var: VAR,
        node,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn open_mpi_environment() {
        let topo = LocalTopology::from_lookup(
            Launcher::Auto,
            vars(&[
                ("OMPI_COMM_WORLD_LOCAL_RANK", "3"),
                ("OMPI_COMM_WORLD_LOCAL_SIZE", "4"),
            ]),
        )
        .unwrap();
        assert_eq!(topo.launcher, Launcher::OpenMpi);
        assert_eq!(topo.ordinal, 3);
        assert_eq!(topo.size, 4);
        assert_eq!(topo.device(), 3);
    }

    #[test]
    fn ordinal_past_size_wraps() {
        let topo = LocalTopology::from_lookup(
            Launcher::Hydra,
            vars(&[("MPI_LOCALRANKID", "5"), ("MPI_LOCALNRANKS", "4")]),
        )
        .unwrap();
        assert_eq!(topo.device(), 1);
    }

    #[test]
    fn missing_size_is_reported_by_name() {
        let err = LocalTopology::from_lookup(
            Launcher::OpenMpi,
            vars(&[("OMPI_COMM_WORLD_LOCAL_RANK", "0")]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                var: "OMPI_COMM_WORLD_LOCAL_SIZE"
            }
        );
    }

    #[test]
    fn malformed_value_keeps_the_text() {
        let err = LocalTopology::from_lookup(
            Launcher::OpenMpi,
            vars(&[
                ("OMPI_COMM_WORLD_LOCAL_RANK", "zero"),
                ("OMPI_COMM_WORLD_LOCAL_SIZE", "2"),
            ]),
        )
        .unwrap_err();
        match err {
            ConfigError::Malformed { var, value, .. } => {
                assert_eq!(var, "OMPI_COMM_WORLD_LOCAL_RANK");
                assert_eq!(value, "zero");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn negative_ordinal_is_malformed() {
        let err = LocalTopology::from_lookup(
            Launcher::OpenMpi,
            vars(&[
                ("OMPI_COMM_WORLD_LOCAL_RANK", "-1"),
                ("OMPI_COMM_WORLD_LOCAL_SIZE", "2"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn zero_size_is_rejected() {
        let err = LocalTopology::from_lookup(
            Launcher::OpenMpi,
            vars(&[
                ("OMPI_COMM_WORLD_LOCAL_RANK", "0"),
                ("OMPI_COMM_WORLD_LOCAL_SIZE", "0"),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ZeroSize {
                var: "OMPI_COMM_WORLD_LOCAL_SIZE"
            }
        );
    }

    #[test]
    fn nothing_detected() {
        let err = LocalTopology::from_lookup(Launcher::Auto, vars(&[])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::NoLauncher {
                tried: vec!["OMPI_COMM_WORLD_LOCAL_RANK", "MPI_LOCALRANKID", "SLURM_LOCALID"]
            }
        );
        assert!(err.to_string().contains("SLURM_LOCALID"));
    }

    #[test]
    fn open_mpi_wins_detection() {
        let topo = LocalTopology::from_lookup(
            Launcher::Auto,
            vars(&[
                ("SLURM_LOCALID", "1"),
                ("SLURM_NTASKS_PER_NODE", "2"),
                ("OMPI_COMM_WORLD_LOCAL_RANK", "0"),
                ("OMPI_COMM_WORLD_LOCAL_SIZE", "8"),
            ]),
        )
        .unwrap();
        assert_eq!(topo.launcher, Launcher::OpenMpi);
        assert_eq!(topo.size, 8);
    }

    #[test]
    fn slurm_falls_back_to_tasks_per_node() {
        let topo = LocalTopology::from_lookup(
            Launcher::Auto,
            vars(&[
                ("SLURM_LOCALID", "2"),
                ("SLURM_NODEID", "1"),
                ("SLURM_TASKS_PER_NODE", "4(x2),3"),
            ]),
        )
        .unwrap();
        assert_eq!(topo.launcher, Launcher::Slurm);
        assert_eq!(topo.size, 4);
        assert_eq!(topo.device(), 2);
    }

    #[test]
    fn slurm_uneven_nodes_use_their_own_count() {
        let devices: Vec<usize> = (0..4)
            .map(|local| {
                let local = local.to_string();
                LocalTopology::from_lookup(
                    Launcher::Slurm,
                    vars(&[
                        ("SLURM_LOCALID", local.as_str()),
                        ("SLURM_NODEID", "1"),
                        ("SLURM_TASKS_PER_NODE", "2,4"),
                    ]),
                )
                .unwrap()
            })
            .map(|topo| {
                assert_eq!(topo.size, 4);
                topo.device()
            })
            .collect();
        assert_eq!(devices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn slurm_repeated_entries_expand() {
        let topo = LocalTopology::from_lookup(
            Launcher::Slurm,
            vars(&[
                ("SLURM_LOCALID", "0"),
                ("SLURM_NODEID", "2"),
                ("SLURM_TASKS_PER_NODE", "4(x2),3"),
            ]),
        )
        .unwrap();
        assert_eq!(topo.size, 3);
    }

    #[test]
    fn slurm_node_past_the_list() {
        let err = LocalTopology::from_lookup(
            Launcher::Slurm,
            vars(&[
                ("SLURM_LOCALID", "0"),
                ("SLURM_NODEID", "3"),
                ("SLURM_TASKS_PER_NODE", "4(x2),3"),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::NodeOutOfRange {
                var: "SLURM_TASKS_PER_NODE",
                node: 3,
                nodes: 3
            }
        );
    }

    #[test]
    fn slurm_fallback_needs_node_id() {
        let err = LocalTopology::from_lookup(
            Launcher::Slurm,
            vars(&[("SLURM_LOCALID", "0"), ("SLURM_TASKS_PER_NODE", "2,4")]),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "SLURM_NODEID" });
    }

    #[test]
    fn slurm_malformed_repeat() {
        let err = LocalTopology::from_lookup(
            Launcher::Slurm,
            vars(&[
                ("SLURM_LOCALID", "0"),
                ("SLURM_NODEID", "0"),
                ("SLURM_TASKS_PER_NODE", "4(xtwo)"),
            ]),
        )
        .unwrap_err();
        match err {
            ConfigError::Malformed { var, value, .. } => {
                assert_eq!(var, "SLURM_TASKS_PER_NODE");
                assert_eq!(value, "4(xtwo)");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn explicit_launcher_ignores_others() {
        let err = LocalTopology::from_lookup(
            Launcher::Slurm,
            vars(&[
                ("OMPI_COMM_WORLD_LOCAL_RANK", "0"),
                ("OMPI_COMM_WORLD_LOCAL_SIZE", "1"),
            ]),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "SLURM_LOCALID" });
    }
}
