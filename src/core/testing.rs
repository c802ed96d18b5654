//! Recording container runtime for pipeline tests
//!
//! Commands that would write into a container's mounted data directory
//! write into the matching host directory instead, so the pipelines see the
//! same files they would on a real deployment.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::docker::{split_command, ContainerRuntime};
use crate::core::error::{AgentError, Result};
use crate::utils::{AgentConfig, PRIMARY_DATABASE_MOUNT, TIMESERIES_MOUNT};

pub const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exec { container: String, command: String },
    Start(String),
    Stop(String),
    Restart(String),
    CopyFrom { container: String, src: String },
    CopyTo { container: String, dest: String },
    InspectContainer(String),
    InspectNetwork(String),
    CreateContainer { inspect: PathBuf, network_id: Option<String> },
    CreateNetwork(PathBuf),
}

struct Mount {
    container: String,
    inside: String,
    host: PathBuf,
}

pub struct FakeRuntime {
    calls: Mutex<Vec<Call>>,
    mounts: Vec<Mount>,
    dump_size: usize,
    failing: HashSet<(String, String)>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            mounts: Vec::new(),
            dump_size: 1024,
            failing: HashSet::new(),
        }
    }

    /// Map `inside` in `container` onto the host directory `host`
    pub fn mount(mut self, container: &str, inside: &str, host: &Path) -> Self {
        self.mounts.push(Mount {
            container: container.to_string(),
            inside: inside.trim_end_matches('/').to_string(),
            host: host.to_path_buf(),
        });
        self
    }

    pub fn dump_size(mut self, bytes: usize) -> Self {
        self.dump_size = bytes;
        self
    }

    /// Make every exec of `program` in `container` exit non-zero
    pub fn fail(mut self, container: &str, program: &str) -> Self {
        self.failing
            .insert((container.to_string(), program.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Restart(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn execs(&self, container: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec { container: c, command } if c == container => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn host_path(&self, container: &str, inside: &str) -> Option<PathBuf> {
        self.mounts
            .iter()
            .filter(|m| m.container == container)
            .find_map(|m| {
                let rest = inside.strip_prefix(&m.inside)?;
                Some(m.host.join(rest.trim_start_matches('/')))
            })
    }
}

fn write_document(dest_dir: &Path, id: &str, doc: serde_json::Value) -> Result<PathBuf> {
    let path = dest_dir.join(format!("{}.json", id));
    fs::write(&path, doc.to_string()).map_err(|e| AgentError::io("write inspect", e))?;
    Ok(path)
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn exec(&self, container: &str, command: &str) -> Result<()> {
        self.record(Call::Exec {
            container: container.to_string(),
            command: command.to_string(),
        });

        let argv = split_command(command);
        let program = argv.first().cloned().unwrap_or_default();
        if self.failing.contains(&(container.to_string(), program.clone())) {
            return Err(AgentError::CommandFailed {
                container: container.to_string(),
                program,
                code: 1,
                stderr: "simulated failure".to_string(),
            });
        }

        match program.as_str() {
            "mongodump" => {
                let target = argv
                    .iter()
                    .find_map(|arg| arg.strip_prefix("--archive="))
                    .and_then(|inside| self.host_path(container, inside));
                if let Some(path) = target {
                    let data: Vec<u8> = (0..self.dump_size).map(|i| (i % 241) as u8).collect();
                    std::fs::write(&path, data).map_err(|e| AgentError::io("fake dump", e))?;
                }
            }
            "influx" | "influxd" if argv.get(1).map(String::as_str) == Some("backup") => {
                let target = argv
                    .iter()
                    .filter(|arg| arg.starts_with('/'))
                    .find_map(|inside| self.host_path(container, inside));
                if let Some(dir) = target {
                    std::fs::create_dir_all(&dir).map_err(|e| AgentError::io("fake dump", e))?;
                    std::fs::write(dir.join("20240101T000000Z.manifest"), b"{}")
                        .map_err(|e| AgentError::io("fake dump", e))?;
                }
            }
            "rm" => {
                for inside in argv.iter().filter(|arg| arg.starts_with('/')) {
                    if let Some(path) = self.host_path(container, inside) {
                        if path.is_dir() {
                            let _ = std::fs::remove_dir_all(&path);
                        } else {
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.record(Call::Start(container.to_string()));
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.record(Call::Stop(container.to_string()));
        Ok(())
    }

    async fn restart(&self, container: &str) -> Result<()> {
        self.record(Call::Restart(container.to_string()));
        Ok(())
    }

    async fn copy_from_container(&self, container: &str, src: &str, _dest: &Path) -> Result<()> {
        self.record(Call::CopyFrom {
            container: container.to_string(),
            src: src.to_string(),
        });
        Ok(())
    }

    async fn copy_to_container(&self, container: &str, _src: &Path, dest: &str) -> Result<()> {
        self.record(Call::CopyTo {
            container: container.to_string(),
            dest: dest.to_string(),
        });
        Ok(())
    }

    async fn inspect_container(&self, container: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.record(Call::InspectContainer(container.to_string()));
        write_document(
            dest_dir,
            container,
            serde_json::json!({ "Name": format!("/{}", container) }),
        )
    }

    async fn inspect_network(&self, network: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.record(Call::InspectNetwork(network.to_string()));
        write_document(dest_dir, network, serde_json::json!({ "Name": network }))
    }

    async fn create_container_from_inspect(
        &self,
        inspect: &Path,
        network_id: Option<String>,
    ) -> Result<String> {
        self.record(Call::CreateContainer {
            inspect: inspect.to_path_buf(),
            network_id,
        });
        Ok(stem(inspect))
    }

    async fn create_network_from_inspect(&self, inspect: &Path) -> Result<String> {
        self.record(Call::CreateNetwork(inspect.to_path_buf()));
        Ok(format!("net-{}", stem(inspect)))
    }
}

pub const TAG: &str = "2024-01-01T00:00:00Z";

pub const COMPOSE: &str = "services:\n  mongodb:\n    environment:\n      \
    - MONGO_INITDB_ROOT_USERNAME=thinger\n      - MONGO_INITDB_ROOT_PASSWORD=pw123\n  \
    influxdb2:\n    environment:\n      - DOCKER_INFLUXDB_INIT_ADMIN_TOKEN=tok\n";

pub fn config_for(root: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.backups.system = "platform".to_string();
    config.backups.data_path = root.join("data");
    config.backups.compose_path = root.to_path_buf();
    config.device.hostname = Some("edge".to_string());
    // Nothing listens on the discard port
    config.platform.timeseries_ping_url = "http://127.0.0.1:9/ping".to_string();
    config
}

/// 25 MiB of application data spread over two users
pub fn seed_platform(root: &Path) -> AgentConfig {
    let config = config_for(root);
    let app = config.backups.data_path.join("thinger");
    for (i, user) in ["alice", "bob"].iter().enumerate() {
        let dir = app.join("users").join(user).join("devices");
        fs::create_dir_all(&dir).unwrap();
        let size = if i == 0 { 15 * MIB } else { 10 * MIB };
        let data: Vec<u8> = (0..size).map(|b| (b % 253) as u8).collect();
        fs::write(dir.join("history.bin"), data).unwrap();
    }
    fs::create_dir_all(app.join("certificates")).unwrap();
    fs::write(app.join("certificates").join("server.pem"), b"PEM").unwrap();
    fs::create_dir_all(config.backups.data_path.join("mongodb")).unwrap();
    fs::create_dir_all(config.backups.data_path.join("influxdb2")).unwrap();
    fs::write(root.join("docker-compose.yml"), COMPOSE).unwrap();
    config
}

pub fn fake_for(config: &AgentConfig) -> FakeRuntime {
    let data = &config.backups.data_path;
    FakeRuntime::new()
        .mount("mongodb", PRIMARY_DATABASE_MOUNT, &data.join("mongodb"))
        .mount("influxdb2", TIMESERIES_MOUNT, &data.join("influxdb2"))
        .mount("thinger", "/data", &data.join("thinger"))
}
