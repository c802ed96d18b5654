//! Container runtime integration
//!
//! Thin wrapper over the Docker Engine API on the local socket. Every call is
//! a single request (or a short fixed sequence for exec) with no retries;
//! callers decide whether a failure aborts their step.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    NetworkingConfig, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, EndpointSettings};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::error::{AgentError, Result};
use crate::utils::DOCKER_TIMEOUT_SECS;

/// Fields the runtime assigns to a network; they cannot be replayed on create
const NETWORK_RUNTIME_FIELDS: &[&str] = &["Id", "Created", "Scope", "Containers", "IPAM"];

/// Operations the pipelines need from the container runtime
///
/// Container and network references are plain names or ids, resolved by the
/// runtime on every call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run `command` inside `container` and wait for it to exit
    ///
    /// The command is split on whitespace: quoting is not understood, so
    /// arguments must not contain spaces.
    async fn exec(&self, container: &str, command: &str) -> Result<()>;

    async fn start(&self, container: &str) -> Result<()>;

    /// Stopping an already stopped container succeeds
    async fn stop(&self, container: &str) -> Result<()>;

    async fn restart(&self, container: &str) -> Result<()>;

    /// Stream `src` out of the container as a tar archive into the host file `dest`
    async fn copy_from_container(&self, container: &str, src: &str, dest: &Path) -> Result<()>;

    /// Unpack the host tar archive `src` into `dest` inside the container
    ///
    /// The archive is read into memory in full and sent as one request body,
    /// not streamed, so it should stay small.
    async fn copy_to_container(&self, container: &str, src: &Path, dest: &str) -> Result<()>;

    /// Save the container's inspect document to `<dest_dir>/<container>.json`
    ///
    /// The document is decoded into bollard's typed model and written back
    /// from it, so fields the model does not know are dropped.
    async fn inspect_container(&self, container: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Save the network's inspect document to `<dest_dir>/<network>.json`
    ///
    /// Goes through bollard's typed model like [`Self::inspect_container`].
    async fn inspect_network(&self, network: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Recreate a container from a saved inspect document, returning its name
    ///
    /// When `network_id` is given every endpoint is rewired onto it.
    async fn create_container_from_inspect(
        &self,
        inspect: &Path,
        network_id: Option<String>,
    ) -> Result<String>;

    /// Recreate a network from a saved inspect document, returning the new id
    async fn create_network_from_inspect(&self, inspect: &Path) -> Result<String>;
}

/// Split an exec command line into its argument vector
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Drop runtime-assigned fields from a network inspect document
pub fn strip_network_runtime_fields(doc: &mut Value) {
    if let Some(obj) = doc.as_object_mut() {
        for field in NETWORK_RUNTIME_FIELDS {
            obj.remove(*field);
        }
    }
}

fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Build the create request for a network from its (stripped) inspect document
pub fn network_options_from_inspect(doc: &Value) -> Result<CreateNetworkOptions<String>> {
    let name = doc
        .get("Name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AgentError::NotFound("network inspect document has no Name".to_string()))?;

    Ok(CreateNetworkOptions {
        name: name.to_string(),
        driver: doc
            .get("Driver")
            .and_then(|d| d.as_str())
            .unwrap_or("bridge")
            .to_string(),
        internal: doc.get("Internal").and_then(|v| v.as_bool()).unwrap_or(false),
        attachable: doc.get("Attachable").and_then(|v| v.as_bool()).unwrap_or(false),
        enable_ipv6: doc.get("EnableIPv6").and_then(|v| v.as_bool()).unwrap_or(false),
        options: string_map(doc.get("Options")),
        labels: string_map(doc.get("Labels")),
        ..Default::default()
    })
}

/// Build the create request for a container from its inspect document
///
/// Returns the container name (without the leading slash), the image to
/// pull and the creation config.
pub fn container_config_from_inspect(
    inspect: ContainerInspectResponse,
    network_id: Option<&str>,
) -> Result<(String, String, Config<String>)> {
    let name = inspect
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AgentError::NotFound("container inspect document has no Name".to_string()))?;

    let container_config = inspect.config.unwrap_or_default();
    let image = container_config
        .image
        .clone()
        .ok_or_else(|| AgentError::NotFound(format!("no image recorded for container {}", name)))?;

    // Endpoint ids, addresses and gateways belong to the old host; keep
    // only what describes the attachment itself
    let endpoints: HashMap<String, EndpointSettings> = inspect
        .network_settings
        .and_then(|ns| ns.networks)
        .unwrap_or_default()
        .into_iter()
        .map(|(network, old)| {
            let settings = EndpointSettings {
                aliases: old.aliases,
                links: old.links,
                network_id: network_id.map(str::to_string).or(old.network_id),
                ..Default::default()
            };
            (network, settings)
        })
        .collect();

    let config = Config {
        image: Some(image.clone()),
        env: container_config.env,
        cmd: container_config.cmd,
        entrypoint: container_config.entrypoint,
        labels: container_config.labels,
        working_dir: container_config.working_dir,
        user: container_config.user,
        host_config: inspect.host_config,
        networking_config: Some(NetworkingConfig {
            endpoints_config: endpoints,
        }),
        ..Default::default()
    };

    Ok((name, image, config))
}

async fn read_document(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AgentError::NotFound(format!("inspect document {}", path.display()))
        } else {
            AgentError::io(format!("reading {}", path.display()), e)
        }
    })
}

/// Serialized form of a typed inspect model
fn encode_document<T: Serialize>(id: &str, inspect: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(inspect)
        .map_err(|e| AgentError::Config(format!("encoding inspect of {}: {}", id, e)))
}

/// The whole archive, as the upload API in this client version takes one body
async fn upload_body(src: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(src)
        .await
        .map_err(|e| AgentError::io(format!("reading {}", src.display()), e))
}

async fn write_document(dest_dir: &Path, id: &str, body: Vec<u8>) -> Result<PathBuf> {
    let path = dest_dir.join(format!("{}.json", id));
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| AgentError::io(format!("writing {}", path.display()), e))?;
    Ok(path)
}

/// Map a stop call's result, treating "not modified" as already stopped
///
/// bollard answers 304 with `Ok` itself; the arm covers engines or proxies
/// that still surface it as an error.
fn stop_outcome(container: &str, result: std::result::Result<(), bollard::errors::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => {
            debug!(container, "container already stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the runtime's control socket
    ///
    /// Dumps can take minutes, so the read timeout is long.
    pub fn connect(socket: &str) -> Result<Self> {
        let docker =
            Docker::connect_with_unix(socket, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn exec(&self, container: &str, command: &str) -> Result<()> {
        let cmd = split_command(command);
        let program = cmd.first().cloned().unwrap_or_default();
        // Arguments may carry credentials, only the program is logged
        info!(container, program = %program, "executing command");

        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    attach_stdin: Some(false),
                    attach_stdout: Some(false),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await?;

        // Attached start blocks until the command exits
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                if let LogOutput::StdErr { message } = chunk? {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        match inspect.exit_code {
            Some(0) => Ok(()),
            code => {
                let code = code.unwrap_or(-1);
                warn!(container, program = %program, code, "command failed");
                Err(AgentError::CommandFailed {
                    container: container.to_string(),
                    program,
                    code,
                    stderr: stderr.trim().to_string(),
                })
            }
        }
    }

    async fn start(&self, container: &str) -> Result<()> {
        info!(container, "starting container");
        self.docker
            .start_container(container, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        info!(container, "stopping container");
        let result = self
            .docker
            .stop_container(container, Some(StopContainerOptions { t: 10 }))
            .await;
        stop_outcome(container, result)
    }

    async fn restart(&self, container: &str) -> Result<()> {
        info!(container, "restarting container");
        self.docker
            .restart_container(container, Some(RestartContainerOptions { t: 10 }))
            .await?;
        Ok(())
    }

    async fn copy_from_container(&self, container: &str, src: &str, dest: &Path) -> Result<()> {
        info!(container, src, dest = %dest.display(), "copying from container");

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| AgentError::io(format!("creating {}", dest.display()), e))?;

        let mut stream = Box::pin(self.docker.download_from_container(
            container,
            Some(DownloadFromContainerOptions {
                path: src.to_string(),
            }),
        ));

        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?)
                .await
                .map_err(|e| AgentError::io(format!("writing {}", dest.display()), e))?;
        }
        file.flush()
            .await
            .map_err(|e| AgentError::io(format!("flushing {}", dest.display()), e))?;

        Ok(())
    }

    async fn copy_to_container(&self, container: &str, src: &Path, dest: &str) -> Result<()> {
        info!(container, src = %src.display(), dest, "copying to container");

        let body = upload_body(src).await?;

        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: dest.to_string(),
                    ..Default::default()
                }),
                body.into(),
            )
            .await?;

        Ok(())
    }

    async fn inspect_container(&self, container: &str, dest_dir: &Path) -> Result<PathBuf> {
        debug!(container, "inspecting container");
        let inspect = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await?;
        write_document(dest_dir, container, encode_document(container, &inspect)?).await
    }

    async fn inspect_network(&self, network: &str, dest_dir: &Path) -> Result<PathBuf> {
        debug!(network, "inspecting network");
        let inspect = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await?;
        write_document(dest_dir, network, encode_document(network, &inspect)?).await
    }

    async fn create_container_from_inspect(
        &self,
        inspect: &Path,
        network_id: Option<String>,
    ) -> Result<String> {
        let raw = read_document(inspect).await?;
        let doc: ContainerInspectResponse = serde_json::from_slice(&raw).map_err(|e| {
            AgentError::Config(format!("invalid inspect document {}: {}", inspect.display(), e))
        })?;

        let (name, image, config) = container_config_from_inspect(doc, network_id.as_deref())?;
        self.pull_image(&image).await?;

        info!(container = %name, image = %image, "creating container from inspect");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await?;

        Ok(name)
    }

    async fn create_network_from_inspect(&self, inspect: &Path) -> Result<String> {
        let raw = read_document(inspect).await?;
        let mut doc: Value = serde_json::from_slice(&raw).map_err(|e| {
            AgentError::Config(format!("invalid inspect document {}: {}", inspect.display(), e))
        })?;
        strip_network_runtime_fields(&mut doc);

        let options = network_options_from_inspect(&doc)?;
        info!(network = %options.name, "creating network from inspect");
        let response = self.docker.create_network(options).await?;

        // Read the id back through the serialized form of the response
        serde_json::to_value(&response)
            .ok()
            .and_then(|v| v.get("Id").and_then(|id| id.as_str()).map(str::to_string))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AgentError::Protocol {
                status: 201,
                body: "network created without an id".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_command_on_whitespace() {
        assert_eq!(
            split_command("  mongodump --archive=/data/db/x.gz   --gzip "),
            vec!["mongodump", "--archive=/data/db/x.gz", "--gzip"]
        );
        // Quotes are not interpreted
        assert_eq!(split_command("sh -c \"a b\"").len(), 4);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn test_stopping_a_stopped_container_succeeds() {
        assert!(stop_outcome("mongodb", Ok(())).is_ok());

        let not_modified = bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        assert!(stop_outcome("mongodb", Err(not_modified)).is_ok());

        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: mongodb".to_string(),
        };
        match stop_outcome("mongodb", Err(missing)) {
            Err(AgentError::Protocol { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_inspect_documents_keep_only_modelled_fields() {
        let raw = json!({
            "Id": "0123abcd",
            "Name": "/alice-plugin",
            "Config": {"Image": "thinger/plugin:1.0"},
            "FutureEngineField": {"enabled": true}
        });
        let inspect: ContainerInspectResponse = serde_json::from_value(raw).unwrap();
        let encoded = encode_document("alice-plugin", &inspect).unwrap();
        let saved: Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(saved["Name"], "/alice-plugin");
        assert_eq!(saved["Config"]["Image"], "thinger/plugin:1.0");
        assert!(saved.get("FutureEngineField").is_none());
    }

    #[tokio::test]
    async fn test_upload_body_is_the_whole_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("dump.tar");
        let data: Vec<u8> = (0..3 * 1024 * 1024).map(|b| (b % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        assert_eq!(upload_body(&src).await.unwrap(), data);
        assert!(matches!(
            upload_body(&dir.path().join("missing.tar")).await,
            Err(AgentError::Io { .. })
        ));
    }

    #[test]
    fn test_network_runtime_fields_are_stripped() {
        let mut doc = json!({
            "Name": "alice",
            "Id": "0123abcd",
            "Created": "2024-01-01T00:00:00Z",
            "Scope": "local",
            "Driver": "bridge",
            "EnableIPv6": false,
            "IPAM": {"Driver": "default"},
            "Internal": true,
            "Attachable": false,
            "Containers": {"abc": {"Name": "alice-plugin"}},
            "Options": {"com.docker.network.bridge.enable_icc": "true"},
            "Labels": {"owner": "alice"}
        });
        strip_network_runtime_fields(&mut doc);

        for field in NETWORK_RUNTIME_FIELDS {
            assert!(doc.get(*field).is_none(), "{} left behind", field);
        }

        let options = network_options_from_inspect(&doc).unwrap();
        assert_eq!(options.name, "alice");
        assert_eq!(options.driver, "bridge");
        assert!(options.internal);
        assert_eq!(options.labels.get("owner").map(String::as_str), Some("alice"));
        assert_eq!(options.options.len(), 1);
    }

    #[test]
    fn test_network_without_name_is_rejected() {
        let doc = json!({"Driver": "bridge"});
        assert!(matches!(
            network_options_from_inspect(&doc),
            Err(AgentError::NotFound(_))
        ));
    }

    #[test]
    fn test_container_config_rewires_network() {
        let inspect: ContainerInspectResponse = serde_json::from_value(json!({
            "Name": "/alice-weather",
            "Config": {
                "Image": "plugins/weather:1.2",
                "Env": ["MODE=prod"],
                "Cmd": ["run"]
            },
            "HostConfig": {"NetworkMode": "alice"},
            "NetworkSettings": {
                "Networks": {
                    "alice": {
                        "NetworkID": "old-id",
                        "EndpointID": "old-endpoint",
                        "IPAddress": "172.18.0.2",
                        "Aliases": ["weather"]
                    }
                }
            }
        }))
        .unwrap();

        let (name, image, config) = container_config_from_inspect(inspect, Some("new-id")).unwrap();
        assert_eq!(name, "alice-weather");
        assert_eq!(image, "plugins/weather:1.2");
        assert_eq!(config.env, Some(vec!["MODE=prod".to_string()]));

        let endpoints = config.networking_config.unwrap().endpoints_config;
        let alice = endpoints.get("alice").unwrap();
        assert_eq!(alice.network_id.as_deref(), Some("new-id"));
        assert_eq!(alice.endpoint_id, None);
        assert_eq!(alice.ip_address, None);
        assert_eq!(alice.aliases, Some(vec!["weather".to_string()]));
    }

    #[test]
    fn test_container_config_keeps_network_without_rewire() {
        let inspect: ContainerInspectResponse = serde_json::from_value(json!({
            "Name": "/bob-sync",
            "Config": {"Image": "plugins/sync"},
            "NetworkSettings": {"Networks": {"bob": {"NetworkID": "kept"}}}
        }))
        .unwrap();

        let (_, _, config) = container_config_from_inspect(inspect, None).unwrap();
        let endpoints = config.networking_config.unwrap().endpoints_config;
        assert_eq!(endpoints["bob"].network_id.as_deref(), Some("kept"));
    }

    #[test]
    fn test_container_without_image_is_rejected() {
        let inspect: ContainerInspectResponse =
            serde_json::from_value(json!({"Name": "/ghost", "Config": {}})).unwrap();
        assert!(container_config_from_inspect(inspect, None).is_err());
    }
}
