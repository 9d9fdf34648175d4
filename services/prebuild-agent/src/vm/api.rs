//! Control-plane client for a single VMM instance.
//!
//! Firecracker exposes its configuration API on a per-instance Unix
//! socket. This agent only ever issues PUTs: resource configuration
//! before boot, then an `InstanceStart` or `SendCtrlAltDel` action.

use std::path::{Path, PathBuf};

use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::fc_config::{BootSource, DriveConfig, MachineConfig, NetworkInterface};

/// Errors talking to the VMM control socket.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("encoding request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("building request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("VMM rejected {path} with {status}: {fault}")]
    Rejected {
        path: String,
        status: StatusCode,
        fault: String,
    },
}

/// Client bound to one instance's control socket.
pub struct FirecrackerClient {
    socket: PathBuf,
    http: Client<UnixConnector>,
}

impl FirecrackerClient {
    pub fn new<P: AsRef<Path>>(socket: P) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
            http: Client::unix(),
        }
    }

    /// Whether the control socket exists on disk.
    pub fn socket_exists(&self) -> bool {
        self.socket.exists()
    }

    /// Configure the machine (vCPUs, memory).
    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<(), ApiError> {
        self.put("/machine-config", config).await
    }

    /// Configure the boot source (kernel and boot args).
    pub async fn put_boot_source(&self, config: &BootSource) -> Result<(), ApiError> {
        self.put("/boot-source", config).await
    }

    /// Attach or update a drive.
    pub async fn put_drive(&self, config: &DriveConfig) -> Result<(), ApiError> {
        self.put(&format!("/drives/{}", config.drive_id), config)
            .await
    }

    /// Attach or update a network interface.
    pub async fn put_network_interface(&self, config: &NetworkInterface) -> Result<(), ApiError> {
        self.put(&format!("/network-interfaces/{}", config.iface_id), config)
            .await
    }

    /// Boot the configured instance.
    pub async fn start_instance(&self) -> Result<(), ApiError> {
        self.action("InstanceStart").await
    }

    /// Ask the guest to shut down via the i8042 reset line.
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.action("SendCtrlAltDel").await
    }

    async fn action(&self, action_type: &'static str) -> Result<(), ApiError> {
        #[derive(Serialize)]
        struct InstanceAction {
            action_type: &'static str,
        }
        self.put("/actions", &InstanceAction { action_type }).await
    }

    /// The whole control surface this agent needs is idempotent PUTs.
    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        debug!(path, "VMM control request");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(Uri::new(&self.socket, path))
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(body)?))?;

        let response = self.http.request(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let fault = hyper::body::to_bytes(response.into_body()).await?;
        Err(ApiError::Rejected {
            path: path.to_string(),
            status,
            fault: String::from_utf8_lossy(&fault).to_string(),
        })
    }
}
