// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thin wrappers around the `docker` CLI for container lifecycle operations.
//! The container runtime is an external collaborator; everything here is
//! plain process exec with captured output.

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::EnvError;

/// Run one docker CLI command to completion and return its stdout.
pub async fn docker(args: &[&str], timeout: Duration) -> Result<String, EnvError> {
    debug!(?args, "docker");
    let output = tokio::time::timeout(
        timeout,
        Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| EnvError::Unreachable(format!("docker {} timed out", args.join(" "))))?
    .map_err(|e| EnvError::Unreachable(format!("docker not runnable: {e}")))?;

    if !output.status.success() {
        return Err(EnvError::Unreachable(format!(
            "docker {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// True when the image exists locally.
pub async fn image_exists(image: &str, timeout: Duration) -> bool {
    docker(&["image", "inspect", image], timeout).await.is_ok()
}

/// Pull an image; slow on first use, hence the caller-provided timeout.
pub async fn pull(image: &str, timeout: Duration) -> Result<(), EnvError> {
    docker(&["pull", image], timeout).await.map(|_| ())
}

/// Start a detached container that idles until removed.  Returns the name.
pub async fn start_container(image: &str, timeout: Duration) -> Result<String, EnvError> {
    let name = format!("swea-{}", uuid::Uuid::new_v4());
    docker(
        &[
            "run", "-d", "--name", &name, "-w", "/workspace", image, "sleep", "infinity",
        ],
        timeout,
    )
    .await?;
    Ok(name)
}

/// Copy a host path into the container.
pub async fn copy_in(
    container: &str,
    host_path: &std::path::Path,
    container_path: &str,
    timeout: Duration,
) -> Result<(), EnvError> {
    let src = host_path.to_string_lossy().into_owned();
    let dst = format!("{container}:{container_path}");
    docker(&["cp", &src, &dst], timeout).await.map(|_| ())
}

/// Persist a prepared container as a reusable image.
pub async fn commit(container: &str, tag: &str, timeout: Duration) -> Result<(), EnvError> {
    docker(&["commit", container, tag], timeout).await.map(|_| ())
}

/// Remove the container; best effort.
pub async fn remove(container: &str) {
    let _ = docker(&["rm", "-f", container], Duration::from_secs(30)).await;
}
