use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error_handling::types::SandboxError;
use crate::sandbox::scripts;
use crate::sandbox::types::{ExecAttachOptions, OutputChunk};

/// Handle to one operator's sandbox container.
///
/// Cheap to clone; all operations go through the shared Docker
/// client. The container itself is created by the manager, this type
/// only drives an existing one.
#[derive(Clone)]
pub struct Sandbox {
    docker: Docker,
    name: String,
}

impl Sandbox {
    pub fn new(docker: Docker, name: String) -> Self {
        Self { docker, name }
    }

    pub fn container_name(&self) -> &str {
        &self.name
    }

    pub async fn start(&self) -> Result<(), SandboxError> {
        self.docker
            .start_container::<String>(&self.name, None)
            .await
            .map_err(|e| SandboxError::StartFailed(e.to_string()))
    }

    /// Runs the one-time key generation script.
    pub async fn generate_ssh_key(&self) -> Result<(), SandboxError> {
        let (_, stderr) = self.exec_script(scripts::GENERATE_SSH_KEY).await?;
        if !stderr.is_empty() {
            debug!("key generation stderr for {}: {}", self.name, stderr.trim());
        }
        Ok(())
    }

    pub async fn get_ssh_public_key(&self) -> Result<String, SandboxError> {
        let (stdout, _) = self.exec_script("cat /root/.ssh/id_rsa.pub").await?;
        Ok(stdout.trim().to_string())
    }

    /// Runs a script to completion and returns collected
    /// (stdout, stderr).
    pub async fn exec_script(&self, script: &str) -> Result<(String, String), SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec![
                        "/bin/bash".to_string(),
                        "-c".to_string(),
                        script.to_string(),
                    ]),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(item) = output.next().await {
                    match item {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            stdout.extend_from_slice(&message)
                        }
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::ExecFailed(
                    "script exec started detached".to_string(),
                ))
            }
        }
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    /// Attaches a single interactive exec to the container.
    ///
    /// Stdin arrives over `stdin_rx` (dropping the sender closes the
    /// process stdin), demultiplexed output flows out through
    /// `out_tx`, and window updates are applied through the watch in
    /// `opts` with the current value applied before the process sees
    /// any input. Resolves when the exec finishes or the output
    /// stream breaks.
    pub async fn exec_attach(
        &self,
        opts: ExecAttachOptions,
        mut stdin_rx: mpsc::Receiver<Vec<u8>>,
        out_tx: mpsc::Sender<OutputChunk>,
    ) -> Result<(), SandboxError> {
        let mut env = opts.env;
        if let Some(term) = &opts.term {
            env.push(format!("TERM={}", term));
        }
        let command = if opts.command.is_empty() {
            vec!["/bin/bash".to_string()]
        } else {
            opts.command
        };

        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(opts.is_pty),
                    env: Some(env),
                    cmd: Some(command),
                    ..Default::default()
                },
            )
            .await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                if let Some(mut window_rx) = opts.window {
                    let initial = *window_rx.borrow();
                    self.resize_exec(&exec.id, initial).await;
                    let docker = self.docker.clone();
                    let exec_id = exec.id.clone();
                    tokio::spawn(async move {
                        while window_rx.changed().await.is_ok() {
                            let window = *window_rx.borrow();
                            if let Err(e) = docker
                                .resize_exec(
                                    &exec_id,
                                    ResizeExecOptions {
                                        width: window.width as u16,
                                        height: window.height as u16,
                                    },
                                )
                                .await
                            {
                                debug!("resize of exec {} failed: {}", exec_id, e);
                            }
                        }
                    });
                }

                let stdin_task = tokio::spawn(async move {
                    while let Some(data) = stdin_rx.recv().await {
                        if input.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    let _ = input.shutdown().await;
                });

                let mut result = Ok(());
                while let Some(item) = output.next().await {
                    match item {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            if out_tx
                                .send(OutputChunk::Stdout(message.to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            if out_tx
                                .send(OutputChunk::Stderr(message.to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            result = Err(e.into());
                            break;
                        }
                    }
                }
                stdin_task.abort();
                result
            }
            StartExecResults::Detached => Err(SandboxError::ExecFailed(
                "interactive exec started detached".to_string(),
            )),
        }
    }

    async fn resize_exec(&self, exec_id: &str, window: crate::sandbox::types::Window) {
        if window.width == 0 || window.height == 0 {
            return;
        }
        if let Err(e) = self
            .docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    width: window.width as u16,
                    height: window.height as u16,
                },
            )
            .await
        {
            warn!("initial resize of exec {} failed: {}", exec_id, e);
        }
    }
}
