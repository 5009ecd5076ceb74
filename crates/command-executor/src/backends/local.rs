//! Local process execution backend

use async_process::{Child, Stdio};
use async_trait::async_trait;
use futures::stream::Stream;
use futures_lite::io::{AsyncBufReadExt, BufReader, Split};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{ProcessEvent, ProcessEventType};
use crate::launcher::Launcher;
use crate::process::{ExitStatus, ProcessHandle};
use crate::target::Target;

/// Launcher for executing processes locally
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

/// A handle to control a local process; dropping it kills the process
pub struct LocalProcessHandle {
    child: Child,
}

/// Stream of process events: `Started`, then stdout/stderr lines until both close
pub struct ProcessEventStream {
    stdout: Option<Split<BufReader<async_process::ChildStdout>>>,
    stderr: Option<Split<BufReader<async_process::ChildStderr>>>,
    started_sent: bool,
    child_id: u32,
}

#[async_trait]
impl Launcher for LocalLauncher {
    type Target = Target;
    type EventStream = ProcessEventStream;
    type Handle = LocalProcessHandle;

    async fn launch(
        &self,
        target: &Self::Target,
        command: Command,
    ) -> Result<(Self::EventStream, Self::Handle)> {
        match target {
            Target::Command => spawn(&command),
        }
    }
}

fn spawn(command: &Command) -> Result<(ProcessEventStream, LocalProcessHandle)> {
    trace!(command = %command, "spawning local process");

    let mut async_cmd = command.prepare();
    async_cmd.stdin(Stdio::null());
    async_cmd.stdout(Stdio::piped());
    async_cmd.stderr(Stdio::piped());

    let mut child = async_cmd
        .spawn()
        .map_err(|e| Error::from_spawn(command.get_program(), e))?;

    let child_id = child.id();
    let stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
    let stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));

    let events = ProcessEventStream {
        stdout,
        stderr,
        started_sent: false,
        child_id,
    };
    let handle = LocalProcessHandle { child };

    Ok((events, handle))
}

#[async_trait]
impl ProcessHandle for LocalProcessHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .status()
            .await
            .map_err(|e| Error::spawn_failed(format!("Failed to wait for process: {}", e)))?;

        Ok(ExitStatus {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
            #[cfg(not(unix))]
            signal: None,
        })
    }

    async fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            signal::kill(pid, Signal::SIGTERM)
                .map_err(|e| Error::signal_failed(15, e.to_string()))?;
        }

        #[cfg(not(unix))]
        {
            self.child
                .kill()
                .map_err(|e| Error::signal_failed(-1, e.to_string()))?;
        }

        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .map_err(|e| Error::signal_failed(9, e.to_string()))
    }
}

impl Drop for LocalProcessHandle {
    fn drop(&mut self) {
        // Already-exited children just return an error here
        let _ = self.child.kill();
    }
}

/// Invalid UTF-8 is replaced, never treated as end of stream
fn decode_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(line) => line,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl Stream for ProcessEventStream {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.started_sent {
            self.started_sent = true;
            let event = ProcessEvent::new(ProcessEventType::Started { pid: self.child_id });
            return Poll::Ready(Some(event));
        }

        if let Some(stdout) = &mut self.stdout {
            match Pin::new(stdout).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    return Poll::Ready(Some(ProcessEvent::new_with_data(
                        ProcessEventType::Stdout,
                        decode_line(line),
                    )));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stdout = None;
                }
                Poll::Pending => {}
            }
        }

        if let Some(stderr) = &mut self.stderr {
            match Pin::new(stderr).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    return Poll::Ready(Some(ProcessEvent::new_with_data(
                        ProcessEventType::Stderr,
                        decode_line(line),
                    )));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stderr = None;
                }
                Poll::Pending => {}
            }
        }

        if self.stdout.is_none() && self.stderr.is_none() {
            return Poll::Ready(None);
        }

        Poll::Pending
    }
}
