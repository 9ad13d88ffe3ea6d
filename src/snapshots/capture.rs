use crate::errors::CaptureError;
use anyhow::{Context, Error, anyhow};
use async_trait::async_trait;
use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{fs, io::AsyncReadExt, process::Command, time};

// Still-image capture seam. The production implementation shells out to
// ffmpeg; tests plug in stubs.
#[async_trait]
pub trait Capturer: Send + Sync + fmt::Debug {
    async fn capture_rtsp(
        &self,
        url: &str,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), Error>;

    async fn capture_device(
        &self,
        device: &str,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), Error>;
}

#[derive(Debug)]
pub struct FfmpegCapturer {
    binary: PathBuf,
}
impl FfmpegCapturer {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("/usr/bin/ffmpeg"),
        }
    }

    fn build_command_rtsp(
        &self,
        url: &str,
        output: &Path,
    ) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .env_clear()
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // global options
            .args(["-loglevel", "error"])
            .arg("-hide_banner")
            .arg("-nostats")
            .arg("-nostdin")
            // input options
            .args(["-f", "rtsp"])
            .args(["-rtsp_transport", "tcp"])
            .args(["-i", url])
            // output options
            .args(["-frames:v", "1"])
            .arg("-y")
            .arg(output.as_os_str());
        command
    }
    fn build_command_device(
        &self,
        device: &str,
        output: &Path,
    ) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .env_clear()
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .args(["-loglevel", "error"])
            .arg("-hide_banner")
            .arg("-nostats")
            .arg("-nostdin")
            .args(["-f", "v4l2"])
            .args(["-i", device])
            .args(["-frames:v", "1"])
            .arg("-y")
            .arg(output.as_os_str());
        command
    }

    async fn run(
        &self,
        mut command: Command,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), Error> {
        let command_line = format!("{command:?}");

        let mut child = command.spawn().context("spawn")?;

        let mut stderr_pipe = child.stderr.take().unwrap();
        let stderr_reader = async {
            let mut stderr = String::new();
            let _ = stderr_pipe.read_to_string(&mut stderr).await;
            stderr
        };

        let (exit, stderr) = match time::timeout(
            timeout,
            futures::future::join(child.wait(), stderr_reader),
        )
        .await
        {
            Ok((exit, stderr)) => (exit.context("wait")?, stderr),
            Err(_elapsed) => {
                let _ = child.start_kill();
                let _ = child.wait().await;

                return Err(CaptureError {
                    command: command_line,
                    exit_code: None,
                    stderr: "capture timed out".to_owned(),
                }
                .into());
            }
        };

        if !exit.success() {
            return Err(CaptureError {
                command: command_line,
                exit_code: exit.code(),
                stderr,
            }
            .into());
        }

        // an empty output counts as a failed attempt
        let metadata = fs::metadata(output).await.context("metadata")?;
        if metadata.len() == 0 {
            return Err(anyhow!("capture produced an empty file: {:?}", output));
        }

        Ok(())
    }
}
#[async_trait]
impl Capturer for FfmpegCapturer {
    async fn capture_rtsp(
        &self,
        url: &str,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), Error> {
        let command = self.build_command_rtsp(url, output);
        self.run(command, output, timeout).await
    }

    async fn capture_device(
        &self,
        device: &str,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), Error> {
        let command = self.build_command_device(device, output);
        self.run(command, output, timeout).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_command_shape() {
        let capturer = FfmpegCapturer::new();
        let command = capturer.build_command_rtsp(
            "rtsp://127.0.0.1:8554/camera0",
            Path::new("/tmp/out.jpg"),
        );

        let rendered = format!("{command:?}");
        assert!(rendered.contains("rtsp://127.0.0.1:8554/camera0"));
        assert!(rendered.contains("-frames:v"));
        assert!(rendered.contains("rtsp_transport"));
    }

    #[test]
    fn device_command_shape() {
        let capturer = FfmpegCapturer::new();
        let command =
            capturer.build_command_device("/dev/video0", Path::new("/tmp/out.jpg"));

        let rendered = format!("{command:?}");
        assert!(rendered.contains("v4l2"));
        assert!(rendered.contains("/dev/video0"));
    }
}
