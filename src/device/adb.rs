//! Android debug bridge backend.

use anyhow::{anyhow, bail, Context, Result};
use image::ImageReader;
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use super::{Frame, FrameSource, InputInjector, Point};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// One tap of the launch-to-list navigation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavigationStep {
    pub x: i32,
    pub y: i32,
    /// Wait after the tap (milliseconds)
    pub delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb_path: PathBuf,
    serial: String,
}

/// Serial followed by a known connection state.
const DEVICE_LINE_PATTERN: &str =
    r"^(\S+)\s+(device|offline|unauthorized|recovery|sideload|bootloader)\b";

/// Parses `adb devices` output into `(serial, state)` pairs.
pub fn parse_device_list(output: &str) -> Result<Vec<(String, String)>> {
    let line_regex = Regex::new(DEVICE_LINE_PATTERN)?;
    Ok(output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            line_regex
                .captures(line.trim())
                .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        })
        .collect())
}

fn run(mut cmd: Command) -> Result<Output> {
    let program = format!("{:?}", cmd.get_program());
    cmd.output()
        .with_context(|| format!("failed to run {}", program))
}

impl AdbDevice {
    /// Starts the adb server and attaches to `serial`, or to the first ready device.
    pub fn connect(adb_path: &Path, serial: Option<&str>) -> Result<Self> {
        let mut start = Command::new(adb_path);
        start.arg("start-server");
        let output = run(start).context("is adb installed and on PATH?")?;
        if !output.status.success() {
            warn!(
                "adb start-server exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        for attempt in 1..=CONNECT_ATTEMPTS {
            let mut list = Command::new(adb_path);
            list.arg("devices");
            let output = run(list)?;
            let devices = parse_device_list(&String::from_utf8_lossy(&output.stdout))?;

            let ready = devices.iter().find(|(s, state)| {
                state == "device" && serial.is_none_or(|wanted| wanted == s)
            });

            if let Some((found, _)) = ready {
                info!("Connected to device {}", found);
                return Ok(Self {
                    adb_path: adb_path.to_path_buf(),
                    serial: found.clone(),
                });
            }

            warn!(
                "[Attempt {}/{}] no ready device ({} listed), waiting...",
                attempt,
                CONNECT_ATTEMPTS,
                devices.len()
            );
            if attempt < CONNECT_ATTEMPTS {
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
        }

        Err(anyhow!(
            "could not connect to {} after {} attempts; is the emulator running?",
            serial.unwrap_or("any device"),
            CONNECT_ATTEMPTS
        ))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn adb(&self) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        cmd.arg("-s").arg(&self.serial);
        cmd
    }

    fn shell(&self, args: &[String]) -> Result<()> {
        let mut cmd = self.adb();
        cmd.arg("shell").args(args);
        let output = run(cmd)?;
        if !output.status.success() {
            bail!(
                "adb shell {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Connection state as reported by `adb get-state` (`device` when usable).
    pub fn state(&self) -> Result<String> {
        let mut cmd = self.adb();
        cmd.arg("get-state");
        let output = run(cmd)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Force-stops and relaunches `package`, then waits for it to load.
    pub fn launch_app(&mut self, package: &str, wait: Duration) -> Result<()> {
        info!("Launching {}...", package);
        self.shell(&["am".into(), "force-stop".into(), package.into()])?;
        std::thread::sleep(Duration::from_secs(1));
        self.shell(&[
            "monkey".into(),
            "-p".into(),
            package.into(),
            "-c".into(),
            "android.intent.category.LAUNCHER".into(),
            "1".into(),
        ])?;
        info!("Waiting {:.0}s for the app to load", wait.as_secs_f32());
        std::thread::sleep(wait);
        Ok(())
    }

    /// Replays the configured taps that lead from the home screen to the list.
    pub fn navigate(&mut self, steps: &[NavigationStep]) -> Result<()> {
        if steps.is_empty() {
            warn!("No navigation steps configured, assuming the list is already open");
            return Ok(());
        }
        info!("Navigating to the list ({} steps)", steps.len());
        for (i, step) in steps.iter().enumerate() {
            info!("  Step {}/{}: tap ({}, {})", i + 1, steps.len(), step.x, step.y);
            self.tap(Point::new(step.x, step.y))?;
            std::thread::sleep(Duration::from_millis(step.delay_ms));
        }
        Ok(())
    }
}

impl FrameSource for AdbDevice {
    fn capture(&mut self) -> Result<Option<Frame>> {
        let mut cmd = self.adb();
        cmd.args(["exec-out", "screencap", "-p"]);
        let output = run(cmd)?;

        let decoded = if output.status.success() && !output.stdout.is_empty() {
            ImageReader::new(Cursor::new(&output.stdout))
                .with_guessed_format()
                .ok()
                .and_then(|reader| reader.decode().ok())
        } else {
            None
        };

        if let Some(img) = decoded {
            return Ok(Some(Frame::new(img.to_rgba8())));
        }

        let state = self.state().unwrap_or_default();
        if state != "device" {
            bail!("device {} is no longer available (state '{}')", self.serial, state);
        }
        warn!(
            "screencap returned no image ({} bytes, {})",
            output.stdout.len(),
            output.status
        );
        Ok(None)
    }
}

impl InputInjector for AdbDevice {
    fn tap(&mut self, at: Point) -> Result<()> {
        self.shell(&[
            "input".into(),
            "tap".into(),
            at.x.to_string(),
            at.y.to_string(),
        ])
    }

    fn scroll(&mut self, from: Point, to: Point, duration: Duration) -> Result<()> {
        self.shell(&[
            "input".into(),
            "swipe".into(),
            from.x.to_string(),
            from.y.to_string(),
            to.x.to_string(),
            to.y.to_string(),
            duration.as_millis().to_string(),
        ])
    }
}
