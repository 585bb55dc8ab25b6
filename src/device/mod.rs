//! Frame capture and input injection.
//!
//! The scan loop only talks to the device through `FrameSource` and
//! `InputInjector`; `AdbDevice` implements both over the Android debug bridge.

pub mod adb;

use anyhow::Result;
use chrono::{DateTime, Local};
use image::RgbaImage;
use std::time::Duration;

pub use adb::AdbDevice;

/// One captured screen state. Never mutated after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbaImage,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            captured_at: Local::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A screen coordinate in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

pub trait FrameSource {
    /// Captures the current screen.
    ///
    /// `Ok(None)` is a transient miss the caller may retry; `Err` means the
    /// device connection is gone.
    fn capture(&mut self) -> Result<Option<Frame>>;
}

pub trait InputInjector {
    fn tap(&mut self, at: Point) -> Result<()>;

    /// Drags from `from` to `to` over `duration`.
    fn scroll(&mut self, from: Point, to: Point, duration: Duration) -> Result<()>;
}

/// A device the scan loop can both watch and drive.
pub trait Device: FrameSource + InputInjector {}

impl<T: FrameSource + InputInjector> Device for T {}
