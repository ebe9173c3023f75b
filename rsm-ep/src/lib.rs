//! # rsm-ep (Edge Publisher)
//!
//! Samples temperature/humidity and a short audio clip on a fixed interval
//! and publishes each cycle to the broker with acknowledged delivery.
//!
//! Leaf collaborators sit behind traits so the loop can run without
//! hardware: [`sensor::SensorDriver`], [`capture::AudioInput`] and
//! [`transport::Transport`].

pub mod capture;
pub mod publisher;
pub mod sensor;
pub mod transport;

pub use capture::{AudioClip, AudioInput, CaptureSpec, ClipCapturer, CpalInput};
pub use publisher::{Publisher, TickOutcome};
pub use sensor::{SensorDriver, SensorReport, SensorSampler};
pub use transport::{MqttTransport, Transport};
