//! Diffusion model components.

mod denoiser;
mod diffusion;
mod schedule;

pub use denoiser::{Denoiser, NoisePredictor};
pub use diffusion::{to_image_range, to_signal_range, Diffusion};
pub use schedule::{NoiseSchedule, ScheduleTensors, ScheduleType};
