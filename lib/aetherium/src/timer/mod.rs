pub mod service;
pub mod wheel;

pub use service::{TimerListener, TimerService};
pub use wheel::TimingWheel;
