//! Randomized delay between pages
//!
//! Draws come from a Gamma distribution (heavy right tail) and never go
//! below a fixed floor.

use rand::distributions::Distribution;
use statrs::distribution::Gamma;
use std::time::Duration;

pub trait PageDelay: Send + Sync {
    /// Delay to wait before the next page
    fn next_delay(&self) -> Duration;
}

/// `max(floor, Gamma(shape, scale))` seconds
#[derive(Debug, Clone)]
pub struct GammaDelay {
    distribution: Gamma,
    floor_secs: f64,
}

impl GammaDelay {
    /// `scale` is in seconds; returns `None` for a non-positive shape or scale
    pub fn new(shape: f64, scale: f64, floor_secs: f64) -> Option<Self> {
        if scale <= 0.0 {
            return None;
        }
        let distribution = Gamma::new(shape, 1.0 / scale).ok()?;
        Some(Self {
            distribution,
            floor_secs: floor_secs.max(0.0),
        })
    }

    fn clamp(&self, draw: f64) -> Duration {
        let secs = if draw.is_finite() {
            draw.max(self.floor_secs)
        } else {
            self.floor_secs
        };
        Duration::from_secs_f64(secs)
    }
}

impl PageDelay for GammaDelay {
    fn next_delay(&self) -> Duration {
        let draw = self.distribution.sample(&mut rand::thread_rng());
        self.clamp(draw)
    }
}

/// Constant delay
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedDelay(pub Duration);

impl PageDelay for FixedDelay {
    fn next_delay(&self) -> Duration {
        self.0
    }
}
