use crate::error::OutOfOrderSample;

/// Trapezoidal integrator turning irregularly timed power samples into energy.
///
/// The running sum is in the input's native units multiplied together, so
/// watts against unix seconds accumulate watt-seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyIntegrator {
    last_point: Option<(f64, f64)>,
    sum: f64,
}

impl EnergyIntegrator {
    /// Creates an unseeded integrator with a zero sum
    pub fn new() -> Self {
        Self {
            last_point: None,
            sum: 0.0,
        }
    }

    /// Feeds a new `(timestamp, value)` point and returns the running sum.
    ///
    /// The first point only seeds the integrator. Each later point adds the
    /// trapezoid between it and the previous one. A point earlier than the last
    /// recorded one is rejected and leaves the integrator untouched.
    pub fn add_point(&mut self, timestamp: f64, value: f64) -> Result<f64, OutOfOrderSample> {
        if let Some((last_timestamp, last_value)) = self.last_point {
            if timestamp < last_timestamp {
                return Err(OutOfOrderSample {
                    timestamp,
                    last_timestamp,
                });
            }
            self.sum += 0.5 * (last_value + value) * (timestamp - last_timestamp);
        }

        self.last_point = Some((timestamp, value));
        Ok(self.sum)
    }

    pub fn get_sum(&self) -> f64 {
        self.sum
    }

    /// Last accepted `(timestamp, value)`, `None` until seeded
    pub fn get_last_point(&self) -> Option<(f64, f64)> {
        self.last_point
    }

    pub fn is_seeded(&self) -> bool {
        self.last_point.is_some()
    }

    /// Returns the integrator to its freshly constructed state
    pub fn reset(&mut self) {
        self.last_point = None;
        self.sum = 0.0;
    }
}
