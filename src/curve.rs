//! Fan curve mapping (temperature → duty cycle)
//!
//! A piecewise-linear map from reconciled temperature to fan duty
//! percentage, with hysteresis so the duty only drops after the
//! temperature has fallen a margin below the point that raised it.

use serde::{Deserialize, Serialize};

/// Fan curve point
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Temperature threshold (°C)
    pub temp_celsius: f64,
    /// Fan duty cycle (0-100%)
    pub duty_percent: f64,
}

/// Piecewise fan curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanCurve {
    /// Curve name
    pub name: String,
    /// Curve points, sorted by temperature
    pub points: Vec<CurvePoint>,
    /// Temperature drop required before duty decreases (°C)
    pub hysteresis: f64,
}

impl FanCurve {
    /// Balanced default curve
    pub fn balanced() -> Self {
        Self {
            name: "Balanced".to_string(),
            points: vec![
                CurvePoint {
                    temp_celsius: 40.0,
                    duty_percent: 20.0,
                },
                CurvePoint {
                    temp_celsius: 55.0,
                    duty_percent: 35.0,
                },
                CurvePoint {
                    temp_celsius: 65.0,
                    duty_percent: 50.0,
                },
                CurvePoint {
                    temp_celsius: 75.0,
                    duty_percent: 70.0,
                },
                CurvePoint {
                    temp_celsius: 85.0,
                    duty_percent: 90.0,
                },
                CurvePoint {
                    temp_celsius: 92.0,
                    duty_percent: 100.0,
                },
            ],
            hysteresis: 4.0,
        }
    }

    /// Quiet curve: tolerates heat to keep noise down
    pub fn quiet() -> Self {
        Self {
            name: "Quiet".to_string(),
            points: vec![
                CurvePoint {
                    temp_celsius: 50.0,
                    duty_percent: 0.0,
                },
                CurvePoint {
                    temp_celsius: 60.0,
                    duty_percent: 25.0,
                },
                CurvePoint {
                    temp_celsius: 72.0,
                    duty_percent: 40.0,
                },
                CurvePoint {
                    temp_celsius: 82.0,
                    duty_percent: 60.0,
                },
                CurvePoint {
                    temp_celsius: 90.0,
                    duty_percent: 85.0,
                },
                CurvePoint {
                    temp_celsius: 95.0,
                    duty_percent: 100.0,
                },
            ],
            hysteresis: 6.0,
        }
    }

    /// Performance curve: prioritizes cooling headroom
    pub fn performance() -> Self {
        Self {
            name: "Performance".to_string(),
            points: vec![
                CurvePoint {
                    temp_celsius: 35.0,
                    duty_percent: 35.0,
                },
                CurvePoint {
                    temp_celsius: 50.0,
                    duty_percent: 50.0,
                },
                CurvePoint {
                    temp_celsius: 60.0,
                    duty_percent: 65.0,
                },
                CurvePoint {
                    temp_celsius: 70.0,
                    duty_percent: 80.0,
                },
                CurvePoint {
                    temp_celsius: 80.0,
                    duty_percent: 95.0,
                },
                CurvePoint {
                    temp_celsius: 85.0,
                    duty_percent: 100.0,
                },
            ],
            hysteresis: 3.0,
        }
    }

    /// Duty cycle for a temperature, interpolating between points
    pub fn duty_for(&self, temp_celsius: f64) -> f64 {
        if self.points.is_empty() {
            return 100.0;
        }

        let first = &self.points[0];
        if temp_celsius <= first.temp_celsius {
            return first.duty_percent;
        }

        let last = self.points.last().unwrap();
        if temp_celsius >= last.temp_celsius {
            return last.duty_percent;
        }

        for pair in self.points.windows(2) {
            let (p1, p2) = (&pair[0], &pair[1]);
            if temp_celsius >= p1.temp_celsius && temp_celsius <= p2.temp_celsius {
                let temp_range = p2.temp_celsius - p1.temp_celsius;
                let duty_range = p2.duty_percent - p1.duty_percent;
                let offset = temp_celsius - p1.temp_celsius;
                return p1.duty_percent + duty_range * offset / temp_range;
            }
        }

        100.0
    }
}

/// Curve evaluation with hysteresis memory
///
/// Tracks the temperature that set the current duty; the duty only
/// decreases once the temperature falls `hysteresis` degrees below it.
#[derive(Debug, Clone)]
pub struct CurveTracker {
    curve: FanCurve,
    held_temp: Option<f64>,
}

impl CurveTracker {
    /// Wrap a curve for stateful evaluation
    pub fn new(curve: FanCurve) -> Self {
        Self {
            curve,
            held_temp: None,
        }
    }

    /// The wrapped curve
    pub fn curve(&self) -> &FanCurve {
        &self.curve
    }

    /// Evaluate the curve with hysteresis
    pub fn update(&mut self, temp_celsius: f64) -> f64 {
        match self.held_temp {
            Some(held) if temp_celsius < held => {
                if held - temp_celsius >= self.curve.hysteresis {
                    self.held_temp = Some(temp_celsius);
                    self.curve.duty_for(temp_celsius)
                } else {
                    // Inside the hysteresis band: hold the old duty
                    self.curve.duty_for(held)
                }
            }
            _ => {
                self.held_temp = Some(temp_celsius);
                self.curve.duty_for(temp_celsius)
            }
        }
    }
}
