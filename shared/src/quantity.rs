use serde::{Deserialize, Serialize};

/// Physical unit attached to every value that crosses a subsystem boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    TempDegC,
    TempDegF,
    TimeSec,
    TimeMin,
    TimeHour,
    TimeDay,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Temperature,
    Time,
    Dimensionless,
}

impl Unit {
    fn dimension(self) -> Dimension {
        match self {
            Unit::TempDegC | Unit::TempDegF => Dimension::Temperature,
            Unit::TimeSec | Unit::TimeMin | Unit::TimeHour | Unit::TimeDay => Dimension::Time,
            Unit::None => Dimension::Dimensionless,
        }
    }

    /// Seconds per unit, for time units only
    fn seconds(self) -> Option<f32> {
        match self {
            Unit::TimeSec => Some(1.0),
            Unit::TimeMin => Some(60.0),
            Unit::TimeHour => Some(3600.0),
            Unit::TimeDay => Some(86400.0),
            _ => None,
        }
    }
}

/// A scalar paired with its unit. Conversion only happens through
/// [`Quantity::convert`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f32,
    pub unit: Unit,
}

impl Quantity {
    pub const fn new(value: f32, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Convert to `unit`. Returns `None` when the units measure different things.
    pub fn convert(self, unit: Unit) -> Option<Quantity> {
        if self.unit == unit {
            return Some(self);
        }
        if self.unit.dimension() != unit.dimension() {
            return None;
        }

        let value = match (self.unit, unit) {
            (Unit::TempDegC, Unit::TempDegF) => self.value * 1.8 + 32.0,
            (Unit::TempDegF, Unit::TempDegC) => (self.value - 32.0) / 1.8,
            (from, to) => {
                let from_secs = from.seconds()?;
                let to_secs = to.seconds()?;
                self.value * from_secs / to_secs
            }
        };

        Some(Quantity { value, unit })
    }
}
