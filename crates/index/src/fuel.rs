use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::Error;

/// A shared fuel meter. Every flake scanned burns one unit; a query or
/// transaction that runs dry fails rather than running away.
#[derive(Debug, Clone)]
pub struct Fuel {
    limit: i64,
    remaining: Arc<AtomicI64>,
}

impl Fuel {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            remaining: Arc::new(AtomicI64::new(limit)),
        }
    }

    pub fn consume(&self, units: i64) -> Result<(), Error> {
        let before = self.remaining.fetch_sub(units, Ordering::Relaxed);
        if before < units {
            Err(Error::FuelExhausted { limit: self.limit })
        } else {
            Ok(())
        }
    }

    pub fn used(&self) -> i64 {
        self.limit - self.remaining.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fuel_runs_dry() {
        let fuel = Fuel::new(3);
        fuel.consume(2).unwrap();
        fuel.consume(1).unwrap();
        assert!(matches!(
            fuel.consume(1),
            Err(Error::FuelExhausted { limit: 3 })
        ));
    }

    #[test]
    fn test_clones_share_the_meter() {
        let fuel = Fuel::new(10);
        let other = fuel.clone();
        fuel.consume(6).unwrap();
        other.consume(4).unwrap();
        assert!(other.consume(1).is_err());
        assert_eq!(fuel.used(), 11);
    }
}
