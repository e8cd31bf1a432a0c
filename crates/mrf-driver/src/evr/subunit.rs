//! Capability interface over the sub-unit variants.
//!
//! Controllers that save, restore or report hardware state do not need to
//! know which family a sub-unit belongs to; they need a name, a register
//! snapshot, and a way to write one back. Family-specific behavior stays
//! on the concrete types.

use crate::error::{MrfError, Result};

use super::{CmlOutput, Input, OutputMux, Prescaler, Pulser};

/// Uniform view over a hardware sub-unit.
pub trait SubUnit {
    /// Short human-readable identity, e.g. `"pulser 3"`.
    fn describe(&self) -> String;

    /// Snapshot of the writable register words.
    fn read_state(&self) -> Vec<u32>;

    /// Restore a snapshot taken by [`SubUnit::read_state`].
    ///
    /// # Errors
    ///
    /// The snapshot must have exactly the sub-unit's word count.
    fn write_state(&self, state: &[u32]) -> Result<()>;
}

fn check_len(what: &'static str, state: &[u32], want: usize) -> Result<()> {
    if state.len() == want {
        Ok(())
    } else {
        Err(MrfError::range(what, state.len() as u64, want as u64))
    }
}

impl SubUnit for Pulser {
    fn describe(&self) -> String {
        format!("pulser {}", self.index())
    }

    fn read_state(&self) -> Vec<u32> {
        vec![
            u32::from(self.enabled()),
            u32::from(self.polarity_inverted()),
            self.prescaler(),
            self.delay(),
            self.width(),
        ]
    }

    fn write_state(&self, state: &[u32]) -> Result<()> {
        check_len("pulser state words", state, 5)?;
        self.set_enabled(state[0] != 0);
        self.set_polarity_inverted(state[1] != 0);
        if state[2] != 0 {
            self.set_prescaler(state[2])?;
        }
        self.set_delay(state[3]);
        self.set_width(state[4]);
        Ok(())
    }
}

impl SubUnit for Prescaler {
    fn describe(&self) -> String {
        format!("prescaler {}", self.index())
    }

    fn read_state(&self) -> Vec<u32> {
        vec![self.divisor()]
    }

    fn write_state(&self, state: &[u32]) -> Result<()> {
        check_len("prescaler state words", state, 1)?;
        self.set_divisor(state[0])
    }
}

impl SubUnit for OutputMux {
    fn describe(&self) -> String {
        "output map".into()
    }

    fn read_state(&self) -> Vec<u32> {
        vec![u32::from(self.source())]
    }

    fn write_state(&self, state: &[u32]) -> Result<()> {
        check_len("output state words", state, 1)?;
        self.set_source(state[0] as u16)
    }
}

impl SubUnit for Input {
    fn describe(&self) -> String {
        format!("input {}", self.index())
    }

    fn read_state(&self) -> Vec<u32> {
        vec![
            u32::from(self.external_code()),
            u32::from(self.level_sensitive()),
            u32::from(self.polarity_inverted()),
            u32::from(self.dbus_mask()),
        ]
    }

    fn write_state(&self, state: &[u32]) -> Result<()> {
        check_len("input state words", state, 4)?;
        self.set_external_code(state[0] as u8);
        self.set_level_sensitive(state[1] != 0);
        self.set_polarity_inverted(state[2] != 0);
        self.set_dbus_mask(state[3] as u8);
        Ok(())
    }
}

impl SubUnit for CmlOutput {
    fn describe(&self) -> String {
        format!("cml {}", self.index())
    }

    fn read_state(&self) -> Vec<u32> {
        let pattern = self.classic_pattern();
        let (high, low) = self.frequency_counts();
        vec![
            u32::from(self.enabled()),
            self.mode() as u32,
            pattern[0],
            pattern[1],
            pattern[2],
            pattern[3],
            (u32::from(high) << 16) | u32::from(low),
        ]
    }

    fn write_state(&self, state: &[u32]) -> Result<()> {
        use super::CmlMode;
        check_len("cml state words", state, 7)?;
        self.set_mode(match state[1] {
            1 => CmlMode::Frequency,
            2 => CmlMode::Pattern,
            _ => CmlMode::Classic,
        });
        self.set_classic_pattern([state[2], state[3], state[4], state[5]])?;
        let (high, low) = ((state[6] >> 16) as u16, state[6] as u16);
        if high != 0 && low != 0 {
            self.set_frequency(high, low, false)?;
        }
        self.set_enabled(state[0] != 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evr::{Evr, EvrConfig, OutputKind};
    use crate::io::RegIo;
    use crate::sim::SimCard;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn snapshot_and_restore_each_family() {
        let sim = Arc::new(SimCard::evr());
        let evr = Evr::new(
            0,
            sim as Arc<dyn RegIo>,
            &EvrConfig {
                threaded: false,
                fifo_min_period: Duration::ZERO,
                rx_protocol: 0,
            },
        )
        .unwrap();

        let pulser = evr.pulser(1).unwrap();
        pulser.set_delay(777);
        pulser.set_prescaler(3).unwrap();
        pulser.set_enabled(true);

        let units: Vec<&dyn SubUnit> = vec![
            pulser,
            evr.prescaler(0).unwrap(),
            evr.output(OutputKind::FrontPanel, 0).unwrap(),
            evr.input(0).unwrap(),
            evr.cml(0).unwrap(),
        ];

        for unit in units {
            let name = unit.describe();
            let snap = unit.read_state();
            assert!(!snap.is_empty(), "{name}");
            unit.write_state(&snap).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert_eq!(unit.read_state(), snap, "{name}");
            assert!(unit.write_state(&[]).is_err(), "{name}");
        }

        assert_eq!(pulser.delay(), 777);
    }
}
