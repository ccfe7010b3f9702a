//! The flat per-instance record a wrapper routine hands to its target.

use crate::dialect::Precision;
use anyhow::{anyhow, bail, Result};

/// One bound parameter as seen by a single instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Row of a floating point buffer, widened to `f64` for the call.
    Floats(Vec<f64>),
    /// Row of a `u32` buffer.
    Words(Vec<u32>),
    /// Value passed by value.
    Scalar(f64),
}

impl Slot {
    pub fn len(&self) -> usize {
        match self {
            Slot::Floats(values) => values.len(),
            Slot::Words(values) => values.len(),
            Slot::Scalar(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-instance record: one slot per formal parameter, in declaration order.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    index: usize,
    precision: Precision,
    slots: Vec<Slot>,
}

impl InstanceRecord {
    pub fn new(index: usize, precision: Precision, slots: Vec<Slot>) -> Self {
        Self {
            index,
            precision,
            slots,
        }
    }

    /// Instance index within `[0, N)`.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    pub fn into_slots(self) -> Vec<Slot> {
        self.slots
    }

    pub fn slot(&self, position: usize) -> Result<&Slot> {
        self.slots
            .get(position)
            .ok_or_else(|| anyhow!("record has no slot at position {position}"))
    }

    pub fn slot_mut(&mut self, position: usize) -> Result<&mut Slot> {
        self.slots
            .get_mut(position)
            .ok_or_else(|| anyhow!("record has no slot at position {position}"))
    }

    /// Scalar view of a slot; array slots yield their first element.
    pub fn scalar(&self, position: usize) -> Result<f64> {
        match self.slot(position)? {
            Slot::Scalar(value) => Ok(*value),
            Slot::Floats(values) => values
                .first()
                .copied()
                .ok_or_else(|| anyhow!("slot {position} is an empty array")),
            Slot::Words(values) => values
                .first()
                .map(|word| f64::from(*word))
                .ok_or_else(|| anyhow!("slot {position} is an empty array")),
        }
    }

    pub fn floats(&self, position: usize) -> Result<&[f64]> {
        match self.slot(position)? {
            Slot::Floats(values) => Ok(values),
            other => bail!("slot {position} is not a float array: {other:?}"),
        }
    }

    pub fn floats_mut(&mut self, position: usize) -> Result<&mut [f64]> {
        match self.slot_mut(position)? {
            Slot::Floats(values) => Ok(values),
            _ => bail!("slot {position} is not a float array"),
        }
    }

    pub fn words(&self, position: usize) -> Result<&[u32]> {
        match self.slot(position)? {
            Slot::Words(values) => Ok(values),
            other => bail!("slot {position} is not a word array: {other:?}"),
        }
    }

    pub fn words_mut(&mut self, position: usize) -> Result<&mut [u32]> {
        match self.slot_mut(position)? {
            Slot::Words(values) => Ok(values),
            _ => bail!("slot {position} is not a word array"),
        }
    }

    /// Replaces a float array slot in place, keeping its length.
    pub fn set_floats(&mut self, position: usize, values: &[f64]) -> Result<()> {
        let target = self.floats_mut(position)?;
        if target.len() != values.len() {
            bail!(
                "slot {position} holds {} values, got {}",
                target.len(),
                values.len()
            );
        }
        target.copy_from_slice(values);
        Ok(())
    }

    /// Rounds a value the way the call precision stores it.
    pub fn round(&self, value: f64) -> f64 {
        match self.precision {
            Precision::Single => value as f32 as f64,
            Precision::Double => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_reads_first_element_of_arrays() {
        let record = InstanceRecord::new(
            3,
            Precision::Double,
            vec![
                Slot::Floats(vec![1.5, 2.5]),
                Slot::Scalar(4.0),
                Slot::Words(vec![7]),
            ],
        );
        assert_eq!(record.index(), 3);
        assert_eq!(record.scalar(0).unwrap(), 1.5);
        assert_eq!(record.scalar(1).unwrap(), 4.0);
        assert_eq!(record.scalar(2).unwrap(), 7.0);
        assert!(record.floats(1).is_err());
        assert!(record.slot(3).is_err());
    }

    #[test]
    fn set_floats_checks_length() {
        let mut record =
            InstanceRecord::new(0, Precision::Single, vec![Slot::Floats(vec![0.0; 2])]);
        record.set_floats(0, &[1.0, 2.0]).unwrap();
        assert_eq!(record.floats(0).unwrap(), &[1.0, 2.0]);
        assert!(record.set_floats(0, &[1.0]).is_err());
        assert_eq!(record.round(0.1), 0.1f32 as f64);
    }
}
