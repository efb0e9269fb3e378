//! Digital inputs and transition detection.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Raw pin levels, true = high.
pub trait InputBank: Send {
    fn levels(&mut self) -> BTreeMap<String, bool>;
}

/// Levels set by hand, shared with whoever drives them. Idle = pulled up.
#[derive(Clone)]
pub struct SimulatedInputs {
    levels: Arc<Mutex<BTreeMap<String, bool>>>,
}

impl SimulatedInputs {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a String>, idle_level: bool) -> Self {
        let levels = names.into_iter().map(|n| (n.clone(), idle_level)).collect();
        Self { levels: Arc::new(Mutex::new(levels)) }
    }

    pub fn set_level(&self, name: &str, high: bool) {
        self.levels.lock().insert(name.to_string(), high);
    }
}

impl InputBank for SimulatedInputs {
    fn levels(&mut self) -> BTreeMap<String, bool> {
        self.levels.lock().clone()
    }
}

#[cfg(feature = "rpi")]
pub struct RppalInputs {
    pins: BTreeMap<String, rppal::gpio::InputPin>,
}

#[cfg(feature = "rpi")]
impl RppalInputs {
    /// Claims every pin as an input with the pull-up enabled.
    pub fn open(buttons: &BTreeMap<String, u8>) -> Result<Self, rppal::gpio::Error> {
        let gpio = rppal::gpio::Gpio::new()?;
        let mut pins = BTreeMap::new();
        for (name, pin) in buttons {
            pins.insert(name.clone(), gpio.get(*pin)?.into_input_pullup());
        }
        Ok(Self { pins })
    }
}

#[cfg(feature = "rpi")]
impl InputBank for RppalInputs {
    fn levels(&mut self) -> BTreeMap<String, bool> {
        self.pins.iter().map(|(name, pin)| (name.clone(), pin.is_high())).collect()
    }
}

/// Reports every change of the pressed state. No debounce.
pub struct EdgeDetector {
    active_low: bool,
    pressed: BTreeMap<String, bool>,
}

impl EdgeDetector {
    /// Every button starts released.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a String>, active_low: bool) -> Self {
        let pressed = names.into_iter().map(|n| (n.clone(), false)).collect();
        Self { active_low, pressed }
    }

    /// (relay, pressed) for every button whose state changed since the last sample.
    pub fn sample(&mut self, levels: &BTreeMap<String, bool>) -> Vec<(String, bool)> {
        let mut edges = Vec::new();
        for (name, last) in self.pressed.iter_mut() {
            let Some(level) = levels.get(name) else { continue };
            let now = *level != self.active_low;
            if now != *last {
                *last = now;
                edges.push((name.clone(), now));
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["mixer".into(), "silo_1".into()]
    }

    #[test]
    fn active_low_press_and_release() {
        let names = names();
        let mut bank = SimulatedInputs::new(&names, true);
        let mut det = EdgeDetector::new(&names, true);

        assert!(det.sample(&bank.levels()).is_empty());

        bank.set_level("mixer", false);
        assert_eq!(det.sample(&bank.levels()), vec![("mixer".to_string(), true)]);
        assert!(det.sample(&bank.levels()).is_empty());

        bank.set_level("mixer", true);
        bank.set_level("silo_1", false);
        assert_eq!(
            det.sample(&bank.levels()),
            vec![("mixer".to_string(), false), ("silo_1".to_string(), true)]
        );
    }

    #[test]
    fn every_bounce_is_reported() {
        let names = names();
        let mut bank = SimulatedInputs::new(&names, false);
        let mut det = EdgeDetector::new(&names, false);
        let mut count = 0;
        for level in [true, false, true, false] {
            bank.set_level("silo_1", level);
            count += det.sample(&bank.levels()).len();
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn unknown_levels_are_ignored() {
        let names = names();
        let mut det = EdgeDetector::new(&names, true);
        let levels = [("pompa".to_string(), false)].into_iter().collect();
        assert!(det.sample(&levels).is_empty());
    }
}
