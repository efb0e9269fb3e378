/**
 * WEIGHT TABLE - Latest reading of every weighed material
 *
 * ROLE :
 * Shared between the acquisition units (one writer per material) and the
 * session broadcast / safety supervisor (readers).
 *
 * INVARIANTS :
 * - value and updated_at of one material are replaced together under one lock
 * - updated_at never goes backwards for a given material, even if the wall clock does
 */

use crate::state::{new_state, snapshot, Shared};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightReading {
    pub value: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct WeightTable {
    inner: Shared<BTreeMap<String, WeightReading>>,
}

impl WeightTable {
    /// Every configured material starts at 0.0 with no update time.
    pub fn new<I, S>(materials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = materials
            .into_iter()
            .map(|m| (m.into(), WeightReading { value: 0.0, updated_at: None }))
            .collect();
        Self { inner: new_state(map) }
    }

    pub fn update(&self, material: &str, value: f64) {
        self.update_at(material, value, OffsetDateTime::now_utc());
    }

    /// Materials outside the configured set are ignored.
    pub(crate) fn update_at(&self, material: &str, value: f64, now: OffsetDateTime) {
        let mut map = self.inner.lock();
        let Some(entry) = map.get_mut(material) else {
            tracing::debug!(material, "ignoring reading for unknown material");
            return;
        };
        let stamp = match entry.updated_at {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *entry = WeightReading { value, updated_at: Some(stamp) };
    }

    /// Point-in-time copy, taken under the lock.
    pub fn snapshot(&self) -> BTreeMap<String, WeightReading> {
        snapshot(&self.inner)
    }

    pub fn values(&self) -> BTreeMap<String, f64> {
        self.inner
            .lock()
            .iter()
            .map(|(k, r)| (k.clone(), r.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn starts_with_every_material_at_zero() {
        let table = WeightTable::new(["pasir", "batu", "semen", "air"]);
        let values = table.values();
        assert_eq!(values.len(), 4);
        assert!(values.values().all(|v| *v == 0.0));
        assert!(table.snapshot().values().all(|r| r.updated_at.is_none()));
    }

    #[test]
    fn updated_at_never_goes_backwards() {
        let table = WeightTable::new(["pasir"]);
        let t0 = OffsetDateTime::now_utc();
        table.update_at("pasir", 10.0, t0);
        table.update_at("pasir", 12.0, t0 - Duration::seconds(5));

        let reading = table.snapshot()["pasir"];
        assert_eq!(reading.value, 12.0);
        assert_eq!(reading.updated_at, Some(t0));
    }

    #[test]
    fn unknown_materials_are_not_added() {
        let table = WeightTable::new(["pasir"]);
        table.update("kerikil", 5.0);
        assert_eq!(table.values().len(), 1);
        assert!(!table.snapshot().contains_key("kerikil"));
    }

    #[test]
    fn concurrent_writers_on_distinct_materials() {
        let table = WeightTable::new(["pasir", "batu"]);
        let handles: Vec<_> = ["pasir", "batu"]
            .into_iter()
            .map(|m| {
                let t = table.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        t.update(m, i as f64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let values = table.values();
        assert_eq!(values["pasir"], 999.0);
        assert_eq!(values["batu"], 999.0);
    }
}
