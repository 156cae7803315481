//! Periodic output driven by the run loop.

use serde::{Deserialize, Serialize};

/// When a periodic output is due.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    period: f64,
    start: f64,
    /// Saves done so far, minus one. Starting at -1 makes the output due at
    /// the registration time itself.
    count: i64,
}

impl Schedule {
    pub fn new(period: f64, start: f64) -> Self {
        Self {
            period,
            start,
            count: -1,
        }
    }

    pub fn is_due(&self, time: f64) -> bool {
        let t = time - self.start;
        self.period != 0.0 && t - self.count as f64 * self.period >= self.period
    }

    pub fn mark_saved(&mut self) {
        self.count += 1;
    }

    /// Number of saves done so far.
    pub fn saves(&self) -> u64 {
        (self.count + 1) as u64
    }

    pub fn period(&self) -> f64 {
        self.period
    }
}

/// Output action: receives the owner, the output name and the save number.
pub type OutputAction<S> = Box<dyn FnMut(&S, &str, u64)>;

struct Output<S> {
    name: String,
    schedule: Schedule,
    action: OutputAction<S>,
}

/// Named periodic outputs of one solver.
pub struct AutosaveTable<S> {
    outputs: Vec<Output<S>>,
}

impl<S> Default for AutosaveTable<S> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
        }
    }
}

impl<S> AutosaveTable<S> {
    /// Registers `action` under `name`, replacing an earlier registration.
    /// A zero period removes the output instead.
    pub fn register(&mut self, name: &str, period: f64, start: f64, action: OutputAction<S>) {
        self.outputs.retain(|output| output.name != name);
        if period == 0.0 {
            log::debug!("autosave of {name} disabled");
            return;
        }
        log::debug!("autosave of {name} every {period:e} s");
        self.outputs.push(Output {
            name: name.to_string(),
            schedule: Schedule::new(period, start),
            action,
        });
    }

    /// Runs every output that is due at `time`.
    pub fn save_due(&mut self, owner: &S, time: f64) {
        for output in &mut self.outputs {
            if output.schedule.is_due(time) {
                let number = output.schedule.saves();
                (output.action)(owner, &output.name, number);
                output.schedule.mark_saved();
            }
        }
    }

    pub fn schedule(&self, name: &str) -> Option<&Schedule> {
        self.outputs
            .iter()
            .find(|output| output.name == name)
            .map(|output| &output.schedule)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{AutosaveTable, Schedule};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn first_save_happens_at_registration_time() {
        let schedule = Schedule::new(1e-9, 2e-9);
        assert!(schedule.is_due(2e-9));
        assert!(!Schedule::new(0.0, 0.0).is_due(1.0));
    }

    #[test]
    fn saves_follow_the_period() {
        let mut schedule = Schedule::new(0.25, 0.0);
        let mut saved = Vec::new();
        for step in 0..=8 {
            let t = step as f64 * 0.125;
            if schedule.is_due(t) {
                saved.push(t);
                schedule.mark_saved();
            }
        }
        assert_eq!(saved, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(schedule.saves(), 5);
    }

    #[test]
    fn zero_period_unregisters() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut table: AutosaveTable<()> = AutosaveTable::default();
        let sink = Rc::clone(&calls);
        table.register(
            "m",
            0.5,
            0.0,
            Box::new(move |_, name, number| sink.borrow_mut().push((name.to_string(), number))),
        );
        table.save_due(&(), 0.0);
        table.save_due(&(), 0.25);
        table.save_due(&(), 0.5);
        assert_eq!(
            *calls.borrow(),
            vec![("m".to_string(), 0), ("m".to_string(), 1)]
        );

        table.register("m", 0.0, 0.5, Box::new(|_, _, _| {}));
        assert!(table.is_empty());
        assert!(table.schedule("m").is_none());
    }
}
