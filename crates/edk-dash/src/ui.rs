use edk_core::Reading;
use edk_link::ReadingConsumer;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// User-facing notices: connection changes, pairing results, command
/// acknowledgements.
pub trait Notifier {
    fn notify(&self, severity: Severity, message: &str);
}

/// Routes notices into the structured log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(event = "notice", message = message),
            Severity::Success => info!(event = "notice", outcome = "ok", message = message),
            Severity::Warning => warn!(event = "notice", message = message),
            Severity::Error => error!(event = "notice", message = message),
        }
    }
}

/// Rendering surface for echo points. The console impl below is the only
/// one shipped; a richer frontend would implement this over its canvas.
pub trait Visualization {
    fn plot(&mut self, angle_degrees: f64, distance: f64);
    fn clear(&mut self);
}

/// Lets the run loop keep a handle to the surface it hands the plot
/// consumer, so it can clear the display when the link drops.
impl<V: Visualization> Visualization for Rc<RefCell<V>> {
    fn plot(&mut self, angle_degrees: f64, distance: f64) {
        self.borrow_mut().plot(angle_degrees, distance);
    }

    fn clear(&mut self) {
        self.borrow_mut().clear();
    }
}

pub struct ConsolePlot;

impl Visualization for ConsolePlot {
    fn plot(&mut self, angle_degrees: f64, distance: f64) {
        println!("echo  {angle_degrees:>5.1}\u{b0}  {distance:>7.1} cm");
    }

    fn clear(&mut self) {
        println!("--- plot cleared ---");
    }
}

/// Writes every reading to the log, echo or not.
pub struct LogConsumer;

impl ReadingConsumer for LogConsumer {
    fn name(&self) -> &str {
        "log"
    }

    fn on_reading(&mut self, reading: &Reading) -> anyhow::Result<()> {
        info!(
            event = "reading",
            seq = reading.seq,
            angle = reading.angle_degrees,
            distance = reading.distance,
            echo = reading.has_echo()
        );
        Ok(())
    }
}

/// Feeds echo-carrying readings to a visualization. Zero-distance sweeps
/// stay in the history but draw nothing.
pub struct PlotConsumer<V: Visualization> {
    surface: V,
}

impl<V: Visualization> PlotConsumer<V> {
    pub fn new(surface: V) -> Self {
        Self { surface }
    }
}

impl<V: Visualization> ReadingConsumer for PlotConsumer<V> {
    fn name(&self) -> &str {
        "plot"
    }

    fn on_reading(&mut self, reading: &Reading) -> anyhow::Result<()> {
        if reading.has_echo() {
            self.surface.plot(reading.angle_degrees, reading.distance);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct FakeSurface {
        points: Rc<RefCell<Vec<(f64, f64)>>>,
    }

    impl Visualization for FakeSurface {
        fn plot(&mut self, angle_degrees: f64, distance: f64) {
            self.points.borrow_mut().push((angle_degrees, distance));
        }

        fn clear(&mut self) {
            self.points.borrow_mut().clear();
        }
    }

    fn reading(angle: f64, distance: f64) -> Reading {
        Reading {
            angle_degrees: angle,
            distance,
            observed_at: Utc::now(),
            seq: 1,
        }
    }

    #[test]
    fn plot_consumer_skips_empty_sweeps() {
        let points = Rc::new(RefCell::new(Vec::new()));
        let mut consumer = PlotConsumer::new(FakeSurface {
            points: points.clone(),
        });

        consumer.on_reading(&reading(45.0, 100.0)).expect("echo");
        consumer.on_reading(&reading(90.0, 0.0)).expect("no echo");

        assert_eq!(points.borrow().as_slice(), &[(45.0, 100.0)]);
    }

    #[test]
    fn shared_surface_clears_through_the_outer_handle() {
        let points = Rc::new(RefCell::new(Vec::new()));
        let surface = Rc::new(RefCell::new(FakeSurface {
            points: points.clone(),
        }));
        let mut consumer = PlotConsumer::new(surface.clone());

        consumer.on_reading(&reading(45.0, 100.0)).expect("echo");
        assert_eq!(points.borrow().len(), 1);

        let mut handle = surface.clone();
        handle.clear();
        assert!(points.borrow().is_empty());
    }
}
