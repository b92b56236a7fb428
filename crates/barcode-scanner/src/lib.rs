//! The scanner application: keystrokes in, barcode records and mode changes
//! out. `main` wires the pieces; the interesting parts are the pure state
//! machine in [`state`] and the effect driver in [`app`].

pub mod app;
pub mod feedback;
pub mod settings;
pub mod state;
