mod event_handler;
mod model;
mod processing;
mod state;

pub use state::{AppState, BackendEvent, Notice, TaskState};
