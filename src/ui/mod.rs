pub mod dashboard;
pub mod dialogs;
