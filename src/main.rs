mod ui;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use gtk4::prelude::*;

use demucs_stems::error::Result;
use demucs_stems::{bus, AppState, BackendEvent, Config, ControlError, TaskState};
use ui::dashboard::DashboardWidgets;

fn main() {
    env_logger::init();
    log::info!("Demucs Stems starting");

    let application = libadwaita::Application::builder()
        .application_id("com.github.demucs-stems")
        .build();

    application.connect_activate(on_activate);
    application.run();
}

/// Everything the GTK callbacks share. Cheap to clone.
#[derive(Clone)]
struct Shell {
    state: Rc<RefCell<AppState>>,
    dashboard: Rc<DashboardWidgets>,
    consent_open: Rc<Cell<bool>>,
}

impl Shell {
    /// Run a controller request and reflect the result in the window.
    fn request(&self, action: impl FnOnce(&mut AppState) -> Result<()>) {
        let result = action(&mut self.state.borrow_mut());
        if let Err(e) = result {
            match &e {
                ControlError::InvalidState { .. } => log::debug!("{e}"),
                ControlError::Job(job) if job.is_fatal() => {
                    self.dashboard.append_log(&e.to_string());
                    ui::dialogs::show_alert(&self.dashboard.window, "Error", &e.to_string());
                }
                _ => {
                    self.dashboard.append_log(&e.to_string());
                    ui::dialogs::show_alert(&self.dashboard.window, "Cannot Continue", &e.to_string());
                }
            }
        }
        self.refresh();
    }

    fn refresh(&self) {
        let awaiting = {
            let state = self.state.borrow();
            self.dashboard.sync(&state);
            state.status() == TaskState::AwaitingDownloadConsent
        };
        if awaiting && !self.consent_open.get() {
            self.ask_consent();
        }
    }

    fn ask_consent(&self) {
        self.consent_open.set(true);
        let url = self.state.borrow().config.model_url.clone();
        let shell = self.clone();
        ui::dialogs::ask_download_consent(&self.dashboard.window, &url, move |consent| {
            shell.consent_open.set(false);
            shell.request(|s| s.answer_download_prompt(consent));
        });
    }
}

fn on_activate(app: &libadwaita::Application) {
    let (backend_tx, backend_bus) = bus::channel::<BackendEvent>();

    let state = match AppState::new(Config::load(), backend_tx) {
        Ok(state) => state,
        Err(e) => {
            log::error!("Failed to create tokio runtime: {e}");
            app.quit();
            return;
        }
    };

    let dashboard = ui::dashboard::build_dashboard(app, TaskState::Idle.label());
    let shell = Shell {
        state: Rc::new(RefCell::new(state)),
        dashboard: Rc::new(dashboard),
        consent_open: Rc::new(Cell::new(false)),
    };

    // Wire up buttons
    {
        let shell_clone = shell.clone();
        shell.dashboard.open_button.connect_clicked(move |_| {
            let shell_inner = shell_clone.clone();
            ui::dialogs::choose_input_file(&shell_clone.dashboard.window, move |path| {
                shell_inner.request(|s| s.select_file(path));
            });
        });
    }
    {
        let shell_clone = shell.clone();
        shell.dashboard.process_button.connect_clicked(move |_| {
            shell_clone.request(AppState::start_processing);
        });
    }
    {
        let shell_clone = shell.clone();
        shell.dashboard.stop_button.connect_clicked(move |_| {
            shell_clone.request(AppState::cancel);
        });
    }
    {
        let shell_clone = shell.clone();
        shell.dashboard.download_button.connect_clicked(move |_| {
            shell_clone.request(AppState::retry_download);
        });
    }

    // Bounded shutdown on close; a worker that will not exit forces the process down
    {
        let state_clone = shell.state.clone();
        shell.dashboard.window.connect_close_request(move |_| {
            if let Err(e) = state_clone.borrow_mut().shutdown() {
                log::error!("{e}, forcing exit");
                std::process::exit(1);
            }
            gtk4::glib::Propagation::Proceed
        });
    }

    shell.dashboard.window.present();

    // Attach backend event handler
    {
        let shell_clone = shell.clone();
        gtk4::glib::spawn_future_local(async move {
            while let Some(event) = backend_bus.next().await {
                let notice = shell_clone.state.borrow_mut().handle_event(event);
                if let Some(notice) = notice {
                    shell_clone.dashboard.show_notice(&notice);
                    if notice.alert {
                        ui::dialogs::show_alert(&shell_clone.dashboard.window, "Error", &notice.message);
                    }
                }
                shell_clone.refresh();
            }
        });
    }

    // Look for the model, download or load it
    shell.request(AppState::startup);
}
