use gtk4::prelude::*;
use libadwaita::prelude::*;

use demucs_stems::{AppState, Notice, TaskState};

/// Handles returned from building the dashboard window.
pub struct DashboardWidgets {
    pub window: libadwaita::ApplicationWindow,
    pub status_label: gtk4::Label,
    pub file_row: libadwaita::ActionRow,
    pub open_button: gtk4::Button,
    pub process_button: gtk4::Button,
    pub stop_button: gtk4::Button,
    pub download_button: gtk4::Button,
    pub progress_bar: gtk4::ProgressBar,
    log_view: gtk4::TextView,
}

impl DashboardWidgets {
    /// Append a timestamped line to the log area.
    pub fn append_log(&self, line: &str) {
        let buffer = self.log_view.buffer();
        let mut end = buffer.end_iter();
        let stamp = chrono::Local::now().format("%H:%M:%S");
        buffer.insert(&mut end, &format!("[{stamp}] {line}\n"));

        let mark = buffer.create_mark(None, &buffer.end_iter(), false);
        self.log_view.scroll_mark_onscreen(&mark);
        buffer.delete_mark(&mark);
    }

    pub fn show_notice(&self, notice: &Notice) {
        self.append_log(&notice.message);
        match notice.progress {
            Some(p) => {
                self.progress_bar.set_fraction(p as f64);
                self.progress_bar
                    .set_text(Some(&format!("{:.0}%", p * 100.0)));
            }
            None => self.progress_bar.set_text(Some(&notice.message)),
        }
    }

    /// Mirror controller state into labels and button sensitivity.
    pub fn sync(&self, state: &AppState) {
        let status = state.status();
        let model = state.model_loaded();
        self.status_label.set_text(status.label());

        self.open_button.set_sensitive(status == TaskState::Ready);
        self.process_button
            .set_sensitive(status == TaskState::Ready && state.selected_file().is_some());
        self.stop_button.set_sensitive(matches!(
            status,
            TaskState::Processing | TaskState::Downloading
        ));
        self.download_button.set_visible(!model);
        self.download_button
            .set_sensitive(matches!(status, TaskState::ModelMissing | TaskState::Error));

        if let Some(path) = state.selected_file() {
            self.file_row.set_subtitle(&path.display().to_string());
        }

        if status.is_busy() {
            self.progress_bar.set_visible(true);
        } else {
            self.progress_bar.set_visible(false);
            self.progress_bar.set_fraction(0.0);
        }
    }
}

/// Build the main dashboard window.
pub fn build_dashboard(app: &libadwaita::Application, initial_status: &str) -> DashboardWidgets {
    let window = libadwaita::ApplicationWindow::builder()
        .application(app)
        .title("Demucs Stems")
        .default_width(640)
        .default_height(560)
        .build();

    let toolbar_view = libadwaita::ToolbarView::new();
    let header = libadwaita::HeaderBar::new();
    toolbar_view.add_top_bar(&header);

    let content = gtk4::Box::new(gtk4::Orientation::Vertical, 0);
    content.set_margin_start(16);
    content.set_margin_end(16);
    content.set_margin_top(12);
    content.set_margin_bottom(12);

    // --- Status group ---
    let status_group = libadwaita::PreferencesGroup::new();
    status_group.set_title("Status");

    let status_row = libadwaita::ActionRow::builder()
        .title("Current State")
        .build();
    let status_label = gtk4::Label::new(Some(initial_status));
    status_label.add_css_class("dim-label");
    status_row.add_suffix(&status_label);

    let download_button = gtk4::Button::builder()
        .label("Download Model")
        .valign(gtk4::Align::Center)
        .sensitive(false)
        .build();
    status_row.add_suffix(&download_button);
    status_group.add(&status_row);

    content.append(&status_group);
    content.append(&gtk4::Separator::new(gtk4::Orientation::Horizontal));

    // --- Input group ---
    let input_group = libadwaita::PreferencesGroup::new();
    input_group.set_title("Input");
    input_group.set_margin_top(12);

    let file_row = libadwaita::ActionRow::builder()
        .title("Audio File")
        .subtitle("No file selected (44.1 kHz stereo WAV)")
        .build();
    let open_button = gtk4::Button::builder()
        .label("Open...")
        .valign(gtk4::Align::Center)
        .sensitive(false)
        .build();
    file_row.add_suffix(&open_button);
    input_group.add(&file_row);

    content.append(&input_group);

    let actions = gtk4::Box::new(gtk4::Orientation::Horizontal, 8);
    actions.set_margin_top(12);
    actions.set_halign(gtk4::Align::End);
    let stop_button = gtk4::Button::builder()
        .label("Stop")
        .sensitive(false)
        .build();
    stop_button.add_css_class("destructive-action");
    let process_button = gtk4::Button::builder()
        .label("Separate Stems")
        .sensitive(false)
        .build();
    process_button.add_css_class("suggested-action");
    actions.append(&stop_button);
    actions.append(&process_button);
    content.append(&actions);

    // --- Progress ---
    let progress_bar = gtk4::ProgressBar::new();
    progress_bar.set_margin_top(16);
    progress_bar.set_visible(false);
    progress_bar.set_show_text(true);
    content.append(&progress_bar);

    // --- Log ---
    let log_group = libadwaita::PreferencesGroup::new();
    log_group.set_title("Log");
    log_group.set_margin_top(12);
    let log_view = gtk4::TextView::builder()
        .editable(false)
        .cursor_visible(false)
        .monospace(true)
        .wrap_mode(gtk4::WrapMode::WordChar)
        .build();
    let log_scroll = gtk4::ScrolledWindow::builder()
        .hscrollbar_policy(gtk4::PolicyType::Never)
        .min_content_height(180)
        .vexpand(true)
        .child(&log_view)
        .build();
    log_group.add(&log_scroll);
    content.append(&log_group);

    toolbar_view.set_content(Some(&content));
    window.set_content(Some(&toolbar_view));

    DashboardWidgets {
        window,
        status_label,
        file_row,
        open_button,
        process_button,
        stop_button,
        download_button,
        progress_bar,
        log_view,
    }
}
